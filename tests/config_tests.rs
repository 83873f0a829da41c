//! Configuration file and constant tests

use std::time::Duration;
use tasker_queue::config::QueueEngineConfig;
use tasker_queue::constants;

const EXAMPLE: &str = include_str!("../config/tasker-queue.example.toml");

#[test]
fn test_example_config_parses() {
    let config = QueueEngineConfig::from_toml_str(EXAMPLE).unwrap();

    assert_eq!(config.notify.channel, constants::NOTIFY_CHANNEL);
    assert_eq!(config.scheduler.engine_id, constants::DEFAULT_ENGINE_LOCK_ID);
    assert_eq!(config.scheduler.scheduler_id, constants::DEFAULT_SCHEDULER_LOCK_ID);
    assert_eq!(config.topics.len(), 2);

    let reports = config.topic("reports").unwrap();
    assert_eq!(reports.first_process_delay(), Some(Duration::from_secs(5)));
    assert_eq!(reports.batch_size, 1);
    assert_eq!(config.topic("emails").unwrap().concurrency, 4);
}

#[test]
fn test_duplicate_topics_rejected() {
    let toml = r#"
[[topics]]
topic = "emails"

[[topics]]
topic = "emails"
"#;
    assert!(QueueEngineConfig::from_toml_str(toml).is_err());
}

#[test]
fn test_constants() {
    assert!(constants::MAX_TOPIC_LENGTH < constants::MAX_NOTIFY_PAYLOAD_BYTES);
    assert!(constants::NOTIFY_CHANNEL.len() <= 63);
    assert_eq!(constants::batch_size::MAX, 5000);
}
