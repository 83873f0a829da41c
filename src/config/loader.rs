//! Configuration Loader
//!
//! Layers configuration sources with the `config` crate:
//!
//! 1. Built-in defaults ([`QueueEngineConfig::default`])
//! 2. An optional TOML file (explicit path, or `TASKER_QUEUE_CONFIG`)
//! 3. Environment overrides, e.g. `TASKER_QUEUE__SCHEDULER__PERIOD_SECONDS=10`
//!
//! The merged result is validated before it is returned.

use config::{Config, Environment, File, FileFormat};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::QueueEngineConfig;
use crate::error::Result;

/// Environment variable naming a configuration file
pub const CONFIG_PATH_ENV: &str = "TASKER_QUEUE_CONFIG";

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "TASKER_QUEUE";

impl QueueEngineConfig {
    /// Load configuration from defaults, `TASKER_QUEUE_CONFIG` (if set) and the environment
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from);
        Self::load_layers(path.as_deref(), Some(Environment::with_prefix(ENV_PREFIX)))
    }

    /// Load configuration from a TOML file layered over defaults and the environment
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_layers(
            Some(path.as_ref()),
            Some(Environment::with_prefix(ENV_PREFIX)),
        )
    }

    /// Parse configuration from a TOML string layered over defaults only
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(Config::try_from(&QueueEngineConfig::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize::<QueueEngineConfig>()?;

        config.validate()?;
        Ok(config)
    }

    fn load_layers(path: Option<&Path>, environment: Option<Environment>) -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&QueueEngineConfig::default())?);

        if let Some(path) = path {
            debug!(path = %path.display(), "Loading queue configuration file");
            builder = builder.add_source(
                File::from(path)
                    .format(FileFormat::Toml)
                    .required(true),
            );
        }

        if let Some(environment) = environment {
            builder = builder.add_source(environment.separator("__").try_parsing(true));
        }

        let config = builder.build()?.try_deserialize::<QueueEngineConfig>()?;
        config.validate()?;

        debug!(
            notify_enabled = config.notify.enabled,
            scheduler_enabled = config.scheduler.enabled,
            scheduler_period_seconds = config.scheduler.period_seconds,
            retain_completed = config.store.retain_completed,
            topics = config.topics.len(),
            "Queue configuration loaded"
        );

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
shutdown_timeout_ms = 5000

[scheduler]
period_seconds = 10

[store]
retain_completed = false
max_processing_timeout_seconds = 1800

[[topics]]
topic = "orders"
concurrency = 8
batch_size = 25
processing_timeout_ms = 120000
first_process_delay_ms = 500
"#;

    #[test]
    fn test_from_toml_str() {
        let config = QueueEngineConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.shutdown_timeout_ms, 5000);
        assert_eq!(config.scheduler.period_seconds, 10);
        assert!(!config.store.retain_completed);
        assert_eq!(config.store.max_processing_timeout_seconds, Some(1800));
        // untouched sections keep their defaults
        assert!(config.notify.enabled);

        let orders = config.topic("orders").unwrap();
        assert_eq!(orders.concurrency, 8);
        assert_eq!(orders.batch_size, 25);
        assert_eq!(orders.retry_delay_ms, 30_000);
        assert_eq!(
            orders.first_process_delay(),
            Some(std::time::Duration::from_millis(500))
        );
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = QueueEngineConfig::load_layers(Some(file.path()), None).unwrap();
        assert_eq!(config.scheduler.period_seconds, 10);
        assert!(config.topic("orders").is_some());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = QueueEngineConfig::load_layers(Some(Path::new("/nonexistent/queue.toml")), None);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let toml = r#"
[[topics]]
topic = "orders"
concurrency = 0
"#;
        assert!(QueueEngineConfig::from_toml_str(toml).is_err());
    }
}
