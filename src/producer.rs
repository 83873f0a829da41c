//! Topic producer
//!
//! Enqueues messages for one topic, applying the topic's first-process delay,
//! and publishes a topic signal once the rows are committed.
//!
//! ```rust
//! use std::sync::Arc;
//! use tasker_queue::config::TopicConfig;
//! use tasker_queue::models::Partition;
//! use tasker_queue::notify::NoopPublisher;
//! use tasker_queue::producer::TopicProducer;
//! use tasker_queue::storage::InMemoryQueueStore;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(InMemoryQueueStore::default());
//! let producer =
//!     TopicProducer::new(&TopicConfig::new("emails"), store.clone(), Arc::new(NoopPublisher))
//!         .unwrap();
//!
//! let id = producer.send("welcome:42").await.unwrap();
//! assert_eq!(store.partition_of(id), Some(Partition::Pending));
//! # });
//! ```

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::TopicConfig;
use crate::error::Result;
use crate::models::NewMessage;
use crate::notify::TopicPublisher;
use crate::storage::QueueStore;

#[derive(Clone)]
pub struct TopicProducer {
    topic: String,
    first_process_delay: Option<Duration>,
    store: Arc<dyn QueueStore>,
    publisher: Arc<dyn TopicPublisher>,
}

impl std::fmt::Debug for TopicProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopicProducer")
            .field("topic", &self.topic)
            .field("first_process_delay", &self.first_process_delay)
            .finish()
    }
}

impl TopicProducer {
    pub fn new(
        config: &TopicConfig,
        store: Arc<dyn QueueStore>,
        publisher: Arc<dyn TopicPublisher>,
    ) -> Result<Self> {
        crate::config::validate_topic(&config.topic)?;
        Ok(Self {
            topic: config.topic.clone(),
            first_process_delay: config.first_process_delay(),
            store,
            publisher,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn first_process_delay(&self) -> Option<Duration> {
        self.first_process_delay
    }

    pub async fn send<S: Into<String>>(&self, payload: S) -> Result<i64> {
        self.send_message(NewMessage::new(payload)).await
    }

    pub async fn send_with_priority<S: Into<String>>(
        &self,
        payload: S,
        priority: i32,
    ) -> Result<i64> {
        self.send_message(NewMessage::new(payload).with_priority(priority))
            .await
    }

    /// Serialize `value` as JSON and send it
    pub async fn send_json<T: Serialize>(&self, value: &T) -> Result<i64> {
        self.send_message(NewMessage::json(value)?).await
    }

    pub async fn send_message(&self, message: NewMessage) -> Result<i64> {
        let id = self
            .store
            .enqueue(&self.topic, message, self.first_process_delay)
            .await?;
        self.signal().await;
        Ok(id)
    }

    /// Send many messages in one statement
    pub async fn send_batch(&self, messages: Vec<NewMessage>) -> Result<Vec<i64>> {
        let ids = self
            .store
            .enqueue_batch(&self.topic, messages, self.first_process_delay)
            .await?;
        self.signal().await;
        Ok(ids)
    }

    // Delayed rows are invisible until the sweep moves them, which signals then
    async fn signal(&self) {
        if self.first_process_delay.is_some() {
            return;
        }
        if let Err(e) = self.publisher.publish_topic(&self.topic).await {
            warn!(topic = %self.topic, error = %e, "Failed to publish topic signal after enqueue");
        }
    }
}
