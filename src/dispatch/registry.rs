use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

use super::handler::TopicHandler;
use crate::config::TopicConfig;
use crate::error::{QueueError, Result};

/// One registered consumer: its settings, handler and drain-loop permits
#[derive(Debug)]
pub struct TopicEntry {
    pub config: TopicConfig,
    pub handler: TopicHandler,
    pub(crate) permits: Arc<Semaphore>,
    /// Set by every signal, cleared by a drain loop before each claim
    pub(crate) signalled: AtomicBool,
}

impl TopicEntry {
    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Drain loops currently holding a permit
    pub fn active_drain_loops(&self) -> usize {
        self.config
            .concurrency
            .saturating_sub(self.permits.available_permits())
    }
}

/// Topic → consumer mapping owned by one engine instance
///
/// Append-only: a topic can be registered once and is never removed.
#[derive(Debug, Default)]
pub struct TopicRegistry {
    entries: DashMap<String, Arc<TopicEntry>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer, failing if the topic already has one
    pub fn register(&self, config: TopicConfig, handler: TopicHandler) -> Result<Arc<TopicEntry>> {
        config.validate()?;

        match self.entries.entry(config.topic.clone()) {
            Entry::Occupied(_) => Err(QueueError::duplicate_topic(&config.topic)),
            Entry::Vacant(vacant) => {
                info!(
                    topic = %config.topic,
                    concurrency = config.concurrency,
                    batch_size = config.batch_size,
                    handler = ?handler,
                    "Registered topic consumer"
                );
                let entry = Arc::new(TopicEntry {
                    permits: Arc::new(Semaphore::new(config.concurrency)),
                    signalled: AtomicBool::new(false),
                    config,
                    handler,
                });
                vacant.insert(Arc::clone(&entry));
                Ok(entry)
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<Arc<TopicEntry>> {
        self.entries.get(topic).map(|entry| Arc::clone(entry.value()))
    }

    /// Registered topics, sorted
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub fn entries(&self) -> Vec<Arc<TopicEntry>> {
        self.entries.iter().map(|e| Arc::clone(e.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
