use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::BTreeSet;
use tracing::{debug, error, instrument};

use super::TopicPublisher;
use crate::config::NotifyConfig;
use crate::constants::MAX_NOTIFY_PAYLOAD_BYTES;
use crate::database::UnitOfWork;
use crate::error::{QueueError, Result};

/// Publishes topic signals with `pg_notify`
#[derive(Clone)]
pub struct PgNotifySender {
    pool: PgPool,
    channel: String,
}

impl std::fmt::Debug for PgNotifySender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgNotifySender")
            .field("channel", &self.channel)
            .field("pool", &"PgPool")
            .finish()
    }
}

impl PgNotifySender {
    pub fn new(pool: PgPool, config: &NotifyConfig) -> Self {
        Self {
            pool,
            channel: config.channel.clone(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Defer publishing until `uow` commits
    ///
    /// Nothing is sent if the unit of work rolls back or is dropped. A failed
    /// publish after commit is logged; the enqueued rows are already durable
    /// and the next sweep re-signals their topic.
    pub fn publish_after_commit(&self, uow: &mut UnitOfWork, topics: &[String]) -> Result<()> {
        let topics = Self::distinct(topics)?;
        if topics.is_empty() {
            return Ok(());
        }

        let sender = self.clone();
        uow.after_commit(async move {
            if let Err(e) = sender.send(&topics).await {
                error!(error = %e, topics = ?topics, "Failed to publish after commit");
            }
        });
        Ok(())
    }

    fn distinct(topics: &[String]) -> Result<Vec<String>> {
        let unique: BTreeSet<&String> = topics.iter().collect();
        unique
            .into_iter()
            .map(|topic| {
                if topic.len() > MAX_NOTIFY_PAYLOAD_BYTES {
                    return Err(QueueError::validation(format!(
                        "topic of {} bytes exceeds the notification payload limit",
                        topic.len()
                    )));
                }
                Ok(topic.clone())
            })
            .collect()
    }

    #[instrument(skip(self), fields(channel = %self.channel))]
    async fn send(&self, topics: &[String]) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, t) FROM UNNEST($2::TEXT[]) AS t")
            .bind(&self.channel)
            .bind(topics)
            .execute(&self.pool)
            .await?;

        debug!(count = topics.len(), "Published topic notifications");
        Ok(())
    }
}

#[async_trait]
impl TopicPublisher for PgNotifySender {
    async fn publish(&self, topics: &[String]) -> Result<()> {
        let topics = Self::distinct(topics)?;
        if topics.is_empty() {
            return Ok(());
        }
        self.send(&topics).await
    }
}

/// Publisher that drops every signal (notifications disabled)
#[derive(Debug, Clone, Default)]
pub struct NoopPublisher;

#[async_trait]
impl TopicPublisher for NoopPublisher {
    async fn publish(&self, topics: &[String]) -> Result<()> {
        debug!(count = topics.len(), "Notifications disabled, not publishing");
        Ok(())
    }
}
