//! # Storage Engine
//!
//! The only component that reads or mutates the queue partitions. Every
//! operation is one transaction: it either fully applies or fully rolls back.
//!
//! ## State machine
//!
//! ```text
//!            enqueue                 claim
//!  producer ────────► Pending ─────────────────► Processing ──► Complete | Dead | (deleted)
//!     │                  ▲  ▲                       │   │
//!     │ enqueue(delay)   │  └── reclaim (timeout) ──┘   │ retry(None)
//!     ▼                  │                              │
//!  Invisible ────────────┘ reclaim (visible)            │
//!     ▲                                                 │
//!     └──────────────────── retry(Some(delay)) ─────────┘
//! ```
//!
//! Moves are delete-from-source plus insert-into-destination in one
//! statement, never a status flag flip, so a concurrent claim scanning the
//! pending partition can never observe a message in two places.
//!
//! Every time comparison uses the store's own clock: `NOW()` of the database
//! for PostgreSQL, so callers never pass timestamps in.
//!
//! Outcome operations (`complete`, `dead`, `retry`, `delete`) given unknown
//! identifiers match zero rows and return `Ok(0)`; that usually means the
//! sweep already reclaimed the message after its processing timeout.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::config::{validate_topic, StoreConfig};
use crate::error::{QueueError, Result};
use crate::models::{Message, NewMessage, QueueMetrics};

pub use memory::InMemoryQueueStore;
pub use postgres::PgQueueStore;

/// Two-part key for a transaction-scoped advisory lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdvisoryLockKey {
    pub engine_id: i32,
    pub sub_id: i32,
}

impl AdvisoryLockKey {
    pub fn new(engine_id: i32, sub_id: i32) -> Self {
        Self { engine_id, sub_id }
    }
}

/// Storage engine operations
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Limits every claim made against this store is checked against
    fn store_config(&self) -> &StoreConfig;

    /// Insert one message into pending, or into invisible when `delay` is given
    async fn enqueue(
        &self,
        topic: &str,
        message: NewMessage,
        delay: Option<Duration>,
    ) -> Result<i64>;

    /// Insert many messages for one topic in a single statement
    async fn enqueue_batch(
        &self,
        topic: &str,
        messages: Vec<NewMessage>,
        delay: Option<Duration>,
    ) -> Result<Vec<i64>>;

    /// Claim up to `max_count` pending messages, highest priority first then oldest id
    ///
    /// Claimed messages move to processing with `attempt + 1` and
    /// `timeout_time = now + processing_timeout`. Returns an empty vector
    /// when nothing is available.
    async fn claim(
        &self,
        topic: &str,
        max_count: usize,
        processing_timeout: Duration,
    ) -> Result<Vec<Message>>;

    /// Processing → complete (or hard delete when completed messages are not retained)
    async fn complete(&self, ids: &[i64]) -> Result<u64>;

    /// Processing → dead
    async fn dead(&self, ids: &[i64]) -> Result<u64>;

    /// Processing → pending, or → invisible when `delay` is given. Attempt is preserved.
    async fn retry(&self, ids: &[i64], delay: Option<Duration>) -> Result<u64>;

    /// Hard delete from processing
    async fn delete(&self, ids: &[i64]) -> Result<u64>;

    /// Move due invisible rows and timed-out processing rows to pending
    ///
    /// "Due" is judged by the store's clock. Returns the distinct topics that
    /// received at least one row.
    async fn reclaim_due(&self) -> Result<Vec<String>>;

    /// `reclaim_due` guarded by a non-blocking transaction-scoped advisory lock
    ///
    /// Returns `None` when another session holds the lock.
    async fn try_reclaim_due_exclusive(
        &self,
        key: AdvisoryLockKey,
    ) -> Result<Option<Vec<String>>>;

    /// Partition counts for one topic
    async fn queue_metrics(&self, topic: &str) -> Result<QueueMetrics>;
}

pub(crate) fn validate_enqueue(topic: &str, delay: Option<Duration>) -> Result<()> {
    validate_topic(topic).map_err(|e| QueueError::validation(e.to_string()))?;
    validate_delay(delay)
}

pub(crate) fn validate_delay(delay: Option<Duration>) -> Result<()> {
    if delay == Some(Duration::ZERO) {
        return Err(QueueError::validation("delay must be positive when given"));
    }
    Ok(())
}

pub(crate) fn validate_batch(messages: &[NewMessage]) -> Result<()> {
    if messages.is_empty() {
        return Err(QueueError::validation("cannot enqueue an empty batch"));
    }
    Ok(())
}

pub(crate) fn validate_claim(
    config: &StoreConfig,
    topic: &str,
    max_count: usize,
    processing_timeout: Duration,
) -> Result<()> {
    validate_topic(topic).map_err(|e| QueueError::validation(e.to_string()))?;

    if max_count == 0 || max_count > config.max_claim_batch {
        return Err(QueueError::validation(format!(
            "claim max_count must be between 1 and {}, got {}",
            config.max_claim_batch, max_count
        )));
    }
    if processing_timeout.is_zero() {
        return Err(QueueError::validation("processing timeout must be positive"));
    }
    if let Some(max) = config.max_processing_timeout() {
        if processing_timeout > max {
            return Err(QueueError::validation(format!(
                "processing timeout {processing_timeout:?} exceeds the configured maximum {max:?}"
            )));
        }
    }
    Ok(())
}

/// `now + delay` as a timestamp
pub(crate) fn deadline(now: DateTime<Utc>, delay: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .ok_or_else(|| QueueError::validation(format!("delay {delay:?} is out of range")))
}

/// `delay` in whole milliseconds, for database-side `NOW() + interval` arithmetic
pub(crate) fn delay_millis(delay: Duration) -> Result<i64> {
    deadline(Utc::now(), delay)?;
    i64::try_from(delay.as_millis())
        .map_err(|_| QueueError::validation(format!("delay {delay:?} is out of range")))
}
