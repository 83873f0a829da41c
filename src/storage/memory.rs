//! # In-Memory Storage Engine
//!
//! A [`QueueStore`] that keeps the five partitions in process memory. It
//! follows the same move semantics as [`super::PgQueueStore`] and is used to
//! exercise the dispatcher, scheduler and producer without a database.
//!
//! A single mutex guards all partitions, so every operation is atomic. The
//! advisory lock is modelled by a separate async mutex that tests can hold
//! through [`InMemoryQueueStore::hold_reclaim_lock`] to play the part of a
//! second engine process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use super::{
    deadline, validate_batch, validate_claim, validate_delay, validate_enqueue, AdvisoryLockKey,
    QueueStore,
};
use crate::config::StoreConfig;
use crate::error::{QueueError, Result};
use crate::models::{Message, NewMessage, Partition, QueueMetrics};

#[derive(Debug, Default)]
struct Partitions {
    next_id: i64,
    pending: BTreeMap<i64, Message>,
    invisible: BTreeMap<i64, Message>,
    processing: BTreeMap<i64, Message>,
    complete: BTreeMap<i64, Message>,
    dead: BTreeMap<i64, Message>,
}

impl Partitions {
    fn get(&self, partition: Partition) -> &BTreeMap<i64, Message> {
        match partition {
            Partition::Pending => &self.pending,
            Partition::Invisible => &self.invisible,
            Partition::Processing => &self.processing,
            Partition::Complete => &self.complete,
            Partition::Dead => &self.dead,
        }
    }

    fn insert(
        &mut self,
        topic: &str,
        message: NewMessage,
        now: DateTime<Utc>,
        visible_time: Option<DateTime<Utc>>,
    ) -> i64 {
        self.next_id += 1;
        let id = self.next_id;
        let row = Message {
            id,
            create_time: now,
            topic: topic.to_string(),
            priority: message.priority,
            payload: message.payload,
            attempt: 0,
            visible_time,
            timeout_time: None,
        };
        match visible_time {
            Some(_) => self.invisible.insert(id, row),
            None => self.pending.insert(id, row),
        };
        id
    }

    fn take_processing(&mut self, ids: &[i64]) -> Vec<Message> {
        let unique: BTreeSet<i64> = ids.iter().copied().collect();
        unique
            .into_iter()
            .filter_map(|id| self.processing.remove(&id))
            .map(|mut row| {
                row.timeout_time = None;
                row
            })
            .collect()
    }
}

/// In-memory storage engine for tests and local development
#[derive(Debug)]
pub struct InMemoryQueueStore {
    config: StoreConfig,
    state: Mutex<Partitions>,
    reclaim_lock: Arc<tokio::sync::Mutex<()>>,
    unavailable: AtomicBool,
    claim_calls: AtomicU64,
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

impl InMemoryQueueStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            state: Mutex::new(Partitions::default()),
            reclaim_lock: Arc::new(tokio::sync::Mutex::new(())),
            unavailable: AtomicBool::new(false),
            claim_calls: AtomicU64::new(0),
        }
    }

    /// Partition currently holding `id`, if any
    pub fn partition_of(&self, id: i64) -> Option<Partition> {
        let state = self.state.lock();
        Partition::ALL
            .into_iter()
            .find(|partition| state.get(*partition).contains_key(&id))
    }

    /// Snapshot of the row with `id`, wherever it is
    pub fn get(&self, id: i64) -> Option<Message> {
        let state = self.state.lock();
        Partition::ALL
            .into_iter()
            .find_map(|partition| state.get(partition).get(&id).cloned())
    }

    /// Number of rows in a partition across all topics
    pub fn len(&self, partition: Partition) -> usize {
        self.state.lock().get(partition).len()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        Partition::ALL
            .into_iter()
            .all(|partition| state.get(partition).is_empty())
    }

    /// Total `claim` calls made against this store
    pub fn claim_calls(&self) -> u64 {
        self.claim_calls.load(Ordering::Relaxed)
    }

    /// Hold the reclaim lock as another engine process would
    pub async fn hold_reclaim_lock(&self) -> OwnedMutexGuard<()> {
        self.reclaim_lock.clone().lock_owned().await
    }

    /// Make every operation fail with a database error until reset
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Shift every visible/timeout deadline into the past so the next sweep picks it up
    pub fn expire_deadlines(&self) {
        let past = Utc::now() - chrono::Duration::seconds(1);
        let mut state = self.state.lock();
        for row in state.invisible.values_mut() {
            row.visible_time = Some(past);
        }
        for row in state.processing.values_mut() {
            row.timeout_time = Some(past);
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    fn reclaim_locked(state: &mut Partitions, now: DateTime<Utc>) -> Vec<String> {
        let mut topics = BTreeSet::new();

        let due: Vec<i64> = state
            .invisible
            .values()
            .filter(|row| row.visible_time.is_some_and(|t| t <= now))
            .map(|row| row.id)
            .collect();
        for id in due {
            if let Some(mut row) = state.invisible.remove(&id) {
                row.visible_time = None;
                topics.insert(row.topic.clone());
                state.pending.insert(id, row);
            }
        }

        let timed_out: Vec<i64> = state
            .processing
            .values()
            .filter(|row| row.timeout_time.is_some_and(|t| t <= now))
            .map(|row| row.id)
            .collect();
        for id in timed_out {
            if let Some(mut row) = state.processing.remove(&id) {
                row.timeout_time = None;
                topics.insert(row.topic.clone());
                state.pending.insert(id, row);
            }
        }

        topics.into_iter().collect()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    fn store_config(&self) -> &StoreConfig {
        &self.config
    }

    async fn enqueue(
        &self,
        topic: &str,
        message: NewMessage,
        delay: Option<Duration>,
    ) -> Result<i64> {
        validate_enqueue(topic, delay)?;
        self.check_available()?;
        let now = Utc::now();
        let visible_time = delay.map(|d| deadline(now, d)).transpose()?;
        Ok(self.state.lock().insert(topic, message, now, visible_time))
    }

    async fn enqueue_batch(
        &self,
        topic: &str,
        messages: Vec<NewMessage>,
        delay: Option<Duration>,
    ) -> Result<Vec<i64>> {
        validate_enqueue(topic, delay)?;
        validate_batch(&messages)?;
        self.check_available()?;
        let now = Utc::now();
        let visible_time = delay.map(|d| deadline(now, d)).transpose()?;

        let mut state = self.state.lock();
        Ok(messages
            .into_iter()
            .map(|message| state.insert(topic, message, now, visible_time))
            .collect())
    }

    async fn claim(
        &self,
        topic: &str,
        max_count: usize,
        processing_timeout: Duration,
    ) -> Result<Vec<Message>> {
        validate_claim(&self.config, topic, max_count, processing_timeout)?;
        self.claim_calls.fetch_add(1, Ordering::Relaxed);
        self.check_available()?;
        let timeout_time = deadline(Utc::now(), processing_timeout)?;

        let mut state = self.state.lock();
        let mut candidates: Vec<(i32, i64)> = state
            .pending
            .values()
            .filter(|row| row.topic == topic)
            .map(|row| (row.priority, row.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        candidates.truncate(max_count);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(mut row) = state.pending.remove(&id) {
                row.attempt += 1;
                row.timeout_time = Some(timeout_time);
                state.processing.insert(id, row.clone());
                claimed.push(row);
            }
        }

        if !claimed.is_empty() {
            debug!(topic = %topic, claimed = claimed.len(), "Claimed messages");
        }
        Ok(claimed)
    }

    async fn complete(&self, ids: &[i64]) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let rows = state.take_processing(ids);
        let count = rows.len() as u64;
        if self.config.retain_completed {
            for row in rows {
                state.complete.insert(row.id, row);
            }
        }
        Ok(count)
    }

    async fn dead(&self, ids: &[i64]) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        let rows = state.take_processing(ids);
        let count = rows.len() as u64;
        for row in rows {
            state.dead.insert(row.id, row);
        }
        Ok(count)
    }

    async fn retry(&self, ids: &[i64], delay: Option<Duration>) -> Result<u64> {
        validate_delay(delay)?;
        self.check_available()?;
        let visible_time = delay.map(|d| deadline(Utc::now(), d)).transpose()?;

        let mut state = self.state.lock();
        let rows = state.take_processing(ids);
        let count = rows.len() as u64;
        for mut row in rows {
            row.visible_time = visible_time;
            match visible_time {
                Some(_) => state.invisible.insert(row.id, row),
                None => state.pending.insert(row.id, row),
            };
        }
        Ok(count)
    }

    async fn delete(&self, ids: &[i64]) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.lock();
        Ok(state.take_processing(ids).len() as u64)
    }

    async fn reclaim_due(&self) -> Result<Vec<String>> {
        self.check_available()?;
        let mut state = self.state.lock();
        Ok(Self::reclaim_locked(&mut state, Utc::now()))
    }

    async fn try_reclaim_due_exclusive(
        &self,
        _key: AdvisoryLockKey,
    ) -> Result<Option<Vec<String>>> {
        self.check_available()?;
        let Ok(_guard) = self.reclaim_lock.try_lock() else {
            return Ok(None);
        };
        let mut state = self.state.lock();
        Ok(Some(Self::reclaim_locked(&mut state, Utc::now())))
    }

    async fn queue_metrics(&self, topic: &str) -> Result<QueueMetrics> {
        self.check_available()?;
        let state = self.state.lock();
        let count = |partition: Partition| {
            state
                .get(partition)
                .values()
                .filter(|row| row.topic == topic)
                .count() as i64
        };

        let oldest_pending_age_seconds = state
            .pending
            .values()
            .filter(|row| row.topic == topic)
            .map(|row| row.create_time)
            .min()
            .map(|oldest| (Utc::now() - oldest).num_seconds());

        Ok(QueueMetrics {
            topic: topic.to_string(),
            pending: count(Partition::Pending),
            invisible: count(Partition::Invisible),
            processing: count(Partition::Processing),
            complete: count(Partition::Complete),
            dead: count(Partition::Dead),
            oldest_pending_age_seconds,
        })
    }
}
