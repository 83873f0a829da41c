//! # Reclaim Scheduler
//!
//! Periodic sweep that guarantees forward progress when notifications are
//! lost. Each cycle, in one transaction guarded by a non-blocking advisory
//! lock, moves due invisible rows and timed-out processing rows back to
//! pending. For every topic that received rows it publishes a notification
//! for other processes and signals the local dispatcher directly.
//!
//! Only one process in the cluster sweeps per cycle; the others find the
//! lock taken and skip. The lock is transaction-scoped, so it is released
//! on commit, rollback or connection loss.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{QueueError, Result};
use crate::notify::TopicPublisher;
use crate::storage::{AdvisoryLockKey, QueueStore};

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub cycles: u64,
    /// Another process held the sweep lock
    pub cycles_skipped: u64,
    pub topics_notified: u64,
    pub errors: u64,
    pub publish_errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    cycles: AtomicU64,
    cycles_skipped: AtomicU64,
    topics_notified: AtomicU64,
    errors: AtomicU64,
    publish_errors: AtomicU64,
}

struct Core {
    scheduler_id: Uuid,
    store: Arc<dyn QueueStore>,
    publisher: Arc<dyn TopicPublisher>,
    dispatcher: Dispatcher,
    lock_key: AdvisoryLockKey,
    wake_local_topics: bool,
    counters: Counters,
}

impl Core {
    async fn run_cycle(&self) -> Result<Option<Vec<String>>> {
        self.counters.cycles.fetch_add(1, Ordering::Relaxed);

        let reclaimed = self
            .store
            .try_reclaim_due_exclusive(self.lock_key)
            .await;

        let outcome = match reclaimed {
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
            Ok(None) => {
                self.counters.cycles_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(scheduler_id = %self.scheduler_id, "Sweep lock held elsewhere, skipping cycle");
                Ok(None)
            }
            Ok(Some(topics)) => {
                self.signal(&topics).await;
                Ok(Some(topics))
            }
        };

        if self.wake_local_topics {
            self.dispatcher.notify_all();
        }
        outcome
    }

    async fn signal(&self, topics: &[String]) {
        if topics.is_empty() {
            return;
        }

        if let Err(e) = self.publisher.publish(topics).await {
            self.counters.publish_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                scheduler_id = %self.scheduler_id,
                error = %e,
                topics = ?topics,
                "Failed to publish reclaimed topics"
            );
        }

        for topic in topics {
            self.dispatcher.notify(topic);
        }
        self.counters
            .topics_notified
            .fetch_add(topics.len() as u64, Ordering::Relaxed);

        info!(
            scheduler_id = %self.scheduler_id,
            topics = ?topics,
            "Reclaimed messages and signalled topics"
        );
    }

    fn stats(&self) -> SchedulerStats {
        let c = &self.counters;
        SchedulerStats {
            cycles: c.cycles.load(Ordering::Relaxed),
            cycles_skipped: c.cycles_skipped.load(Ordering::Relaxed),
            topics_notified: c.topics_notified.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            publish_errors: c.publish_errors.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Periodic, cluster-wide reclaim sweep
pub struct Scheduler {
    core: Arc<Core>,
    period: Duration,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("scheduler_id", &self.core.scheduler_id)
            .field("period", &self.period)
            .field("lock_key", &self.core.lock_key)
            .field("is_running", &self.is_running())
            .finish()
    }
}

impl Scheduler {
    pub fn new(
        config: &SchedulerConfig,
        store: Arc<dyn QueueStore>,
        publisher: Arc<dyn TopicPublisher>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            core: Arc::new(Core {
                scheduler_id: Uuid::new_v4(),
                store,
                publisher,
                dispatcher,
                lock_key: AdvisoryLockKey::new(config.engine_id, config.scheduler_id),
                wake_local_topics: config.wake_local_topics,
                counters: Counters::default(),
            }),
            period: config.period(),
            running: Mutex::new(None),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.core.stats()
    }

    /// Run one sweep now
    ///
    /// Returns `None` when another process holds the sweep lock, otherwise
    /// the topics that received reclaimed rows.
    pub async fn run_once(&self) -> Result<Option<Vec<String>>> {
        self.core.run_cycle().await
    }

    /// Start the periodic sweep in a background task
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(QueueError::invalid_state("scheduler is already running"));
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        let period = self.period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = shutdown_rx.changed() => break,
                }

                if let Err(e) = core.run_cycle().await {
                    error!(
                        scheduler_id = %core.scheduler_id,
                        error = %e,
                        "Reclaim sweep failed, retrying next period"
                    );
                }
            }

            debug!(scheduler_id = %core.scheduler_id, "Scheduler loop exited");
        });

        info!(
            scheduler_id = %self.core.scheduler_id,
            period = ?self.period,
            engine_id = self.core.lock_key.engine_id,
            sub_id = self.core.lock_key.sub_id,
            "Scheduler started"
        );
        *running = Some(Running {
            shutdown_tx,
            handle,
        });
        Ok(())
    }

    /// Stop the sweep, waiting for an in-progress cycle to finish
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(Running {
            shutdown_tx,
            handle,
        }) = running
        else {
            return Err(QueueError::invalid_state("scheduler is not running"));
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!(scheduler_id = %self.core.scheduler_id, error = %e, "Scheduler task failed");
        }
        info!(scheduler_id = %self.core.scheduler_id, "Scheduler stopped");
        Ok(())
    }
}
