use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, TryAcquireError};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{Acknowledger, TopicHandler};
use super::registry::{TopicEntry, TopicRegistry};
use crate::config::TopicConfig;
use crate::error::Result;
use crate::notify::{TopicEventHandler, TopicPublisher};
use crate::storage::QueueStore;

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub signals_received: u64,
    /// No free permit; an active drain loop will pick the work up
    pub signals_coalesced: u64,
    /// No consumer registered for the topic
    pub signals_unrouted: u64,
    /// Arrived after shutdown began
    pub signals_rejected: u64,
    pub drain_loops_started: u64,
    pub drain_loops_finished: u64,
    /// Restarted because a signal landed while the loop made its final, empty claim
    pub drain_loops_restarted: u64,
    pub claim_errors: u64,
    pub messages_claimed: u64,
    pub handler_invocations: u64,
    pub handler_errors: u64,
    pub handler_panics: u64,
}

#[derive(Debug, Default)]
struct Counters {
    signals_received: AtomicU64,
    signals_coalesced: AtomicU64,
    signals_unrouted: AtomicU64,
    signals_rejected: AtomicU64,
    drain_loops_started: AtomicU64,
    drain_loops_finished: AtomicU64,
    drain_loops_restarted: AtomicU64,
    claim_errors: AtomicU64,
    messages_claimed: AtomicU64,
    handler_invocations: AtomicU64,
    handler_errors: AtomicU64,
    handler_panics: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct Inner {
    dispatcher_id: Uuid,
    registry: Arc<TopicRegistry>,
    store: Arc<dyn QueueStore>,
    accepting: AtomicBool,
    counters: Counters,
}

/// Turns topic signals into bounded draining of each topic
///
/// Each topic has `concurrency` permits. A signal starts a drain loop only
/// if it can take a permit without waiting; otherwise it is dropped, since
/// every running drain loop keeps claiming until the topic is empty. A loop
/// that finds the topic empty checks the topic's signal flag after releasing
/// its permit, so a signal arriving during that last claim is not lost.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("dispatcher_id", &self.inner.dispatcher_id)
            .field("topics", &self.inner.registry.len())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<TopicRegistry>, store: Arc<dyn QueueStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher_id: Uuid::new_v4(),
                registry,
                store,
                accepting: AtomicBool::new(true),
                counters: Counters::default(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.inner.registry
    }

    /// Register a consumer for a topic
    ///
    /// Fails on duplicate topics and on claim settings the store would reject.
    pub fn register(&self, config: TopicConfig, handler: TopicHandler) -> Result<()> {
        config.validate_for_store(self.inner.store.store_config())?;
        self.inner.registry.register(config, handler).map(|_| ())
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.accepting.load(Ordering::SeqCst)
    }

    /// Signal that `topic` may have pending work
    ///
    /// Never blocks. Must be called from within a Tokio runtime for the
    /// signal to start a drain loop.
    pub fn notify(&self, topic: &str) {
        let counters = &self.inner.counters;
        bump(&counters.signals_received);

        if !self.is_accepting() {
            bump(&counters.signals_rejected);
            debug!(topic = %topic, "Dispatcher shutting down, signal dropped");
            return;
        }

        let Some(entry) = self.inner.registry.get(topic) else {
            bump(&counters.signals_unrouted);
            debug!(topic = %topic, "No consumer registered, signal dropped");
            return;
        };

        entry.signalled.store(true, Ordering::SeqCst);
        start_drain(&self.inner, entry);
    }

    /// Signal every registered topic
    pub fn notify_all(&self) {
        for topic in self.inner.registry.topics() {
            self.notify(&topic);
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DispatcherStats {
            signals_received: load(&c.signals_received),
            signals_coalesced: load(&c.signals_coalesced),
            signals_unrouted: load(&c.signals_unrouted),
            signals_rejected: load(&c.signals_rejected),
            drain_loops_started: load(&c.drain_loops_started),
            drain_loops_finished: load(&c.drain_loops_finished),
            drain_loops_restarted: load(&c.drain_loops_restarted),
            claim_errors: load(&c.claim_errors),
            messages_claimed: load(&c.messages_claimed),
            handler_invocations: load(&c.handler_invocations),
            handler_errors: load(&c.handler_errors),
            handler_panics: load(&c.handler_panics),
        }
    }

    /// Drain loops currently running across all topics
    pub fn active_drain_loops(&self) -> usize {
        self.inner
            .registry
            .entries()
            .iter()
            .map(|entry| entry.active_drain_loops())
            .sum()
    }

    /// Stop accepting signals and wait for drain loops to settle
    ///
    /// Running drain loops finish their current claim round; handlers are
    /// never interrupted. Returns `true` if every loop exited before
    /// `timeout`. Permit pools are closed either way.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        let mut settled = true;

        for entry in self.inner.registry.entries() {
            let concurrency = entry.config.concurrency as u32;
            match tokio::time::timeout_at(deadline, entry.permits.acquire_many(concurrency)).await
            {
                Ok(_) => {}
                Err(_elapsed) => {
                    settled = false;
                    warn!(
                        topic = %entry.topic(),
                        active = entry.active_drain_loops(),
                        "Drain loops still running at shutdown deadline"
                    );
                }
            }
            entry.permits.close();
        }

        info!(
            dispatcher_id = %self.inner.dispatcher_id,
            settled,
            "Dispatcher shut down"
        );
        settled
    }
}

impl TopicEventHandler for Dispatcher {
    fn on_topic_ready(&self, topic: &str) {
        self.notify(topic);
    }
}

/// In-process delivery only, for engines running without LISTEN/NOTIFY
#[async_trait]
impl TopicPublisher for Dispatcher {
    async fn publish(&self, topics: &[String]) -> Result<()> {
        for topic in topics {
            self.notify(topic);
        }
        Ok(())
    }
}

/// Spawn a drain loop if a permit is free. Returns whether one was started.
fn start_drain(inner: &Arc<Inner>, entry: Arc<TopicEntry>) -> bool {
    let counters = &inner.counters;
    let topic = entry.topic();

    let permit = match Arc::clone(&entry.permits).try_acquire_owned() {
        Ok(permit) => permit,
        Err(TryAcquireError::NoPermits) => {
            bump(&counters.signals_coalesced);
            debug!(topic = %topic, "All drain loops busy, signal coalesced");
            return false;
        }
        Err(TryAcquireError::Closed) => {
            bump(&counters.signals_rejected);
            return false;
        }
    };

    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(e) => {
            // Dropping the permit here returns the slot
            drop(permit);
            error!(topic = %topic, error = %e, "Cannot start drain loop outside a Tokio runtime");
            return false;
        }
    };

    bump(&counters.drain_loops_started);
    runtime.spawn(drain(Arc::clone(inner), entry, permit));
    true
}

/// Claim and handle until the topic is empty, then release the permit
async fn drain(inner: Arc<Inner>, entry: Arc<TopicEntry>, permit: OwnedSemaphorePermit) {
    let topic = entry.topic();
    let counters = &inner.counters;
    let ack = Acknowledger::new(Arc::clone(&inner.store), topic, entry.config.retry_delay());
    let mut rounds = 0u64;
    let mut exhausted = false;

    debug!(topic = %topic, "Drain loop started");

    loop {
        entry.signalled.store(false, Ordering::SeqCst);
        let messages = match inner
            .store
            .claim(
                topic,
                entry.config.batch_size,
                entry.config.processing_timeout(),
            )
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                bump(&counters.claim_errors);
                error!(
                    topic = %topic,
                    error = %e,
                    transient = e.is_transient(),
                    "Claim failed, ending drain loop"
                );
                break;
            }
        };

        if messages.is_empty() {
            exhausted = true;
            break;
        }
        rounds += 1;
        counters
            .messages_claimed
            .fetch_add(messages.len() as u64, Ordering::Relaxed);

        match &entry.handler {
            TopicHandler::Single(handler) => {
                for message in messages {
                    let id = message.id;
                    invoke(
                        counters,
                        topic,
                        &[id],
                        handler.handle(message, ack.clone()),
                    )
                    .await;
                }
            }
            TopicHandler::Batch(handler) => {
                let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
                invoke(
                    counters,
                    topic,
                    &ids,
                    handler.handle_batch(messages, ack.clone()),
                )
                .await;
            }
        }

        if !inner.accepting.load(Ordering::SeqCst) {
            debug!(topic = %topic, "Shutdown requested, ending drain loop after this round");
            break;
        }
    }

    drop(permit);
    bump(&counters.drain_loops_finished);
    debug!(topic = %topic, rounds, "Drain loop finished");

    if exhausted
        && inner.accepting.load(Ordering::SeqCst)
        && entry.signalled.load(Ordering::SeqCst)
        && start_drain(&inner, Arc::clone(&entry))
    {
        bump(&counters.drain_loops_restarted);
        debug!(topic = %topic, "Signal arrived during final claim, drain loop restarted");
    }
}

async fn invoke<F>(counters: &Counters, topic: &str, ids: &[i64], call: F)
where
    F: Future<Output = anyhow::Result<()>>,
{
    bump(&counters.handler_invocations);

    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            bump(&counters.handler_errors);
            let detail = format!("{e:#}");
            error!(topic = %topic, ids = ?ids, error = %detail, "Handler failed");
        }
        Err(panic) => {
            bump(&counters.handler_panics);
            let panic_msg = if let Some(s) = panic.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(topic = %topic, ids = ?ids, panic_msg = %panic_msg, "Handler panicked");
        }
    }
}
