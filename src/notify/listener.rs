//! Long-lived LISTEN subscriber with reconnect
//!
//! ```text
//! Stopped ──start──► Connecting ──► Listening ──error──► Reconnecting ──► Listening
//!    ▲                                  │                     │
//!    └──────────────stop────────────────┴─────────────────────┘
//! ```

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::NotifyConfig;
use crate::error::{QueueError, Result};

/// Receives topics extracted from notifications
///
/// Called on the listener task; implementations must not block.
pub trait TopicEventHandler: Send + Sync {
    fn on_topic_ready(&self, topic: &str);
}

/// Subscriber lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Connecting,
    Listening,
    Reconnecting,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerState::Stopped => "stopped",
            ListenerState::Connecting => "connecting",
            ListenerState::Listening => "listening",
            ListenerState::Reconnecting => "reconnecting",
        };
        write!(f, "{name}")
    }
}

/// Statistics about the listener
#[derive(Debug, Clone, Default)]
pub struct ListenerStats {
    pub connected: bool,
    pub events_received: u64,
    pub empty_payloads: u64,
    pub reconnects: u64,
    pub connection_errors: u64,
    pub liveness_checks: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

struct Running {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// LISTEN subscriber forwarding topics to a [`TopicEventHandler`]
pub struct NotifyListener {
    listener_id: Uuid,
    pool: PgPool,
    config: NotifyConfig,
    handler: Arc<dyn TopicEventHandler>,
    state: Arc<RwLock<ListenerState>>,
    stats: Arc<RwLock<ListenerStats>>,
    running: Mutex<Option<Running>>,
}

impl fmt::Debug for NotifyListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyListener")
            .field("listener_id", &self.listener_id)
            .field("channel", &self.config.channel)
            .field("state", &self.state())
            .finish()
    }
}

impl NotifyListener {
    pub fn new(pool: PgPool, config: NotifyConfig, handler: Arc<dyn TopicEventHandler>) -> Self {
        Self {
            listener_id: Uuid::new_v4(),
            pool,
            config,
            handler,
            state: Arc::new(RwLock::new(ListenerState::Stopped)),
            stats: Arc::new(RwLock::new(ListenerStats::default())),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ListenerState {
        *self.state.read()
    }

    pub fn stats(&self) -> ListenerStats {
        self.stats.read().clone()
    }

    /// Spawn the subscriber task
    ///
    /// Returns immediately; connecting happens in the background. Fails if
    /// the listener is already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(QueueError::invalid_state(format!(
                "notify listener is already {}",
                self.state()
            )));
        }

        *self.state.write() = ListenerState::Connecting;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = ListenerTask {
            listener_id: self.listener_id,
            pool: self.pool.clone(),
            config: self.config.clone(),
            handler: Arc::clone(&self.handler),
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
        };
        let handle = tokio::spawn(task.run(shutdown_rx));

        info!(
            listener_id = %self.listener_id,
            channel = %self.config.channel,
            "Notify listener started"
        );
        *running = Some(Running { shutdown_tx, handle });
        Ok(())
    }

    /// Signal the subscriber task to stop and wait for it to exit
    pub async fn stop(&self) -> Result<()> {
        let running = self.running.lock().take();
        let Some(Running {
            shutdown_tx,
            handle,
        }) = running
        else {
            return Err(QueueError::invalid_state("notify listener is not running"));
        };

        let _ = shutdown_tx.send(true);
        if let Err(e) = handle.await {
            error!(listener_id = %self.listener_id, error = %e, "Notify listener task failed");
        }

        *self.state.write() = ListenerState::Stopped;
        self.stats.write().connected = false;
        info!(listener_id = %self.listener_id, "Notify listener stopped");
        Ok(())
    }
}

enum Disconnect {
    Shutdown,
    Lost,
}

struct ListenerTask {
    listener_id: Uuid,
    pool: PgPool,
    config: NotifyConfig,
    handler: Arc<dyn TopicEventHandler>,
    state: Arc<RwLock<ListenerState>>,
    stats: Arc<RwLock<ListenerStats>>,
}

impl ListenerTask {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut reconnect_delay = self.config.reconnect_delay();

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let connected = tokio::select! {
                result = self.connect() => result,
                _ = shutdown_rx.changed() => break,
            };

            let listener = match connected {
                Ok(listener) => listener,
                Err(e) => {
                    self.record_error();
                    warn!(
                        listener_id = %self.listener_id,
                        error = %e,
                        retry_in_ms = reconnect_delay.as_millis() as u64,
                        "Notify listener failed to connect"
                    );
                    if !self.backoff(&mut reconnect_delay, &mut shutdown_rx).await {
                        break;
                    }
                    continue;
                }
            };

            reconnect_delay = self.config.reconnect_delay();
            self.set_state(ListenerState::Listening);
            self.stats.write().connected = true;
            info!(
                listener_id = %self.listener_id,
                channel = %self.config.channel,
                "Listening for topic notifications"
            );

            match self.listen(listener, &mut shutdown_rx).await {
                Disconnect::Shutdown => break,
                Disconnect::Lost => {
                    {
                        let mut stats = self.stats.write();
                        stats.connected = false;
                        stats.reconnects += 1;
                    }
                    if !self.backoff(&mut reconnect_delay, &mut shutdown_rx).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ListenerState::Stopped);
        self.stats.write().connected = false;
        debug!(listener_id = %self.listener_id, "Notify listener loop exited");
    }

    async fn connect(&self) -> std::result::Result<PgListener, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.config.channel).await?;
        Ok(listener)
    }

    async fn listen(
        &self,
        mut listener: PgListener,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        let wait_timeout = self.config.wait_timeout();

        loop {
            let received = tokio::select! {
                result = tokio::time::timeout(wait_timeout, listener.try_recv()) => result,
                _ = shutdown_rx.changed() => return Disconnect::Shutdown,
            };

            match received {
                Ok(Ok(Some(notification))) => self.dispatch(notification.payload()),
                Ok(Ok(None)) => {
                    self.record_error();
                    warn!(listener_id = %self.listener_id, "Notify connection closed");
                    return Disconnect::Lost;
                }
                Ok(Err(e)) => {
                    self.record_error();
                    warn!(listener_id = %self.listener_id, error = %e, "Notify receive failed");
                    return Disconnect::Lost;
                }
                Err(_) => {
                    self.stats.write().liveness_checks += 1;
                    if let Err(e) = sqlx::query("SELECT 1").execute(&mut listener).await {
                        self.record_error();
                        warn!(
                            listener_id = %self.listener_id,
                            error = %e,
                            "Notify connection failed liveness check"
                        );
                        return Disconnect::Lost;
                    }
                }
            }
        }
    }

    fn dispatch(&self, payload: &str) {
        let topic = payload;
        {
            let mut stats = self.stats.write();
            stats.events_received += 1;
            stats.last_event_at = Some(Utc::now());
            if topic.is_empty() {
                stats.empty_payloads += 1;
            }
        }

        if topic.is_empty() {
            warn!(listener_id = %self.listener_id, "Ignoring notification with empty payload");
            return;
        }

        debug!(listener_id = %self.listener_id, topic = %topic, "Topic notification received");
        self.handler.on_topic_ready(topic);
    }

    /// Sleep before the next connection attempt. Returns false on shutdown.
    async fn backoff(
        &self,
        delay: &mut Duration,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> bool {
        self.set_state(ListenerState::Reconnecting);

        let wait = *delay;
        *delay = (*delay * 2).min(self.config.max_reconnect_delay());

        tokio::select! {
            _ = tokio::time::sleep(wait) => !*shutdown_rx.borrow(),
            _ = shutdown_rx.changed() => false,
        }
    }

    fn set_state(&self, state: ListenerState) {
        *self.state.write() = state;
    }

    fn record_error(&self) {
        let mut stats = self.stats.write();
        stats.connection_errors += 1;
        stats.last_error_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    struct Ignore;

    impl TopicEventHandler for Ignore {
        fn on_topic_ready(&self, _topic: &str) {}
    }

    fn unreachable_listener() -> NotifyListener {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_millis(200))
            .connect_lazy("postgresql://nobody@127.0.0.1:1/none")
            .unwrap();
        let config = NotifyConfig {
            reconnect_delay_ms: 10,
            max_reconnect_delay_ms: 20,
            ..NotifyConfig::default()
        };
        NotifyListener::new(pool, config, Arc::new(Ignore))
    }

    #[tokio::test]
    async fn test_start_stop_state_transitions() {
        let listener = unreachable_listener();
        assert_eq!(listener.state(), ListenerState::Stopped);

        listener.start().unwrap();
        assert_ne!(listener.state(), ListenerState::Stopped);
        assert!(listener.start().is_err());

        listener.stop().await.unwrap();
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(!listener.stats().connected);
        assert!(listener.stop().await.is_err());
    }

    #[tokio::test]
    async fn test_keeps_retrying_unreachable_database() {
        let listener = unreachable_listener();
        listener.start().unwrap();

        let mut waited = Duration::ZERO;
        while listener.stats().connection_errors < 2 && waited < Duration::from_secs(10) {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += Duration::from_millis(20);
        }
        assert!(listener.stats().connection_errors >= 2);
        assert_ne!(listener.state(), ListenerState::Listening);

        listener.stop().await.unwrap();
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ListenerState::Reconnecting.to_string(), "reconnecting");
    }
}
