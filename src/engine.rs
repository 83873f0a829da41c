//! # Queue Engine
//!
//! Wires the storage engine, dispatcher, notification transport and
//! scheduler for one process. Several processes may run an engine against
//! the same database; they coordinate only through the queue tables, the
//! notification channel and the sweep's advisory lock.
//!
//! ```rust,no_run
//! use tasker_queue::config::{QueueEngineConfig, TopicConfig};
//! use tasker_queue::dispatch::{handler_fn, Acknowledger};
//! use tasker_queue::engine::QueueEngine;
//! use tasker_queue::models::Message;
//!
//! # async fn example() -> tasker_queue::error::Result<()> {
//! let engine = QueueEngine::connect(QueueEngineConfig::load()?).await?;
//! engine.migrate().await?;
//!
//! engine.register(
//!     TopicConfig::new("emails").with_concurrency(4),
//!     handler_fn(|message: Message, ack: Acknowledger| async move {
//!         println!("sending {}", message.payload);
//!         ack.complete(message.id).await?;
//!         Ok(())
//!     }),
//! )?;
//!
//! engine.start()?;
//! engine.send("emails", "welcome:42").await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{QueueEngineConfig, TopicConfig};
use crate::database::{connect_pool, UnitOfWork};
use crate::dispatch::{
    BatchMessageHandler, Dispatcher, MessageHandler, TopicHandler, TopicRegistry,
};
use crate::error::{QueueError, Result};
use crate::models::{NewMessage, QueueMetrics};
use crate::notify::{NotifyListener, PgNotifySender, TopicPublisher};
use crate::producer::TopicProducer;
use crate::scheduler::Scheduler;
use crate::storage::{PgQueueStore, QueueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Stopped,
}

/// One process's view of the queue
pub struct QueueEngine {
    config: QueueEngineConfig,
    pool: PgPool,
    store: Arc<PgQueueStore>,
    sender: Option<PgNotifySender>,
    publisher: Arc<dyn TopicPublisher>,
    dispatcher: Dispatcher,
    listener: Option<NotifyListener>,
    scheduler: Scheduler,
    state: Mutex<EngineState>,
}

impl std::fmt::Debug for QueueEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEngine")
            .field("state", &self.state())
            .field("topics", &self.dispatcher.registry().topics())
            .field("notify_enabled", &self.config.notify.enabled)
            .field("scheduler_enabled", &self.config.scheduler.enabled)
            .finish()
    }
}

impl QueueEngine {
    /// Connect a pool from `config.database` and build the engine
    pub async fn connect(config: QueueEngineConfig) -> Result<Self> {
        config.validate()?;
        let pool = connect_pool(&config.database).await?;
        Self::new(pool, config)
    }

    /// Build the engine on an existing pool
    pub fn new(pool: PgPool, config: QueueEngineConfig) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(PgQueueStore::new(pool.clone(), config.store.clone()));
        let store_dyn: Arc<dyn QueueStore> = store.clone();
        let dispatcher = Dispatcher::new(Arc::new(TopicRegistry::new()), Arc::clone(&store_dyn));

        let (sender, listener) = if config.notify.enabled {
            let sender = PgNotifySender::new(pool.clone(), &config.notify);
            let listener = NotifyListener::new(
                pool.clone(),
                config.notify.clone(),
                Arc::new(dispatcher.clone()),
            );
            (Some(sender), Some(listener))
        } else {
            (None, None)
        };

        // Without LISTEN/NOTIFY, signals only reach this process
        let publisher: Arc<dyn TopicPublisher> = match &sender {
            Some(sender) => Arc::new(sender.clone()),
            None => Arc::new(dispatcher.clone()),
        };

        let scheduler = Scheduler::new(
            &config.scheduler,
            store_dyn,
            Arc::clone(&publisher),
            dispatcher.clone(),
        );

        Ok(Self {
            config,
            pool,
            store,
            sender,
            publisher,
            dispatcher,
            listener,
            scheduler,
            state: Mutex::new(EngineState::Created),
        })
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Queue schema migrations applied");
        Ok(())
    }

    pub fn config(&self) -> &QueueEngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<PgQueueStore> {
        &self.store
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn listener(&self) -> Option<&NotifyListener> {
        self.listener.as_ref()
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Settings for `topic`: the configured entry, or defaults
    pub fn topic_config(&self, topic: &str) -> TopicConfig {
        self.config
            .topic(topic)
            .cloned()
            .unwrap_or_else(|| TopicConfig::new(topic))
    }

    /// Register a per-message consumer
    pub fn register<H>(&self, config: TopicConfig, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        self.register_handler(config, TopicHandler::Single(Arc::new(handler)))
    }

    /// Register a per-claim batch consumer
    pub fn register_batch<H>(&self, config: TopicConfig, handler: H) -> Result<()>
    where
        H: BatchMessageHandler + 'static,
    {
        self.register_handler(config, TopicHandler::Batch(Arc::new(handler)))
    }

    /// Register a per-message consumer using the topic's configured settings
    pub fn register_configured<H>(&self, topic: &str, handler: H) -> Result<()>
    where
        H: MessageHandler + 'static,
    {
        let config = self
            .config
            .topic(topic)
            .cloned()
            .ok_or_else(|| QueueError::config(format!("topic '{topic}' is not configured")))?;
        self.register(config, handler)
    }

    fn register_handler(&self, config: TopicConfig, handler: TopicHandler) -> Result<()> {
        let topic = config.topic.clone();
        self.dispatcher.register(config, handler)?;

        // pick up rows enqueued before registration
        if self.state() == EngineState::Running {
            self.dispatcher.notify(&topic);
        }
        Ok(())
    }

    /// Producer for `topic` with its configured first-process delay
    pub fn producer(&self, topic: &str) -> Result<TopicProducer> {
        let store: Arc<dyn QueueStore> = self.store.clone();
        TopicProducer::new(
            &self.topic_config(topic),
            store,
            Arc::clone(&self.publisher),
        )
    }

    pub async fn send<S: Into<String>>(&self, topic: &str, payload: S) -> Result<i64> {
        self.producer(topic)?.send(payload).await
    }

    pub async fn send_with_priority<S: Into<String>>(
        &self,
        topic: &str,
        payload: S,
        priority: i32,
    ) -> Result<i64> {
        self.producer(topic)?
            .send_with_priority(payload, priority)
            .await
    }

    pub async fn send_json<T: Serialize>(&self, topic: &str, value: &T) -> Result<i64> {
        self.producer(topic)?.send_json(value).await
    }

    pub async fn send_batch(&self, topic: &str, messages: Vec<NewMessage>) -> Result<Vec<i64>> {
        self.producer(topic)?.send_batch(messages).await
    }

    /// Begin a unit of work for transactional enqueue
    pub async fn begin(&self) -> Result<UnitOfWork> {
        UnitOfWork::begin(&self.pool).await
    }

    /// Enqueue inside `uow`; the topic is signalled only after it commits
    pub async fn enqueue_in(
        &self,
        uow: &mut UnitOfWork,
        topic: &str,
        message: NewMessage,
    ) -> Result<i64> {
        let delay = self.topic_config(topic).first_process_delay();
        let id = self.store.enqueue_in(uow, topic, message, delay).await?;
        if delay.is_none() {
            self.signal_after_commit(uow, topic)?;
        }
        Ok(id)
    }

    fn signal_after_commit(&self, uow: &mut UnitOfWork, topic: &str) -> Result<()> {
        match &self.sender {
            Some(sender) => sender.publish_after_commit(uow, &[topic.to_string()]),
            None => {
                let dispatcher = self.dispatcher.clone();
                let topic = topic.to_string();
                uow.after_commit(async move { dispatcher.notify(&topic) });
                Ok(())
            }
        }
    }

    /// Start the listener and scheduler, then signal every registered topic
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state != EngineState::Created {
            return Err(QueueError::invalid_state(format!(
                "engine cannot start from {:?}",
                *state
            )));
        }

        if let Some(listener) = &self.listener {
            listener.start()?;
        }
        if self.config.scheduler.enabled {
            self.scheduler.start()?;
        }
        self.dispatcher.notify_all();

        *state = EngineState::Running;
        info!(
            topics = ?self.dispatcher.registry().topics(),
            notify_enabled = self.listener.is_some(),
            scheduler_enabled = self.config.scheduler.enabled,
            "Queue engine started"
        );
        Ok(())
    }

    /// Stop accepting work and wait, up to `shutdown_timeout_ms`, for drain loops
    ///
    /// Returns `true` if every drain loop finished in time.
    pub async fn shutdown(&self) -> Result<bool> {
        {
            let mut state = self.state.lock();
            if *state != EngineState::Running {
                return Err(QueueError::invalid_state(format!(
                    "engine cannot shut down from {:?}",
                    *state
                )));
            }
            *state = EngineState::Stopped;
        }

        if self.scheduler.is_running() {
            if let Err(e) = self.scheduler.stop().await {
                warn!(error = %e, "Failed to stop scheduler");
            }
        }
        if let Some(listener) = &self.listener {
            if let Err(e) = listener.stop().await {
                warn!(error = %e, "Failed to stop notify listener");
            }
        }

        let settled = self
            .dispatcher
            .shutdown(self.config.shutdown_timeout())
            .await;
        info!(settled, "Queue engine shut down");
        Ok(settled)
    }

    /// Partition counts for `topic`
    pub async fn metrics(&self, topic: &str) -> Result<QueueMetrics> {
        self.store.queue_metrics(topic).await
    }

    pub async fn health_check(&self) -> bool {
        self.store.health_check().await
    }
}
