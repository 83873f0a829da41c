//! # Notification Transport
//!
//! Best-effort "topic X may have work" signals across process boundaries,
//! carried by PostgreSQL LISTEN/NOTIFY on one engine-wide channel. The
//! payload is the bare topic name.
//!
//! - [`PgNotifySender`] publishes, immediately or after a [`UnitOfWork`]
//!   commits ([`PgNotifySender::publish_after_commit`]).
//! - [`NotifyListener`] holds one long-lived subscriber connection and
//!   forwards every received topic to a [`TopicEventHandler`], reconnecting
//!   on failure until stopped.
//!
//! Lost notifications are expected; the scheduler's periodic sweep
//! re-publishes every topic it moves rows into.
//!
//! [`UnitOfWork`]: crate::database::UnitOfWork

mod listener;
mod sender;

use async_trait::async_trait;

use crate::error::Result;

pub use listener::{ListenerState, ListenerStats, NotifyListener, TopicEventHandler};
pub use sender::{NoopPublisher, PgNotifySender};

/// Publishes topic-ready signals
#[async_trait]
pub trait TopicPublisher: Send + Sync {
    /// Publish one signal per distinct topic
    async fn publish(&self, topics: &[String]) -> Result<()>;

    /// Publish a single topic
    async fn publish_topic(&self, topic: &str) -> Result<()> {
        self.publish(&[topic.to_string()]).await
    }
}
