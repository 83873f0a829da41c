#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Tasker Queue
//!
//! A message-queue engine that keeps all queue state in PostgreSQL.
//!
//! ## Overview
//!
//! Messages live in five partition tables (pending, invisible, processing,
//! complete, dead) and move between them with atomic delete-and-insert
//! statements. Any number of processes can run the engine against the same
//! database without a coordinator:
//!
//! - Claims use `FOR UPDATE SKIP LOCKED`, so concurrent consumers never
//!   double-claim and never wait on each other.
//! - LISTEN/NOTIFY carries "topic has work" signals between processes,
//!   published only after the enqueueing transaction commits.
//! - A periodic sweep guarded by a transaction-scoped advisory lock returns
//!   delayed and timed-out messages to pending and re-signals their topics.
//!
//! Delivery is at-least-once. Handlers decide every outcome (complete, dead,
//! retry, delete); the engine never infers one.
//!
//! ## Module Organization
//!
//! - [`storage`] - Partition state machine and claim/transition operations
//! - [`dispatch`] - Topic registry, bounded drain loops, handler contract
//! - [`notify`] - LISTEN/NOTIFY sender and reconnecting subscriber
//! - [`scheduler`] - Advisory-locked reclaim sweep
//! - [`producer`] - Per-topic enqueue helpers
//! - [`engine`] - Facade wiring the above for one process
//! - [`database`] - Pool construction and units of work with after-commit hooks
//! - [`config`] - Typed configuration and loading
//! - [`error`] - Structured error handling
//!
//! ## Testing
//!
//! Unit tests run against [`storage::InMemoryQueueStore`]. Integration tests
//! under `tests/` use `#[sqlx::test]`, which creates an isolated database per
//! test and applies `migrations/`:
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests (requires DATABASE_URL)
//! ```

pub mod config;
pub mod constants;
pub mod database;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod logging;
pub mod models;
pub mod notify;
pub mod producer;
pub mod scheduler;
pub mod storage;

pub use config::{QueueEngineConfig, TopicConfig};
pub use database::UnitOfWork;
pub use dispatch::{
    handler_fn, Acknowledger, BatchMessageHandler, Dispatcher, DispatcherStats, MessageHandler,
};
pub use engine::{EngineState, QueueEngine};
pub use error::{QueueError, Result};
pub use models::{Message, NewMessage, Partition, QueueMetrics};
pub use notify::{NotifyListener, PgNotifySender, TopicPublisher};
pub use producer::TopicProducer;
pub use scheduler::{Scheduler, SchedulerStats};
pub use storage::{InMemoryQueueStore, PgQueueStore, QueueStore};
