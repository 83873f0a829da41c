//! # Dispatcher
//!
//! Maps each topic to exactly one registered consumer and turns "topic may
//! have work" signals into bounded, concurrent draining of that topic.
//!
//! ## Coalescing
//!
//! Every topic owns a semaphore of `concurrency` permits. [`Dispatcher::notify`]
//! takes a permit with a non-blocking try-acquire and, on success, spawns a
//! drain loop that claims `batch_size` rows at a time until a claim comes
//! back empty. A signal that finds no free permit is dropped: a running drain
//! loop will see the new rows on its next claim. Signals that are lost
//! entirely are covered by the scheduler's sweep.
//!
//! ## Handler contract
//!
//! Handlers report the outcome of each message through the [`Acknowledger`]
//! they receive. Errors and panics are caught, counted and logged; they never
//! end the drain loop and never change the message's partition.

mod dispatcher;
mod handler;
mod registry;

pub use dispatcher::{Dispatcher, DispatcherStats};
pub use handler::{
    handler_fn, Acknowledger, BatchMessageHandler, FnHandler, MessageHandler, TopicHandler,
};
pub use registry::{TopicEntry, TopicRegistry};
