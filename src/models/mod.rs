//! # Queue Data Model
//!
//! - [`message`] - The message row shared by all partitions and the partition enum
//! - [`metrics`] - Per-topic partition counts

pub mod message;
pub mod metrics;

pub use message::{Message, NewMessage, Partition};
pub use metrics::QueueMetrics;
