//! # Queue Engine Constants
//!
//! Fixed names and operational boundaries shared by every process running the
//! engine against the same database. Changing any of these values splits a
//! cluster: processes that disagree on a table name, channel or lock key no
//! longer coordinate.

/// Physical tables backing the five queue partitions
pub mod tables {
    pub const PENDING: &str = "tasker_queue_pending";
    pub const INVISIBLE: &str = "tasker_queue_invisible";
    pub const PROCESSING: &str = "tasker_queue_processing";
    pub const COMPLETE: &str = "tasker_queue_complete";
    pub const DEAD: &str = "tasker_queue_dead";
}

/// LISTEN/NOTIFY channel shared by the whole engine. Payload is the bare topic name.
pub const NOTIFY_CHANNEL: &str = "tasker_queue_topic_ready";

/// `pg_notify` rejects payloads of 8000 bytes or more
pub const MAX_NOTIFY_PAYLOAD_BYTES: usize = 7999;

/// Advisory lock namespace for this engine (first half of the two-part key)
pub const DEFAULT_ENGINE_LOCK_ID: i32 = 0x5451_4555; // "TQEU"

/// Advisory lock sub-id for the reclaim sweep (second half of the two-part key)
pub const DEFAULT_SCHEDULER_LOCK_ID: i32 = 1;

/// Column limit for `topic`
pub const MAX_TOPIC_LENGTH: usize = 255;

/// Bounds for the number of concurrent drain loops per topic
pub mod concurrency {
    pub const MIN: usize = 1;
    pub const MAX: usize = 200;
}

/// Bounds for rows claimed per claim call
pub mod batch_size {
    pub const MIN: usize = 1;
    pub const MAX: usize = 5000;
}
