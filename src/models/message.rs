use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

use crate::constants::tables;
use crate::error::Result;

/// A queued unit of work
///
/// The identifier is assigned once by the store and kept across every
/// partition move. `visible_time` is only set while the message sits in the
/// invisible partition, `timeout_time` only while it is being processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: i64,
    pub create_time: DateTime<Utc>,
    pub topic: String,
    pub priority: i32,
    pub payload: String,
    /// Incremented exactly once per claim
    pub attempt: i32,
    #[sqlx(default)]
    pub visible_time: Option<DateTime<Utc>>,
    #[sqlx(default)]
    pub timeout_time: Option<DateTime<Utc>>,
}

impl Message {
    /// Deserialize a JSON payload
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Whether this is a redelivery (claimed at least once before)
    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }
}

/// A message to enqueue (without store-assigned fields)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub payload: String,
    pub priority: i32,
}

impl NewMessage {
    pub fn new<S: Into<String>>(payload: S) -> Self {
        Self {
            payload: payload.into(),
            priority: 0,
        }
    }

    /// Serialize `value` as the JSON payload
    pub fn json<T: Serialize>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_string(value)?))
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// The five physical partitions of the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Pending,
    Invisible,
    Processing,
    Complete,
    Dead,
}

impl Partition {
    pub const ALL: [Partition; 5] = [
        Partition::Pending,
        Partition::Invisible,
        Partition::Processing,
        Partition::Complete,
        Partition::Dead,
    ];

    pub fn table_name(self) -> &'static str {
        match self {
            Partition::Pending => tables::PENDING,
            Partition::Invisible => tables::INVISIBLE,
            Partition::Processing => tables::PROCESSING,
            Partition::Complete => tables::COMPLETE,
            Partition::Dead => tables::DEAD,
        }
    }

    /// Complete and dead are terminal; only retention cleanup removes their rows
    pub fn is_terminal(self) -> bool {
        matches!(self, Partition::Complete | Partition::Dead)
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Partition::Pending => "pending",
            Partition::Invisible => "invisible",
            Partition::Processing => "processing",
            Partition::Complete => "complete",
            Partition::Dead => "dead",
        };
        write!(f, "{name}")
    }
}
