use serde::{Deserialize, Serialize};

use super::Partition;

/// Row counts per partition for one topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QueueMetrics {
    pub topic: String,
    pub pending: i64,
    pub invisible: i64,
    pub processing: i64,
    pub complete: i64,
    pub dead: i64,
    /// Age of the oldest pending message in seconds (if any)
    pub oldest_pending_age_seconds: Option<i64>,
}

impl QueueMetrics {
    pub fn empty<S: Into<String>>(topic: S) -> Self {
        Self {
            topic: topic.into(),
            ..Self::default()
        }
    }

    pub fn count(&self, partition: Partition) -> i64 {
        match partition {
            Partition::Pending => self.pending,
            Partition::Invisible => self.invisible,
            Partition::Processing => self.processing,
            Partition::Complete => self.complete,
            Partition::Dead => self.dead,
        }
    }

    /// Messages not yet in a terminal partition
    pub fn outstanding(&self) -> i64 {
        Partition::ALL
            .into_iter()
            .filter(|partition| !partition.is_terminal())
            .map(|partition| self.count(partition))
            .sum()
    }
}
