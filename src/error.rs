//! Error types for tasker-queue

use thiserror::Error;

/// Result type for tasker-queue operations
pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors that can occur in tasker-queue operations
///
/// Setup-time problems (configuration, duplicate registration, invalid
/// arguments) surface to the caller. Errors raised inside background loops
/// (drain loops, the listener, the scheduler) are logged and never propagate.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failures
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Configuration source could not be loaded or deserialized
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// A consumer is already registered for this topic
    #[error("Topic already registered: {topic}")]
    DuplicateTopic { topic: String },

    /// Argument rejected before touching the database
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Operation not allowed in the component's current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl QueueError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state<S: Into<String>>(message: S) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create a duplicate topic error
    pub fn duplicate_topic<S: Into<String>>(topic: S) -> Self {
        Self::DuplicateTopic {
            topic: topic.into(),
        }
    }

    /// Whether the error comes from the store and may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Database(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = QueueError::duplicate_topic("orders");
        assert_eq!(err.to_string(), "Topic already registered: orders");

        let err = QueueError::config("concurrency must be between 1 and 200");
        assert_eq!(
            err.to_string(),
            "Configuration error: concurrency must be between 1 and 200"
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(QueueError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!QueueError::validation("empty batch").is_transient());
        assert!(!QueueError::invalid_state("already started").is_transient());
    }
}
