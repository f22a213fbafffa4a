//! Error types for Stride

use thiserror::Error;

use crate::config::ConfigError;

/// Errors that can occur while processing a log record
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to parse {source_name} payload: {message}")]
    ParseError {
        source_name: &'static str,
        message: String,
    },

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Event for user {0} has no usable timestamp and the partition has none to inherit")]
    MissingTimestamp(String),

    #[error("Timestamp out of range: {0} ms")]
    TimestampOutOfRange(i64),

    #[error("Negative step count {steps} for user {user_id}")]
    NegativeSteps { user_id: String, steps: i64 },

    #[error("Step count overflow for user {user_id} in window {window_start_ms}: {current} + {increment}")]
    StepOverflow {
        user_id: String,
        window_start_ms: i64,
        current: u32,
        increment: i64,
    },

    #[error("Rolling history for user {user_id} holds {len} entries, capacity is {capacity}")]
    HistoryOverCapacity {
        user_id: String,
        len: usize,
        capacity: usize,
    },

    #[error("Corrupt {table} state for user {user_id}: {message}")]
    StateCorruption {
        table: &'static str,
        user_id: String,
        message: String,
    },

    #[error("Offset {0} does not fit the state store")]
    OffsetOutOfRange(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Partition {0} is not accepting records")]
    PartitionUnavailable(u32),
}

impl ProcessError {
    /// Whether this error must halt the partition.
    ///
    /// Malformed input is dropped and logged; everything touching state
    /// integrity stops the partition until an operator intervenes.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProcessError::ParseError { .. }
                | ProcessError::JsonError(_)
                | ProcessError::MissingField(_)
                | ProcessError::MissingTimestamp(_)
                | ProcessError::TimestampOutOfRange(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_input_is_not_fatal() {
        assert!(!ProcessError::MissingField("userId".to_string()).is_fatal());
        assert!(!ProcessError::MissingTimestamp("u1".to_string()).is_fatal());
        assert!(!ProcessError::ParseError {
            source_name: "ios",
            message: "bad".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_integrity_errors_are_fatal() {
        assert!(ProcessError::NegativeSteps {
            user_id: "u1".to_string(),
            steps: -3
        }
        .is_fatal());
        assert!(ProcessError::HistoryOverCapacity {
            user_id: "u1".to_string(),
            len: 8,
            capacity: 7
        }
        .is_fatal());
        assert!(ProcessError::StateCorruption {
            table: "rolling_history",
            user_id: "u1".to_string(),
            message: "eof".to_string()
        }
        .is_fatal());
    }
}
