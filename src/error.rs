use std::fmt::Display;
use std::io;
use std::path::PathBuf;

/// A specialized error type for queue operations.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Queue name, directory, or configuration value was invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// A segment file could not be replayed into a consistent image.
    #[error("corrupted segment {}: {reason}", path.display())]
    CorruptedSegment {
        /// Path of the offending segment file.
        path: PathBuf,
        /// What the replay scan tripped over.
        reason: String,
    },
    /// Record encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// File system operation error, with the operation named.
    #[error("file system error: {0}")]
    FileSystem(String),
    /// Another live queue holds the directory lock.
    #[error("queue directory {} is already locked", path.display())]
    AlreadyLocked {
        /// Directory whose lock was contended.
        path: PathBuf,
    },
    /// The queue has been closed.
    #[error("queue is closed")]
    Closed,
    /// Invalid state transition or operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The on-disk log and the in-memory image may disagree; the queue must
    /// be closed and reopened to replay back to a consistent image.
    #[error("queue is inconsistent: {0}")]
    Inconsistent(String),
}

impl QueueError {
    /// Create an invalid configuration error from a displayable value.
    pub fn invalid_config<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidConfig(msg.to_string())
    }

    /// Create a serialization error from a displayable value.
    pub fn serialization<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::Serialization(msg.to_string())
    }

    /// Create a corrupted segment error for the given file.
    pub fn corrupted<P, T>(path: P, reason: T) -> Self
    where
        P: Into<PathBuf>,
        T: Display,
    {
        Self::CorruptedSegment {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid state error from a displayable value.
    pub fn invalid_state<T>(msg: T) -> Self
    where
        T: Display,
    {
        Self::InvalidState(msg.to_string())
    }
}

/// A Result type alias for queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_error_message_is_stable() {
        assert_eq!(QueueError::Closed.to_string(), "queue is closed");
    }

    #[test]
    fn corrupted_helper_keeps_path() {
        let err = QueueError::corrupted("/tmp/q/0000000000001.dque", "truncated frame header");
        match err {
            QueueError::CorruptedSegment { path, reason } => {
                assert!(path.ends_with("0000000000001.dque"));
                assert_eq!(reason, "truncated frame header");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn invalid_config_helper() {
        let err = QueueError::invalid_config("items_per_segment must be greater than zero");
        assert!(
            matches!(err, QueueError::InvalidConfig(msg) if msg.contains("items_per_segment"))
        );
    }
}
