use std::time::Duration;

use thiserror::Error;

use crate::keys::KeyDisplay;
use crate::region::RegionError;
use crate::timestamp::Timestamp;

/// Errors reported by a [`crate::ClusterClient`] implementation.
#[derive(Debug, Clone, Error)]
pub enum ClusterError {
    /// The region answered with a retryable routing or leadership error.
    #[error("region error: {0}")]
    Region(RegionError),

    /// RPC could not be delivered or the peer failed outside region semantics.
    #[error("transport error: {0}")]
    Transport(String),

    /// RPC did not complete within its deadline.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl ClusterError {
    /// Creates a `Transport` variant.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }
}

/// Convenient result alias for cluster client calls.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Coarse classification of [`BackupError`] used to pick exit codes and
/// decide whether a loop stop is clean.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Cancelled,
    StaleCheckpoint,
    RetryExhausted,
    Cluster,
    InvalidConfig,
    CheckpointRegressed,
    Persistence,
    Internal,
}

/// Canonical error type for checkpoint establishment and validation.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Cancellation was observed; not a failure.
    #[error("backup checkpoint cancelled")]
    Cancelled,

    /// The GC safe point already reached the checkpoint, so versions needed
    /// for a consistent read may have been collected.
    #[error(
        "GC safe point {safe_point} ({}) >= checkpoint {checkpoint} ({})",
        .safe_point.encode(),
        .checkpoint.encode()
    )]
    StaleCheckpoint {
        /// Safe point reported by the cluster.
        safe_point: Timestamp,
        /// Checkpoint the round was built on.
        checkpoint: Timestamp,
    },

    /// Region errors kept recurring for one key until the backoff budget ran out.
    #[error("gave up on key {key} after {attempts} attempts, last error: {last}")]
    RetryExhausted {
        /// Key the scanner was trying to resolve.
        key: KeyDisplay,
        /// Number of attempts made for the key.
        attempts: u32,
        /// Region error seen on the final attempt.
        last: RegionError,
    },

    /// Non-region failure from the cluster client, with call-site context.
    #[error("{context}: {source}")]
    Cluster {
        /// Which range/key/call failed.
        context: String,
        /// Underlying client error.
        #[source]
        source: ClusterError,
    },

    /// A read-index response carried neither a region error nor an index.
    #[error("read-index response for region {region_id} has no body")]
    ResponseBodyMissing {
        /// Region that answered.
        region_id: u64,
    },

    /// Configuration rejected before any round started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A round produced a checkpoint older than a previous round's.
    #[error("checkpoint regressed from {previous} to {current}")]
    CheckpointRegressed {
        /// Checkpoint of the last successful round.
        previous: Timestamp,
        /// Checkpoint of the current round.
        current: Timestamp,
    },

    /// Backup metadata could not be recorded.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// I/O error while recording metadata.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Unexpected internal failure, e.g. a scan task panicked.
    #[error("internal error: {0}")]
    Internal(String),
}

impl BackupError {
    /// Creates a `Cluster` variant.
    #[must_use]
    pub fn cluster(context: impl Into<String>, source: ClusterError) -> Self {
        Self::Cluster {
            context: context.into(),
            source,
        }
    }

    /// Creates an `InvalidConfig` variant.
    #[must_use]
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Returns the classification of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Cancelled => ErrorKind::Cancelled,
            Self::StaleCheckpoint { .. } => ErrorKind::StaleCheckpoint,
            Self::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            Self::Cluster { .. } | Self::ResponseBodyMissing { .. } => ErrorKind::Cluster,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::CheckpointRegressed { .. } => ErrorKind::CheckpointRegressed,
            Self::Persistence(_) | Self::Io(_) | Self::Serialization(_) => ErrorKind::Persistence,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` for the clean shutdown path.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Convenient result alias for backup operations.
pub type BackupResult<T> = Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stale_checkpoint_message_includes_encoded_values() {
        let err = BackupError::StaleCheckpoint {
            safe_point: Timestamp::new(2, 0),
            checkpoint: Timestamp::new(1, 0),
        };
        let msg = err.to_string();
        assert!(msg.contains(&(2u64 << 18).to_string()));
        assert!(msg.contains(&(1u64 << 18).to_string()));
        assert_eq!(err.kind(), ErrorKind::StaleCheckpoint);
    }

    #[test]
    fn test_kinds_are_distinct_for_fatal_errors() {
        let exhausted = BackupError::RetryExhausted {
            key: KeyDisplay::from(b"k".as_slice()),
            attempts: 3,
            last: RegionError::NotLeader { region_id: 1 },
        };
        let config = BackupError::invalid_config("interval too large");
        let cluster = BackupError::cluster("locate", ClusterError::transport("refused"));

        assert_eq!(exhausted.kind(), ErrorKind::RetryExhausted);
        assert_eq!(config.kind(), ErrorKind::InvalidConfig);
        assert_eq!(cluster.kind(), ErrorKind::Cluster);
        assert!(!cluster.is_cancelled());
        assert!(BackupError::Cancelled.is_cancelled());
    }
}
