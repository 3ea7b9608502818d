//! GC safe point fencing.
//!
//! The cluster discards versions older than its GC safe point. A checkpoint
//! is only usable while the safe point is strictly behind it.

use std::sync::Arc;

use kvbackup_core::metrics::LAST_SAFE_POINT_PHYSICAL;
use kvbackup_core::{BackupError, BackupResult, ClusterClient, Timestamp};
use tracing::debug;

/// Reads the GC safe point and checks checkpoints against it.
pub struct SafePointGuard {
    client: Arc<dyn ClusterClient>,
}

impl SafePointGuard {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self { client }
    }

    /// Returns the cluster's current GC safe point.
    ///
    /// Proposes advancing to zero, which the authority never accepts, so
    /// the call only reads the current value.
    pub async fn fetch_safe_point(&self) -> BackupResult<Timestamp> {
        let raw = self
            .client
            .update_gc_safe_point(0)
            .await
            .map_err(|e| BackupError::cluster("fetch GC safe point", e))?;

        let safe_point = Timestamp::decode(raw);
        LAST_SAFE_POINT_PHYSICAL.set(safe_point.physical);
        debug!(safe_point = %safe_point, raw, "Fetched GC safe point");
        Ok(safe_point)
    }

    /// Fails with `StaleCheckpoint` unless `safe_point` is strictly before
    /// `checkpoint` in encoded order.
    pub fn validate(safe_point: Timestamp, checkpoint: Timestamp) -> BackupResult<()> {
        if safe_point.encode() >= checkpoint.encode() {
            return Err(BackupError::StaleCheckpoint {
                safe_point,
                checkpoint,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCluster;
    use kvbackup_core::ErrorKind;

    #[test]
    fn test_validate_boundary() {
        let checkpoint = Timestamp::new(1_000, 5);

        assert!(SafePointGuard::validate(Timestamp::ZERO, checkpoint).is_ok());
        assert!(SafePointGuard::validate(Timestamp::new(1_000, 4), checkpoint).is_ok());
        assert!(SafePointGuard::validate(Timestamp::new(999, 200_000), checkpoint).is_ok());

        let equal = SafePointGuard::validate(checkpoint, checkpoint).unwrap_err();
        assert_eq!(equal.kind(), ErrorKind::StaleCheckpoint);

        assert!(SafePointGuard::validate(Timestamp::new(1_000, 6), checkpoint).is_err());
        assert!(SafePointGuard::validate(Timestamp::new(1_001, 0), checkpoint).is_err());
    }

    #[tokio::test]
    async fn test_fetch_does_not_move_safe_point() {
        let cluster = Arc::new(MemoryCluster::new());
        let current = Timestamp::new(42_000, 3);
        cluster.set_safe_point(current);

        let guard = SafePointGuard::new(cluster.clone());
        assert_eq!(guard.fetch_safe_point().await.unwrap(), current);
        assert_eq!(guard.fetch_safe_point().await.unwrap(), current);
        assert_eq!(cluster.safe_point(), current);
        assert_eq!(cluster.safe_point_requests(), vec![0, 0]);
    }
}
