use std::time::Duration;

use async_trait::async_trait;

use crate::error::{BackupResult, ClusterResult};
use crate::meta::BackupMeta;
use crate::region::{ProbeResponse, RegionLocation};
use crate::timestamp::{EncodedTimestamp, Timestamp};

/// Capability interface over a range-partitioned key-value cluster.
///
/// Implementations own their region cache and connection pools and must
/// tolerate concurrent calls from several range scanners.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetches a fresh timestamp from the timing authority.
    async fn get_timestamp(&self) -> ClusterResult<Timestamp>;

    /// Resolves the region that owns `key`.
    ///
    /// An empty key addresses the first region of the key space.
    async fn locate_region(&self, key: &[u8]) -> ClusterResult<RegionLocation>;

    /// Sends a read-index probe to the region's leader.
    ///
    /// Region-level rejections come back inside the response; only
    /// transport failures are returned as `Err`.
    async fn read_index(
        &self,
        location: &RegionLocation,
        timeout: Duration,
    ) -> ClusterResult<ProbeResponse>;

    /// Proposes `candidate` as the new GC safe point and returns the
    /// authority's current value.
    ///
    /// The safe point only moves forward, so proposing `0` reads it without
    /// side effects.
    async fn update_gc_safe_point(
        &self,
        candidate: EncodedTimestamp,
    ) -> ClusterResult<EncodedTimestamp>;

    /// Human-readable cluster version label.
    async fn cluster_version(&self) -> ClusterResult<String>;

    /// Drops a cached location after the region rejected a request.
    async fn invalidate_region(&self, _region_id: u64) {}
}

/// Destination for the metadata produced by each backup round.
#[async_trait]
pub trait MetaSink: Send + Sync {
    /// Records one round's metadata.
    async fn persist(&self, meta: &BackupMeta) -> BackupResult<()>;

    /// Most recently recorded round, if the sink keeps history.
    async fn latest(&self) -> BackupResult<Option<BackupMeta>> {
        Ok(None)
    }
}
