use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::keys::{hex_bytes, KeyRange};
use crate::timestamp::Timestamp;

/// One key range confirmed consistent at `checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMeta {
    #[serde(with = "hex_bytes")]
    pub start_key: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub end_key: Vec<u8>,
    pub checkpoint: Timestamp,
    /// Number of regions whose leaders acknowledged the read-index probe.
    #[serde(default)]
    pub regions: u64,
}

impl RangeMeta {
    /// Builds the metadata for a scanned range.
    #[must_use]
    pub fn new(range: &KeyRange, checkpoint: Timestamp, regions: u64) -> Self {
        Self {
            start_key: range.start_key.clone(),
            end_key: range.end_key.clone(),
            checkpoint,
            regions,
        }
    }

    /// The range this entry covers.
    #[must_use]
    pub fn key_range(&self) -> KeyRange {
        KeyRange::new(self.start_key.clone(), self.end_key.clone())
    }
}

/// Persisted result of one backup round.
///
/// Built fresh each round and not mutated after it is handed to a sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// 1-based round number within the running loop.
    pub round: u64,
    pub created_at: DateTime<Utc>,
    pub cluster_version: String,
    pub safe_point: Timestamp,
    /// In configured range order.
    pub ranges: Vec<RangeMeta>,
}

impl BackupMeta {
    /// Checkpoint shared by the round, taken from the first range.
    #[must_use]
    pub fn checkpoint(&self) -> Option<Timestamp> {
        self.ranges.first().map(|r| r.checkpoint)
    }

    /// Total regions confirmed across all ranges.
    #[must_use]
    pub fn total_regions(&self) -> u64 {
        self.ranges.iter().map(|r| r.regions).sum()
    }
}
