use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Version stamps of a region; bumped on split/merge and on membership change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// Address of the store hosting a region's leader peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreEndpoint {
    pub store_id: u64,
    pub address: String,
}

impl fmt::Display for StoreEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "store {} ({})", self.store_id, self.address)
    }
}

/// Result of resolving the region that owns a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionLocation {
    pub region_id: u64,
    pub epoch: RegionEpoch,
    /// Leader the probe is sent to.
    pub leader: StoreEndpoint,
    pub start_key: Vec<u8>,
    /// Empty when the region extends to the end of the key space.
    pub end_key: Vec<u8>,
}

impl RegionLocation {
    /// Returns `true` when `key` falls inside this region.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }
}

/// Retryable routing and leadership errors returned by a region.
///
/// All variants mean "the cached location or leader is stale, look it up
/// again"; none of them is fatal on its own.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum RegionError {
    /// Leadership moved to another peer (possibly unknown yet).
    #[error("region {region_id} is not led by the addressed peer")]
    NotLeader { region_id: u64 },

    /// Region split or merged since the location was cached.
    #[error("region {region_id} epoch does not match")]
    EpochNotMatch { region_id: u64 },

    /// The store does not host the region any more.
    #[error("region {region_id} not found on store")]
    RegionNotFound { region_id: u64 },

    /// The key no longer belongs to the addressed region.
    #[error("key is not in region {region_id}")]
    KeyNotInRegion { region_id: u64 },

    /// Store is overloaded and asked the client to come back later.
    #[error("server is busy: {reason}")]
    ServerIsBusy { reason: String },

    #[error("stale command")]
    StaleCommand,
}

/// Response to a read-index probe.
///
/// Exactly one of the fields is expected to be set; a response with neither
/// is malformed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub region_error: Option<RegionError>,
    /// Commit index confirmed by the leader.
    pub read_index: Option<u64>,
}

impl ProbeResponse {
    /// Successful probe acknowledging `read_index`.
    #[must_use]
    pub fn ok(read_index: u64) -> Self {
        Self {
            region_error: None,
            read_index: Some(read_index),
        }
    }

    /// Probe rejected with a region error.
    #[must_use]
    pub fn region_error(err: RegionError) -> Self {
        Self {
            region_error: Some(err),
            read_index: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(start: &str, end: &str) -> RegionLocation {
        RegionLocation {
            region_id: 7,
            epoch: RegionEpoch::default(),
            leader: StoreEndpoint {
                store_id: 1,
                address: "127.0.0.1:20160".to_string(),
            },
            start_key: start.as_bytes().to_vec(),
            end_key: end.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_region_contains() {
        let loc = location("b", "d");
        assert!(!loc.contains(b"a"));
        assert!(loc.contains(b"b"));
        assert!(loc.contains(b"c"));
        assert!(!loc.contains(b"d"));

        let last = location("x", "");
        assert!(last.contains(b"zzzz"));
    }

    #[test]
    fn test_probe_response_constructors() {
        assert_eq!(ProbeResponse::ok(9).read_index, Some(9));
        let rejected = ProbeResponse::region_error(RegionError::StaleCommand);
        assert!(rejected.read_index.is_none());
        assert_eq!(rejected.region_error, Some(RegionError::StaleCommand));
    }
}
