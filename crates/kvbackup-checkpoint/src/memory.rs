//! In-memory cluster for tests and dry runs.
//!
//! Simulates a region-partitioned cluster with a timestamp oracle and a GC
//! safe point, plus scripted failure patterns for exercising retry and
//! fencing logic without a real deployment.
//!
//! # Examples
//!
//! ```rust
//! use kvbackup_checkpoint::memory::{MemoryCluster, MockFailure};
//! use kvbackup_core::{ClusterClient, RegionError};
//!
//! # async fn example() {
//! // Regions ["", "b"), ["b", "d"), ["d", "")
//! let cluster = MemoryCluster::with_splits(["b", "d"]);
//!
//! // The first lookup of "b" hits a stale leader, the second succeeds.
//! cluster.fail_key("b", vec![
//!     MockFailure::Probe(RegionError::NotLeader { region_id: 2 }),
//!     MockFailure::Ok,
//! ]);
//!
//! let loc = cluster.locate_region(b"b").await.unwrap();
//! assert_eq!(loc.start_key, b"b");
//! let resp = cluster.read_index(&loc, std::time::Duration::from_secs(1)).await.unwrap();
//! assert!(resp.region_error.is_some());
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;

use kvbackup_core::{
    ClusterClient, ClusterError, ClusterResult, EncodedTimestamp, ProbeResponse, RegionEpoch,
    RegionError, RegionLocation, StoreEndpoint, Timestamp,
};

/// Scripted outcome for one attempt on a key.
#[derive(Debug, Clone)]
pub enum MockFailure {
    /// Region lookup fails with a region error.
    Locate(RegionError),

    /// Lookup succeeds but the read-index probe is rejected.
    Probe(RegionError),

    /// Lookup fails with a transport error.
    Transport(&'static str),

    /// Lookup succeeds but the read-index RPC fails in transport.
    ProbeTransport(&'static str),

    /// Probe answers with an empty body.
    MissingBody,

    /// Success (no error).
    Ok,
}

/// Memory cluster configuration.
#[derive(Debug, Clone)]
pub struct MemoryClusterConfig {
    /// Simulated latency of each read-index probe.
    pub latency: Duration,

    /// Enable call history tracking.
    pub track_history: bool,

    /// When set, the safe point trails the oracle clock by this much, as if
    /// a GC worker were running.
    pub gc_lifetime: Option<Duration>,

    /// Label returned by `cluster_version`.
    pub version: String,
}

impl Default for MemoryClusterConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            track_history: true,
            gc_lifetime: None,
            version: "memory".to_string(),
        }
    }
}

/// Memory cluster call history entry.
#[derive(Debug, Clone)]
pub struct CallHistoryEntry {
    /// Operation type: "locate" or "read_index".
    pub operation: &'static str,

    /// Key looked up, or the region start key for probes.
    pub key: Vec<u8>,

    /// Whether the call succeeded.
    pub success: bool,

    /// Timestamp of the call.
    pub timestamp: Instant,
}

#[derive(Debug, Clone)]
struct MemRegion {
    id: u64,
    epoch: RegionEpoch,
    leader: StoreEndpoint,
    start_key: Vec<u8>,
    end_key: Vec<u8>,
}

impl MemRegion {
    fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    fn location(&self) -> RegionLocation {
        RegionLocation {
            region_id: self.id,
            epoch: self.epoch,
            leader: self.leader.clone(),
            start_key: self.start_key.clone(),
            end_key: self.end_key.clone(),
        }
    }
}

/// In-memory [`ClusterClient`].
pub struct MemoryCluster {
    config: MemoryClusterConfig,

    /// Regions sorted by start key, covering the whole key space.
    regions: RwLock<Vec<MemRegion>>,

    next_region_id: AtomicU64,

    /// Scripted outcomes keyed by looked-up key, consumed in order.
    failures: RwLock<HashMap<Vec<u8>, VecDeque<MockFailure>>>,

    /// Probe outcomes staged by a lookup, keyed by region id.
    staged_probes: RwLock<HashMap<u64, MockFailure>>,

    /// Fixed physical time for the oracle; wall clock when unset.
    pinned_physical: RwLock<Option<i64>>,
    logical: AtomicI64,

    safe_point: RwLock<EncodedTimestamp>,
    safe_point_requests: RwLock<Vec<EncodedTimestamp>>,

    invalidated: RwLock<Vec<u64>>,
    call_history: RwLock<Vec<CallHistoryEntry>>,

    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryCluster {
    /// Single region covering the whole key space.
    pub fn new() -> Self {
        Self::new_with_config(Vec::<Vec<u8>>::new(), MemoryClusterConfig::default())
    }

    /// Regions split at each of `splits` (sorted and deduplicated).
    pub fn with_splits<I, K>(splits: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        Self::new_with_config(splits, MemoryClusterConfig::default())
    }

    /// Create memory cluster with custom config.
    pub fn new_with_config<I, K>(splits: I, config: MemoryClusterConfig) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        let mut keys: Vec<Vec<u8>> = splits
            .into_iter()
            .map(|k| k.as_ref().to_vec())
            .filter(|k| !k.is_empty())
            .collect();
        keys.sort();
        keys.dedup();

        let mut bounds = Vec::with_capacity(keys.len() + 2);
        bounds.push(Vec::new());
        bounds.extend(keys);
        bounds.push(Vec::new());

        let regions: Vec<MemRegion> = bounds
            .windows(2)
            .enumerate()
            .map(|(i, w)| MemRegion {
                id: i as u64 + 1,
                epoch: RegionEpoch {
                    conf_ver: 1,
                    version: 1,
                },
                leader: store_for(i as u64 + 1),
                start_key: w[0].clone(),
                end_key: w[1].clone(),
            })
            .collect();
        let next_id = regions.len() as u64 + 1;

        Self {
            config,
            regions: RwLock::new(regions),
            next_region_id: AtomicU64::new(next_id),
            failures: RwLock::new(HashMap::new()),
            staged_probes: RwLock::new(HashMap::new()),
            pinned_physical: RwLock::new(None),
            logical: AtomicI64::new(0),
            safe_point: RwLock::new(0),
            safe_point_requests: RwLock::new(Vec::new()),
            invalidated: RwLock::new(Vec::new()),
            call_history: RwLock::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Scripts the outcomes of successive attempts on `key`.
    ///
    /// Once the queue is empty, attempts on the key succeed.
    pub fn fail_key(&self, key: impl AsRef<[u8]>, pattern: Vec<MockFailure>) {
        self.failures
            .write()
            .insert(key.as_ref().to_vec(), pattern.into());
    }

    /// Makes every attempt on `key` fail with `err` at probe time.
    pub fn always_fail_key(&self, key: impl AsRef<[u8]>, err: RegionError) {
        self.fail_key(key, vec![MockFailure::Probe(err); 1000]);
    }

    /// Splits the region containing `key` at `key`, bumping its epoch.
    pub fn split(&self, key: impl AsRef<[u8]>) {
        let key = key.as_ref();
        let mut regions = self.regions.write();
        let Some(idx) = regions.iter().position(|r| r.contains(key)) else {
            return;
        };
        if regions[idx].start_key == key {
            return;
        }

        let id = self.next_region_id.fetch_add(1, Ordering::SeqCst);
        let left = &mut regions[idx];
        left.epoch.version += 1;
        let right = MemRegion {
            id,
            epoch: left.epoch,
            leader: store_for(id),
            start_key: key.to_vec(),
            end_key: std::mem::replace(&mut left.end_key, key.to_vec()),
        };
        regions.insert(idx + 1, right);
    }

    /// Pins the oracle's physical clock.
    pub fn set_physical_time(&self, physical: i64) {
        *self.pinned_physical.write() = Some(physical);
    }

    /// Overwrites the GC safe point, even backwards.
    pub fn set_safe_point(&self, ts: Timestamp) {
        *self.safe_point.write() = ts.encode();
    }

    /// Current GC safe point.
    pub fn safe_point(&self) -> Timestamp {
        Timestamp::decode(*self.safe_point.read())
    }

    /// Candidates passed to `update_gc_safe_point`, in call order.
    pub fn safe_point_requests(&self) -> Vec<EncodedTimestamp> {
        self.safe_point_requests.read().clone()
    }

    /// Region ids invalidated by clients, in call order.
    pub fn invalidated_regions(&self) -> Vec<u64> {
        self.invalidated.read().clone()
    }

    /// Number of regions currently in the cluster.
    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    /// Get call history for assertions.
    pub fn get_call_history(&self) -> Vec<CallHistoryEntry> {
        self.call_history.read().clone()
    }

    /// Number of read-index probes sent to the region starting at `start_key`.
    pub fn probes_for(&self, start_key: impl AsRef<[u8]>) -> usize {
        let start_key = start_key.as_ref();
        self.call_history
            .read()
            .iter()
            .filter(|e| e.operation == "read_index" && e.key == start_key)
            .count()
    }

    /// Number of successful read-index probes.
    pub fn successful_probes(&self) -> usize {
        self.call_history
            .read()
            .iter()
            .filter(|e| e.operation == "read_index" && e.success)
            .count()
    }

    /// Highest number of concurrent read-index probes observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_failure(&self, key: &[u8]) -> Option<MockFailure> {
        self.failures.write().get_mut(key).and_then(VecDeque::pop_front)
    }

    fn record_call(&self, operation: &'static str, key: &[u8], success: bool) {
        if self.config.track_history {
            self.call_history.write().push(CallHistoryEntry {
                operation,
                key: key.to_vec(),
                success,
                timestamp: Instant::now(),
            });
        }
    }

    fn now_physical(&self) -> i64 {
        self.pinned_physical
            .read()
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

fn store_for(region_id: u64) -> StoreEndpoint {
    let store_id = (region_id - 1) % 3 + 1;
    StoreEndpoint {
        store_id,
        address: format!("127.0.0.1:{}", 20160 + store_id),
    }
}

#[async_trait]
impl ClusterClient for MemoryCluster {
    async fn get_timestamp(&self) -> ClusterResult<Timestamp> {
        let logical = self.logical.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Timestamp::new(
            self.now_physical(),
            logical & kvbackup_core::MAX_LOGICAL,
        ))
    }

    async fn locate_region(&self, key: &[u8]) -> ClusterResult<RegionLocation> {
        let location = self
            .regions
            .read()
            .iter()
            .find(|r| r.contains(key))
            .map(MemRegion::location)
            .ok_or_else(|| ClusterError::transport("key space has a hole"))?;

        match self.next_failure(key) {
            Some(MockFailure::Locate(err)) => {
                self.record_call("locate", key, false);
                Err(ClusterError::Region(err))
            }
            Some(MockFailure::Transport(msg)) => {
                self.record_call("locate", key, false);
                Err(ClusterError::transport(msg))
            }
            Some(
                staged @ (MockFailure::Probe(_)
                | MockFailure::ProbeTransport(_)
                | MockFailure::MissingBody),
            ) => {
                self.staged_probes.write().insert(location.region_id, staged);
                self.record_call("locate", key, true);
                Ok(location)
            }
            Some(MockFailure::Ok) | None => {
                self.record_call("locate", key, true);
                Ok(location)
            }
        }
    }

    async fn read_index(
        &self,
        location: &RegionLocation,
        _timeout: Duration,
    ) -> ClusterResult<ProbeResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.config.latency.is_zero() {
            tokio::time::sleep(self.config.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let staged = self.staged_probes.write().remove(&location.region_id);
        if let Some(MockFailure::ProbeTransport(msg)) = staged {
            self.record_call("read_index", &location.start_key, false);
            return Err(ClusterError::transport(msg));
        }

        let response = match staged {
            Some(MockFailure::Probe(err)) => ProbeResponse::region_error(err),
            Some(MockFailure::MissingBody) => ProbeResponse::default(),
            _ => {
                let current = self
                    .regions
                    .read()
                    .iter()
                    .find(|r| r.id == location.region_id)
                    .map(|r| r.epoch);
                match current {
                    Some(epoch) if epoch == location.epoch => {
                        ProbeResponse::ok(self.logical.load(Ordering::SeqCst) as u64)
                    }
                    Some(_) => ProbeResponse::region_error(RegionError::EpochNotMatch {
                        region_id: location.region_id,
                    }),
                    None => ProbeResponse::region_error(RegionError::RegionNotFound {
                        region_id: location.region_id,
                    }),
                }
            }
        };

        self.record_call(
            "read_index",
            &location.start_key,
            response.region_error.is_none() && response.read_index.is_some(),
        );
        Ok(response)
    }

    async fn update_gc_safe_point(
        &self,
        candidate: EncodedTimestamp,
    ) -> ClusterResult<EncodedTimestamp> {
        self.safe_point_requests.write().push(candidate);

        let mut current = self.safe_point.write();
        if let Some(lifetime) = self.config.gc_lifetime {
            let lifetime_ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX);
            let trailing = Timestamp::new(self.now_physical(), 0)
                .sub_millis(lifetime_ms)
                .encode();
            *current = (*current).max(trailing);
        }
        if candidate > *current {
            *current = candidate;
        }
        Ok(*current)
    }

    async fn cluster_version(&self) -> ClusterResult<String> {
        Ok(self.config.version.clone())
    }

    async fn invalidate_region(&self, region_id: u64) {
        self.invalidated.write().push(region_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_regions_cover_key_space() {
        let cluster = MemoryCluster::with_splits(["d", "b", "b"]);
        assert_eq!(cluster.region_count(), 3);

        let first = cluster.locate_region(b"").await.unwrap();
        assert_eq!(first.start_key, b"");
        assert_eq!(first.end_key, b"b");

        let middle = cluster.locate_region(b"c").await.unwrap();
        assert_eq!(middle.start_key, b"b");
        assert_eq!(middle.end_key, b"d");

        let last = cluster.locate_region(b"zzz").await.unwrap();
        assert_eq!(last.end_key, b"");
    }

    #[tokio::test]
    async fn test_split_bumps_epoch() {
        let cluster = MemoryCluster::with_splits(["m"]);
        let stale = cluster.locate_region(b"a").await.unwrap();

        cluster.split("f");
        assert_eq!(cluster.region_count(), 3);

        let resp = cluster
            .read_index(&stale, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(
            resp.region_error,
            Some(RegionError::EpochNotMatch {
                region_id: stale.region_id
            })
        );

        let fresh = cluster.locate_region(b"a").await.unwrap();
        assert_eq!(fresh.end_key, b"f");
        let resp = cluster
            .read_index(&fresh, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(resp.read_index.is_some());
    }

    #[tokio::test]
    async fn test_safe_point_only_advances() {
        let cluster = MemoryCluster::new();
        assert_eq!(cluster.update_gc_safe_point(100).await.unwrap(), 100);
        assert_eq!(cluster.update_gc_safe_point(0).await.unwrap(), 100);
        assert_eq!(cluster.update_gc_safe_point(50).await.unwrap(), 100);
        assert_eq!(cluster.safe_point_requests(), vec![100, 0, 50]);
    }

    #[tokio::test]
    async fn test_gc_lifetime_trails_clock() {
        let cluster = MemoryCluster::new_with_config(
            Vec::<Vec<u8>>::new(),
            MemoryClusterConfig {
                gc_lifetime: Some(Duration::from_secs(600)),
                ..MemoryClusterConfig::default()
            },
        );
        cluster.set_physical_time(1_000_000);

        let sp = Timestamp::decode(cluster.update_gc_safe_point(0).await.unwrap());
        assert_eq!(sp, Timestamp::new(400_000, 0));
    }

    #[tokio::test]
    async fn test_timestamps_increase() {
        let cluster = MemoryCluster::new();
        cluster.set_physical_time(5);
        let a = cluster.get_timestamp().await.unwrap();
        let b = cluster.get_timestamp().await.unwrap();
        assert!(a < b);
        assert_eq!(a.physical, 5);
    }
}
