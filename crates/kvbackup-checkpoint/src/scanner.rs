//! Region-by-region read-index scan of a key range.
//!
//! The scanner walks `[start_key, end_key)` one region at a time: it
//! resolves the region owning the cursor, asks that region's leader for a
//! read index, and on success moves the cursor to the region's end key.
//! Region errors (split, merge, leader transfer) invalidate the cached
//! location and retry the same cursor under a bounded [`Backoffer`].

use std::sync::Arc;
use std::time::Duration;

use kvbackup_core::metrics::{REGIONS_CONFIRMED, REGION_RETRIES};
use kvbackup_core::{
    BackupError, BackupResult, ClusterClient, ClusterError, KeyDisplay, KeyRange, RegionError,
    RegionLocation,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::backoff::{BackoffPolicy, Backoffer};

/// Settings shared by all scans of a coordinator.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Deadline handed to each read-index probe.
    pub probe_timeout: Duration,
    /// Retry policy for region errors.
    pub backoff: BackoffPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Confirms that every region of a key range can serve a consistent read.
pub struct RangeScanner {
    client: Arc<dyn ClusterClient>,
    config: ScanConfig,
}

impl RangeScanner {
    #[must_use]
    pub fn new(client: Arc<dyn ClusterClient>, config: ScanConfig) -> Self {
        Self { client, config }
    }

    /// Scans `range` and returns the number of regions confirmed.
    ///
    /// # Errors
    ///
    /// - `BackupError::Cancelled` once `cancel` fires
    /// - `BackupError::RetryExhausted` when one key keeps hitting region errors
    /// - `BackupError::Cluster` for transport failures, with range/key context
    /// - `BackupError::ResponseBodyMissing` for malformed probe responses
    pub async fn scan(&self, range: &KeyRange, cancel: &CancellationToken) -> BackupResult<u64> {
        if range.is_empty() {
            debug!(range = %range, "Skipping empty range");
            return Ok(0);
        }

        let mut regions = 0u64;
        let mut cursor = range.start_key.clone();
        let mut backoff = Backoffer::new(self.config.backoff);

        loop {
            if cancel.is_cancelled() {
                return Err(BackupError::Cancelled);
            }

            match self.probe(range, &cursor).await? {
                Ok(location) => {
                    if !location.end_key.is_empty() && location.end_key <= cursor {
                        return Err(BackupError::Internal(format!(
                            "region {} ends at {} which does not advance past {}",
                            location.region_id,
                            KeyDisplay::from(location.end_key.as_slice()),
                            KeyDisplay::from(cursor.as_slice())
                        )));
                    }

                    regions += 1;
                    REGIONS_CONFIRMED.inc();
                    debug!(
                        region_id = location.region_id,
                        leader = %location.leader,
                        end_key = %KeyDisplay::from(location.end_key.as_slice()),
                        "Region confirmed"
                    );

                    cursor = location.end_key;
                    backoff.reset();

                    if range.is_exhausted_at(&cursor) {
                        break;
                    }
                }
                Err(region_err) => {
                    let attempts = backoff.attempts();
                    let Some(delay) = backoff.next_delay() else {
                        return Err(BackupError::RetryExhausted {
                            key: KeyDisplay::from(cursor.as_slice()),
                            attempts,
                            last: region_err,
                        });
                    };

                    REGION_RETRIES
                        .with_label_values(&[region_error_label(&region_err)])
                        .inc();
                    warn!(
                        key = %KeyDisplay::from(cursor.as_slice()),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %region_err,
                        "Region error, backing off"
                    );

                    tokio::select! {
                        () = cancel.cancelled() => return Err(BackupError::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        debug!(range = %range, regions, "Range scan complete");
        Ok(regions)
    }

    /// Locates and probes the region owning `key`.
    ///
    /// The outer result carries fatal errors, the inner one retryable
    /// region errors.
    async fn probe(
        &self,
        range: &KeyRange,
        key: &[u8],
    ) -> BackupResult<Result<RegionLocation, RegionError>> {
        let location = match self.client.locate_region(key).await {
            Ok(location) => location,
            Err(ClusterError::Region(err)) => return Ok(Err(err)),
            Err(err) => {
                return Err(BackupError::cluster(
                    format!(
                        "locate region for key {} in range {}",
                        KeyDisplay::from(key),
                        range
                    ),
                    err,
                ))
            }
        };

        let response = match self
            .client
            .read_index(&location, self.config.probe_timeout)
            .await
        {
            Ok(response) => response,
            Err(ClusterError::Region(err)) => {
                self.client.invalidate_region(location.region_id).await;
                return Ok(Err(err));
            }
            Err(err) => {
                return Err(BackupError::cluster(
                    format!(
                        "read index on region {} ({}) in range {}",
                        location.region_id, location.leader, range
                    ),
                    err,
                ))
            }
        };

        if let Some(err) = response.region_error {
            self.client.invalidate_region(location.region_id).await;
            return Ok(Err(err));
        }

        if response.read_index.is_none() {
            return Err(BackupError::ResponseBodyMissing {
                region_id: location.region_id,
            });
        }

        Ok(Ok(location))
    }
}

fn region_error_label(err: &RegionError) -> &'static str {
    match err {
        RegionError::NotLeader { .. } => "not_leader",
        RegionError::EpochNotMatch { .. } => "epoch_not_match",
        RegionError::RegionNotFound { .. } => "region_not_found",
        RegionError::KeyNotInRegion { .. } => "key_not_in_region",
        RegionError::ServerIsBusy { .. } => "server_is_busy",
        RegionError::StaleCommand => "stale_command",
    }
}
