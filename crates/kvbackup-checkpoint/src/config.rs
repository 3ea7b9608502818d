use std::time::Duration;

use kvbackup_core::{BackupError, BackupResult, KeyRange};

use crate::backoff::BackoffPolicy;
use crate::scanner::ScanConfig;

/// Default GC lifetime of the cluster: versions older than this may be collected.
pub const GC_DEFAULT_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// Default pause between backup rounds.
pub const BACKUP_DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Longest a transaction may stay in flight between begin and commit (ms).
///
/// The checkpoint is taken this far behind the oracle so that every
/// transaction committed at or before it is already visible.
pub const MAX_TXN_TIME_USE_MS: u64 = 590_000;

/// Coordinator configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Pause between rounds; must stay below `gc_lifetime`.
    pub interval: Duration,

    /// Maximum number of ranges scanned concurrently.
    pub concurrency: usize,

    /// GC lifetime configured on the cluster.
    pub gc_lifetime: Duration,

    /// Safety margin subtracted from the oracle timestamp, in milliseconds.
    pub max_txn_time_use_ms: u64,

    /// Region scan settings.
    pub scan: ScanConfig,

    /// Ranges to back up, sorted and non-overlapping.
    pub ranges: Vec<KeyRange>,

    /// Stop after this many rounds; run until cancelled when `None`.
    pub max_rounds: Option<u64>,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: BACKUP_DEFAULT_INTERVAL,
            concurrency: 4,
            gc_lifetime: GC_DEFAULT_LIFETIME,
            max_txn_time_use_ms: MAX_TXN_TIME_USE_MS,
            scan: ScanConfig::default(),
            ranges: vec![KeyRange::full()],
            max_rounds: None,
        }
    }
}

impl BackupConfig {
    /// Sets the backoff policy for region errors.
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.scan.backoff = backoff;
        self
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `BackupError::InvalidConfig` describing the first violation.
    pub fn validate(&self) -> BackupResult<()> {
        if self.interval >= self.gc_lifetime {
            return Err(BackupError::invalid_config(format!(
                "backup interval {:?} is too large, must be < GC lifetime {:?}",
                self.interval, self.gc_lifetime
            )));
        }

        if Duration::from_millis(self.max_txn_time_use_ms) >= self.gc_lifetime {
            return Err(BackupError::invalid_config(format!(
                "max_txn_time_use {}ms must be < GC lifetime {:?}",
                self.max_txn_time_use_ms, self.gc_lifetime
            )));
        }

        if self.concurrency == 0 {
            return Err(BackupError::invalid_config("concurrency must be > 0"));
        }

        if self.scan.probe_timeout.is_zero() {
            return Err(BackupError::invalid_config("probe_timeout must be > 0"));
        }

        self.scan
            .backoff
            .validate()
            .map_err(|e| BackupError::invalid_config(format!("invalid backoff policy: {e}")))?;

        if self.max_rounds == Some(0) {
            return Err(BackupError::invalid_config("max_rounds must be > 0 when set"));
        }

        validate_ranges(&self.ranges)
    }
}

/// Ranges must be individually well-formed, sorted and non-overlapping; an
/// unbounded range may only come last.
fn validate_ranges(ranges: &[KeyRange]) -> BackupResult<()> {
    if ranges.is_empty() {
        return Err(BackupError::invalid_config("at least one range is required"));
    }

    for range in ranges {
        if !range.is_unbounded() && range.start_key > range.end_key {
            return Err(BackupError::invalid_config(format!(
                "range {range} has start key after end key"
            )));
        }
    }

    for pair in ranges.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if prev.is_unbounded() {
            return Err(BackupError::invalid_config(format!(
                "unbounded range {prev} must be the last range"
            )));
        }
        if prev.end_key > next.start_key {
            return Err(BackupError::invalid_config(format!(
                "ranges {prev} and {next} overlap or are out of order"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvbackup_core::ErrorKind;

    #[test]
    fn test_default_config_is_valid() {
        let config = BackupConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.interval, GC_DEFAULT_LIFETIME / 10);
    }

    #[test]
    fn test_interval_must_be_below_gc_lifetime() {
        let config = BackupConfig {
            interval: GC_DEFAULT_LIFETIME,
            ..BackupConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidConfig);
        assert!(err.to_string().contains("too large"));

        let config = BackupConfig {
            interval: GC_DEFAULT_LIFETIME - Duration::from_millis(1),
            ..BackupConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_margin_must_be_below_gc_lifetime() {
        let config = BackupConfig {
            max_txn_time_use_ms: 600_000,
            ..BackupConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = BackupConfig {
            concurrency: 0,
            ..BackupConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_range_ordering() {
        let sorted = vec![
            KeyRange::new("a", "c"),
            KeyRange::new("c", "c"),
            KeyRange::new("e", ""),
        ];
        assert!(validate_ranges(&sorted).is_ok());

        let overlapping = vec![KeyRange::new("a", "d"), KeyRange::new("c", "f")];
        assert!(validate_ranges(&overlapping).is_err());

        let unbounded_first = vec![KeyRange::new("a", ""), KeyRange::new("c", "f")];
        assert!(validate_ranges(&unbounded_first).is_err());

        let inverted = vec![KeyRange::new("d", "a")];
        assert!(validate_ranges(&inverted).is_err());

        assert!(validate_ranges(&[]).is_err());
    }
}
