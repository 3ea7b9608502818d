//! Prometheus metrics for backup rounds and range scans.
//!
//! Metrics are registered lazily on first access using once_cell::Lazy.

use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Backup rounds by outcome (success, stale_checkpoint, error, cancelled).
pub static BACKUP_ROUNDS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kvbackup_rounds_total",
        "Total number of backup rounds by outcome",
        &["status"]
    )
    .expect("Failed to register backup rounds counter")
});

/// Wall time of one backup round.
pub static ROUND_DURATION: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "kvbackup_round_duration_seconds",
        "Backup round duration in seconds",
        vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("Failed to register round duration histogram")
});

/// Regions whose leaders acknowledged a read-index probe.
pub static REGIONS_CONFIRMED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "kvbackup_regions_confirmed_total",
        "Total number of regions confirmed by read-index probes"
    )
    .expect("Failed to register regions confirmed counter")
});

/// Backoffs taken after region errors, by error type.
pub static REGION_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "kvbackup_region_retries_total",
        "Total number of region error backoffs",
        &["error"]
    )
    .expect("Failed to register region retries counter")
});

/// Physical part of the last emitted checkpoint (ms).
pub static LAST_CHECKPOINT_PHYSICAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kvbackup_last_checkpoint_physical_ms",
        "Physical time of the last emitted checkpoint"
    )
    .expect("Failed to register checkpoint gauge")
});

/// Physical part of the last observed GC safe point (ms).
pub static LAST_SAFE_POINT_PHYSICAL: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "kvbackup_last_safe_point_physical_ms",
        "Physical time of the last observed GC safe point"
    )
    .expect("Failed to register safe point gauge")
});

/// Encodes all registered metrics in the Prometheus text format.
pub fn export_prometheus() -> String {
    use prometheus::Encoder;

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
