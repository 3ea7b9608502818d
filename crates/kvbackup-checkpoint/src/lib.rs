//! Checkpoint establishment and validation for incremental cluster backups.
//!
//! [`BackupCoordinator`] drives rounds; [`RangeScanner`] proves each range
//! readable region by region; [`SafePointGuard`] fences checkpoints against
//! the GC safe point.

pub mod backoff;
pub mod config;
pub mod coordinator;
pub mod memory;
pub mod safepoint;
pub mod scanner;
pub mod sink;

pub use backoff::{BackoffPolicy, Backoffer};
pub use config::{BackupConfig, BACKUP_DEFAULT_INTERVAL, GC_DEFAULT_LIFETIME, MAX_TXN_TIME_USE_MS};
pub use coordinator::{BackupCoordinator, CoordinatorState};
pub use memory::{MemoryCluster, MemoryClusterConfig, MockFailure};
pub use safepoint::SafePointGuard;
pub use scanner::{RangeScanner, ScanConfig};
pub use sink::{LocalMetaSink, MemoryMetaSink};
