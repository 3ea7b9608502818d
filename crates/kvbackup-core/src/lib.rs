//! Core domain types and traits for kvbackup checkpoint coordination.

pub mod error;
pub mod keys;
pub mod meta;
pub mod metrics;
pub mod region;
pub mod timestamp;
pub mod traits;

pub use error::{BackupError, BackupResult, ClusterError, ClusterResult, ErrorKind};
pub use keys::{KeyDisplay, KeyRange};
pub use meta::{BackupMeta, RangeMeta};
pub use region::{ProbeResponse, RegionEpoch, RegionError, RegionLocation, StoreEndpoint};
pub use timestamp::{EncodedTimestamp, Timestamp, MAX_LOGICAL, MAX_PHYSICAL, PHYSICAL_SHIFT_BITS};
pub use traits::{ClusterClient, MetaSink};
