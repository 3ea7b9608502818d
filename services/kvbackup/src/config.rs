//! Configuration for the `kvbackup` binary.
//!
//! Supports multiple configuration sources with precedence:
//! 1. Command-line flags (highest priority)
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values (lowest priority)

use std::path::{Path, PathBuf};
use std::time::Duration;

use kvbackup_checkpoint::{BackoffPolicy, BackupConfig, ScanConfig};
use kvbackup_core::KeyRange;
use serde::{Deserialize, Serialize};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "kvbackup.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Round loop settings
    #[serde(default)]
    pub backup: BackupSection,

    /// Placement driver endpoints
    #[serde(default)]
    pub pd: PdConfig,

    /// Where backup metadata is written
    #[serde(default)]
    pub output: OutputConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Region layout of the in-memory cluster driven by `run`
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Round loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSection {
    /// Seconds between rounds (default: 60)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Ranges scanned concurrently (default: 4)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// GC lifetime of the cluster in seconds (default: 600)
    #[serde(default = "default_gc_lifetime_secs")]
    pub gc_lifetime_secs: u64,

    /// Safety margin behind the oracle in milliseconds (default: 590000)
    #[serde(default = "default_max_txn_time_use_ms")]
    pub max_txn_time_use_ms: u64,

    /// Read-index probe deadline in seconds (default: 60)
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    /// Retries per key on region errors (default: 10)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// First backoff delay in milliseconds (default: 2)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff delay cap in milliseconds (default: 500)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Stop after this many rounds; unbounded when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<u64>,

    /// Key ranges to back up (default: the whole key space)
    #[serde(default = "default_ranges")]
    pub ranges: Vec<RangeConfig>,
}

/// One key range; keys are taken as raw UTF-8 bytes, empty means unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeConfig {
    #[serde(default)]
    pub start_key: String,
    #[serde(default)]
    pub end_key: String,
}

/// Placement driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PdConfig {
    /// PD addresses, tried in order (default: none)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// HTTP timeout in seconds (default: 30)
    #[serde(default = "default_pd_timeout_secs")]
    pub timeout_secs: u64,
}

/// Output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for backup metadata (default: "./backupmeta")
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Dump Prometheus metrics to `<dir>/metrics.prom` on exit (default: true)
    #[serde(default = "default_true")]
    pub write_metrics: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty (default: "pretty")
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// In-memory topology used by `run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Region split keys
    #[serde(default)]
    pub splits: Vec<String>,

    /// Latency of each read-index probe in milliseconds
    #[serde(default)]
    pub probe_latency_ms: u64,
}

// Default value functions
fn default_interval_secs() -> u64 {
    60
}

fn default_concurrency() -> usize {
    4
}

fn default_gc_lifetime_secs() -> u64 {
    600
}

fn default_max_txn_time_use_ms() -> u64 {
    kvbackup_checkpoint::MAX_TXN_TIME_USE_MS
}

fn default_probe_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    10
}

fn default_initial_backoff_ms() -> u64 {
    2
}

fn default_max_backoff_ms() -> u64 {
    500
}

fn default_ranges() -> Vec<RangeConfig> {
    vec![RangeConfig {
        start_key: String::new(),
        end_key: String::new(),
    }]
}

fn default_pd_timeout_secs() -> u64 {
    30
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./backupmeta")
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for BackupSection {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            concurrency: default_concurrency(),
            gc_lifetime_secs: default_gc_lifetime_secs(),
            max_txn_time_use_ms: default_max_txn_time_use_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_rounds: None,
            ranges: default_ranges(),
        }
    }
}

impl Default for PdConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_secs: default_pd_timeout_secs(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            write_metrics: default_true(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file doesn't exist or has invalid TOML syntax.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError {
            path: path.clone(),
            source: e,
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::TomlError { path, source: e })
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Reads `path` when given, else `kvbackup.toml` if it exists, else
    /// defaults. Supported environment variables:
    /// - `KVBACKUP_PD` - Comma-separated PD addresses
    /// - `KVBACKUP_INTERVAL_SECS` - Seconds between rounds
    /// - `KVBACKUP_CONCURRENCY` - Concurrent range scans
    /// - `KVBACKUP_OUTPUT_DIR` - Metadata directory
    /// - `KVBACKUP_LOG_LEVEL` - Log level
    /// - `KVBACKUP_LOG_FORMAT` - Log format
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(pd) = std::env::var("KVBACKUP_PD") {
            self.pd.endpoints = split_endpoints(&pd);
        }

        if let Ok(secs) = std::env::var("KVBACKUP_INTERVAL_SECS") {
            if let Ok(secs) = secs.parse() {
                self.backup.interval_secs = secs;
            }
        }

        if let Ok(concurrency) = std::env::var("KVBACKUP_CONCURRENCY") {
            if let Ok(concurrency) = concurrency.parse() {
                self.backup.concurrency = concurrency;
            }
        }

        if let Ok(dir) = std::env::var("KVBACKUP_OUTPUT_DIR") {
            self.output.dir = PathBuf::from(dir);
        }

        if let Ok(level) = std::env::var("KVBACKUP_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(format) = std::env::var("KVBACKUP_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output.dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationError(
                "output.dir cannot be empty".to_string(),
            ));
        }

        if self.pd.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "pd.timeout_secs must be > 0".to_string(),
            ));
        }

        if self.pd.endpoints.iter().any(|e| e.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "pd.endpoints cannot contain empty addresses".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.level must be one of: {}",
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "logging.format must be one of: {}",
                valid_formats.join(", ")
            )));
        }

        self.backup_config()
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Coordinator settings derived from the `[backup]` section.
    pub fn backup_config(&self) -> BackupConfig {
        let backup = &self.backup;
        BackupConfig {
            interval: Duration::from_secs(backup.interval_secs),
            concurrency: backup.concurrency,
            gc_lifetime: Duration::from_secs(backup.gc_lifetime_secs),
            max_txn_time_use_ms: backup.max_txn_time_use_ms,
            scan: ScanConfig {
                probe_timeout: Duration::from_secs(backup.probe_timeout_secs),
                backoff: BackoffPolicy {
                    max_retries: backup.max_retries,
                    initial_delay_ms: backup.initial_backoff_ms,
                    max_delay_ms: backup.max_backoff_ms,
                    ..BackoffPolicy::default()
                },
            },
            ranges: backup
                .ranges
                .iter()
                .map(|r| KeyRange::new(r.start_key.as_bytes(), r.end_key.as_bytes()))
                .collect(),
            max_rounds: backup.max_rounds,
        }
    }
}

/// Splits a comma-separated address list, dropping blanks.
pub fn split_endpoints(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// I/O error reading configuration file
    #[error("Failed to read config file {path:?}: {source}")]
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("Failed to parse TOML in {path:?}: {source}")]
    TomlError {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Validation error
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.backup.interval_secs, 60);
        assert_eq!(config.backup.concurrency, 4);
        assert_eq!(config.backup.ranges, default_ranges());
        assert!(config.pd.endpoints.is_empty());
        assert_eq!(config.output.dir, PathBuf::from("./backupmeta"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backup_config_mapping() {
        let mut config = Config::default();
        config.backup.max_retries = 3;
        config.backup.ranges = vec![
            RangeConfig {
                start_key: "a".to_string(),
                end_key: "m".to_string(),
            },
            RangeConfig {
                start_key: "m".to_string(),
                end_key: String::new(),
            },
        ];

        let backup = config.backup_config();
        assert_eq!(backup.interval, Duration::from_secs(60));
        assert_eq!(backup.gc_lifetime, Duration::from_secs(600));
        assert_eq!(backup.scan.backoff.max_retries, 3);
        assert_eq!(backup.ranges[0], KeyRange::new("a", "m"));
        assert!(backup.ranges[1].is_unbounded());
    }

    #[test]
    fn test_interval_beyond_gc_lifetime_rejected() {
        let mut config = Config::default();
        config.backup.interval_secs = 600;

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("too large"));
    }

    #[test]
    fn test_config_validation_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("logging.format must be"));
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
            [backup]
            interval_secs = 30
            concurrency = 8
            max_rounds = 2
            ranges = [
                { start_key = "a", end_key = "f" },
                { start_key = "t" },
            ]

            [pd]
            endpoints = ["127.0.0.1:2379", "http://10.0.0.2:2379"]

            [simulation]
            splits = ["c", "t"]
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.backup.interval_secs, 30);
        assert_eq!(config.backup.concurrency, 8);
        assert_eq!(config.backup.max_rounds, Some(2));
        assert_eq!(config.backup.max_retries, 10);
        assert_eq!(config.backup.ranges.len(), 2);
        assert_eq!(config.backup.ranges[1].end_key, "");
        assert_eq!(config.pd.endpoints.len(), 2);
        assert_eq!(config.pd.timeout_secs, 30);
        assert_eq!(config.simulation.splits, vec!["c", "t"]);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip_of_defaults() {
        let toml_str = toml::to_string(&Config::default()).unwrap();
        assert!(toml_str.contains("interval_secs"));
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.backup.ranges, default_ranges());
    }

    #[test]
    fn test_from_file_reports_path() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[backup\ninterval_secs = ").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::TomlError { .. }));
        assert!(err.to_string().contains("broken.toml"));

        let missing = Config::from_file(dir.path().join("missing.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::IoError { .. }));
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("KVBACKUP_PD", "pd-1:2379, pd-2:2379,");
        std::env::set_var("KVBACKUP_CONCURRENCY", "16");
        std::env::set_var("KVBACKUP_OUTPUT_DIR", "/tmp/kvbackup-meta");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.pd.endpoints, vec!["pd-1:2379", "pd-2:2379"]);
        assert_eq!(config.backup.concurrency, 16);
        assert_eq!(config.output.dir, PathBuf::from("/tmp/kvbackup-meta"));

        // Clean up
        std::env::remove_var("KVBACKUP_PD");
        std::env::remove_var("KVBACKUP_CONCURRENCY");
        std::env::remove_var("KVBACKUP_OUTPUT_DIR");
    }
}
