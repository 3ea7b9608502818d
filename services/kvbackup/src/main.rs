use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kvbackup_checkpoint::{BackupCoordinator, LocalMetaSink, MemoryCluster, MemoryClusterConfig};
use kvbackup_core::{BackupError, ClusterError, ErrorKind, Timestamp, MAX_LOGICAL, MAX_PHYSICAL};

mod config;
mod pd;

use config::{split_endpoints, Config, LoggingConfig};
use pd::PdHttpClient;

#[derive(Parser, Debug)]
#[command(name = "kvbackup")]
#[command(about = "Consistent checkpoint coordinator for incremental cluster backups", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run backup rounds until interrupted
    Run {
        /// Configuration file (default: ./kvbackup.toml if present)
        #[arg(long, env = "KVBACKUP_CONFIG")]
        config: Option<PathBuf>,

        /// PD addresses used to label the cluster version (comma-separated)
        #[arg(long, value_delimiter = ',')]
        pd: Vec<String>,

        /// Seconds between rounds
        #[arg(long)]
        interval_secs: Option<u64>,

        /// Ranges scanned concurrently
        #[arg(long)]
        concurrency: Option<usize>,

        /// Directory for backup metadata
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Run a single round and exit
        #[arg(long, default_value = "false")]
        once: bool,
    },

    /// Print the cluster version reported by PD
    Version {
        /// PD addresses (comma-separated)
        #[arg(long, value_delimiter = ',', required = true, env = "KVBACKUP_PD")]
        pd: Vec<String>,

        /// HTTP timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },

    /// Decode a 64-bit timestamp into physical and logical parts
    DecodeTs {
        /// Encoded timestamp
        ts: u64,
    },

    /// Encode physical milliseconds and a logical counter into a timestamp
    EncodeTs {
        /// Physical time in milliseconds since the Unix epoch
        physical: i64,

        /// Logical counter
        logical: i64,
    },

    /// Generate a configuration file template
    GenerateConfig {
        /// Output configuration file path
        #[arg(long, default_value = config::DEFAULT_CONFIG_FILE)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            pd,
            interval_secs,
            concurrency,
            output_dir,
            once,
        } => {
            let mut cfg = match Config::load(config.as_deref()) {
                Ok(cfg) => cfg,
                Err(e) => {
                    eprintln!("❌ {e}");
                    return exit_code(ErrorKind::InvalidConfig);
                }
            };

            if !pd.is_empty() {
                cfg.pd.endpoints = pd.iter().flat_map(|p| split_endpoints(p)).collect();
            }
            if let Some(secs) = interval_secs {
                cfg.backup.interval_secs = secs;
            }
            if let Some(concurrency) = concurrency {
                cfg.backup.concurrency = concurrency;
            }
            if let Some(dir) = output_dir {
                cfg.output.dir = dir;
            }
            if once {
                cfg.backup.max_rounds = Some(1);
            }

            if let Err(e) = cfg.validate() {
                eprintln!("❌ {e}");
                return exit_code(ErrorKind::InvalidConfig);
            }

            init_logging(&cfg.logging);

            match run_backup(&cfg).await {
                Ok(rounds) => {
                    info!(rounds, "kvbackup finished");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    error!(error = %e, kind = ?e.kind(), "kvbackup failed");
                    exit_code(e.kind())
                }
            }
        }

        Commands::Version { pd, timeout_secs } => {
            init_logging(&LoggingConfig::default());

            let endpoints: Vec<String> = pd.iter().flat_map(|p| split_endpoints(p)).collect();
            let client = match PdHttpClient::new(endpoints, Duration::from_secs(timeout_secs)) {
                Ok(client) => client,
                Err(e) => {
                    eprintln!("❌ {e}");
                    return exit_code(ErrorKind::InvalidConfig);
                }
            };

            match client.cluster_version().await {
                Ok(version) => {
                    println!("{version}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to fetch cluster version: {e}");
                    exit_code(ErrorKind::Cluster)
                }
            }
        }

        Commands::DecodeTs { ts } => {
            let decoded = Timestamp::decode(ts);
            println!("physical: {}", decoded.physical);
            println!("logical:  {}", decoded.logical);
            if let Some(wall) = decoded.to_datetime() {
                println!("time:     {}", wall.to_rfc3339());
            }
            ExitCode::SUCCESS
        }

        Commands::EncodeTs { physical, logical } => match encode_ts(physical, logical) {
            Ok(encoded) => {
                println!("{encoded}");
                ExitCode::SUCCESS
            }
            Err(msg) => {
                eprintln!("❌ {msg}");
                exit_code(ErrorKind::InvalidConfig)
            }
        },

        Commands::GenerateConfig { output } => match generate_config(&output) {
            Ok(()) => {
                println!("✅ Configuration template written to: {}", output.display());
                println!("\nEdit the file and use it with:");
                println!("  kvbackup run --config {}", output.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to write {}: {e}", output.display());
                exit_code(ErrorKind::Persistence)
            }
        },
    }
}

fn encode_ts(physical: i64, logical: i64) -> Result<u64, String> {
    if !(0..=MAX_LOGICAL).contains(&logical) {
        return Err(format!("logical must be within 0..={MAX_LOGICAL}"));
    }
    let ts = Timestamp::new(physical, logical);
    if !ts.is_encodable() {
        return Err(format!(
            "physical time {physical} does not fit in a timestamp (0..={MAX_PHYSICAL})"
        ));
    }
    Ok(ts.encode())
}

/// Drives the coordinator over the configured in-memory topology until the
/// loop stops, then dumps metrics if asked to.
async fn run_backup(cfg: &Config) -> Result<u64, BackupError> {
    let version = cluster_version_label(cfg).await?;
    let backup_config = cfg.backup_config();

    let cluster = Arc::new(MemoryCluster::new_with_config(
        cfg.simulation.splits.iter().map(String::as_bytes),
        MemoryClusterConfig {
            latency: Duration::from_millis(cfg.simulation.probe_latency_ms),
            track_history: false,
            gc_lifetime: Some(backup_config.gc_lifetime),
            version,
        },
    ));
    info!(
        regions = cluster.region_count(),
        ranges = backup_config.ranges.len(),
        "Simulated cluster ready"
    );

    let sink = Arc::new(LocalMetaSink::new(&cfg.output.dir).await?);
    let coordinator = BackupCoordinator::new(cluster, sink, backup_config)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = coordinator.run_backup_loop(cancel).await;

    if cfg.output.write_metrics {
        let path = cfg.output.dir.join("metrics.prom");
        if let Err(e) = tokio::fs::write(&path, kvbackup_core::metrics::export_prometheus()).await
        {
            warn!(path = %path.display(), error = %e, "Failed to write metrics");
        }
    }

    result
}

/// Version label written into each round's metadata.
///
/// Checkpoints come from the in-memory cluster, so the label always says
/// so, carrying the PD version alongside when endpoints are configured.
async fn cluster_version_label(cfg: &Config) -> Result<String, BackupError> {
    if cfg.pd.endpoints.is_empty() {
        return Ok(simulated_label(None));
    }

    let client = PdHttpClient::new(
        cfg.pd.endpoints.clone(),
        Duration::from_secs(cfg.pd.timeout_secs),
    )
    .map_err(|e| BackupError::invalid_config(e.to_string()))?;
    info!(endpoints = ?client.endpoints(), "Fetching cluster version from PD");

    let version = client.cluster_version().await.map_err(|e| {
        BackupError::cluster(
            "fetch cluster version",
            ClusterError::transport(e.to_string()),
        )
    })?;
    Ok(simulated_label(Some(&version)))
}

fn simulated_label(pd_version: Option<&str>) -> String {
    match pd_version {
        Some(version) => format!("simulated (pd {version})"),
        None => "simulated".to_string(),
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("🛑 Received SIGINT (Ctrl+C), stopping after the current step...");
            cancel.cancel();
        }
        Err(e) => warn!(error = %e, "Failed to install Ctrl+C handler"),
    }
}

fn exit_code(kind: ErrorKind) -> ExitCode {
    ExitCode::from(exit_status(kind))
}

fn exit_status(kind: ErrorKind) -> u8 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::InvalidConfig => 2,
        ErrorKind::StaleCheckpoint => 3,
        ErrorKind::RetryExhausted => 4,
        ErrorKind::Cluster => 5,
        ErrorKind::CheckpointRegressed => 6,
        ErrorKind::Persistence => 7,
        ErrorKind::Cancelled => 130,
    }
}

fn generate_config(output: &Path) -> std::io::Result<()> {
    std::fs::write(output, CONFIG_TEMPLATE)
}

const CONFIG_TEMPLATE: &str = r#"# kvbackup configuration
# Precedence: CLI flags > KVBACKUP_* environment variables > this file > defaults

[backup]
interval_secs = 60          # must stay below gc_lifetime_secs
concurrency = 4
gc_lifetime_secs = 600
max_txn_time_use_ms = 590000
probe_timeout_secs = 60
max_retries = 10            # per key, on region errors
initial_backoff_ms = 2
max_backoff_ms = 500
# max_rounds = 1

# Sorted, non-overlapping; an empty end_key means "to the end of the key space".
ranges = [
    { start_key = "", end_key = "" },
]

[pd]
endpoints = []              # e.g. ["127.0.0.1:2379"]
timeout_secs = 30

[output]
dir = "./backupmeta"
write_metrics = true

[logging]
level = "info"              # trace, debug, info, warn, error
format = "pretty"           # pretty or json

[simulation]
splits = ["g", "n", "t"]
probe_latency_ms = 0
"#;

fn init_logging(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    if logging.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_template_parses_and_validates() {
        let config: Config = toml::from_str(CONFIG_TEMPLATE).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.simulation.splits.len(), 3);
        assert_eq!(config.backup_config().ranges.len(), 1);
    }

    #[test]
    fn test_generate_config_writes_template() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kvbackup.toml");
        generate_config(&path).unwrap();
        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.backup.interval_secs, 60);
    }

    #[test]
    fn test_exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::Internal,
            ErrorKind::InvalidConfig,
            ErrorKind::StaleCheckpoint,
            ErrorKind::RetryExhausted,
            ErrorKind::Cluster,
            ErrorKind::CheckpointRegressed,
            ErrorKind::Persistence,
            ErrorKind::Cancelled,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| exit_status(*k)).collect();
        assert!(codes.iter().all(|&c| c != 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_encode_ts_rejects_overflow() {
        assert_eq!(encode_ts(1, 2), Ok((1 << 18) + 2));
        assert_eq!(encode_ts(MAX_PHYSICAL, MAX_LOGICAL), Ok(u64::MAX));

        let err = encode_ts(70_368_744_177_664, 0).unwrap_err();
        assert!(err.contains("does not fit"), "{err}");
        assert!(encode_ts(-1, 0).is_err());
        assert!(encode_ts(1, MAX_LOGICAL + 1).unwrap_err().contains("logical"));
    }

    #[test]
    fn test_simulated_label_never_looks_like_a_real_cluster() {
        assert_eq!(simulated_label(None), "simulated");
        assert_eq!(simulated_label(Some("7.5.0")), "simulated (pd 7.5.0)");
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::parse_from([
            "kvbackup",
            "run",
            "--pd",
            "pd-1:2379,pd-2:2379",
            "--interval-secs",
            "30",
            "--once",
        ]);
        match cli.command {
            Commands::Run {
                pd,
                interval_secs,
                once,
                ..
            } => {
                assert_eq!(pd, vec!["pd-1:2379", "pd-2:2379"]);
                assert_eq!(interval_secs, Some(30));
                assert!(once);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_once_writes_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.output.dir = dir.path().join("meta");
        cfg.backup.max_rounds = Some(1);
        cfg.simulation.splits = vec!["g".to_string(), "t".to_string()];

        let rounds = run_backup(&cfg).await.unwrap();
        assert_eq!(rounds, 1);

        let sink = LocalMetaSink::new(&cfg.output.dir).await.unwrap();
        let meta = sink.load_latest().await.unwrap().unwrap();
        assert_eq!(meta.cluster_version, "simulated");
        assert_eq!(meta.ranges[0].regions, 3);
        assert!(cfg.output.dir.join("metrics.prom").exists());
    }
}
