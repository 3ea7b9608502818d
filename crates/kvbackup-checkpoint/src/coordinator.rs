//! Backup round loop.
//!
//! Each round takes a checkpoint behind the timestamp oracle, proves every
//! configured range readable at that checkpoint, fences the checkpoint
//! against the GC safe point and hands the resulting [`BackupMeta`] to a
//! [`MetaSink`]. Rounds repeat every `interval` until cancelled.
//!
//! # States
//!
//! - **Idle:** constructed, loop not started
//! - **Running:** a round is in progress
//! - **WaitingForNextRound:** the round finished, waiting for the interval
//! - **Stopped:** cancelled, bounded by `max_rounds`, or failed fatally

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use kvbackup_core::metrics::{BACKUP_ROUNDS, LAST_CHECKPOINT_PHYSICAL, ROUND_DURATION};
use kvbackup_core::{
    BackupError, BackupMeta, BackupResult, ClusterClient, ErrorKind, MetaSink, RangeMeta,
    Timestamp,
};

use crate::config::BackupConfig;
use crate::safepoint::SafePointGuard;
use crate::scanner::RangeScanner;

/// Lifecycle of the round loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Running { round: u64 },
    WaitingForNextRound { round: u64 },
    Stopped,
}

/// Drives repeated checkpoint rounds against one cluster.
pub struct BackupCoordinator {
    client: Arc<dyn ClusterClient>,
    sink: Arc<dyn MetaSink>,
    config: BackupConfig,
    scanner: Arc<RangeScanner>,
    guard: SafePointGuard,
    state_tx: watch::Sender<CoordinatorState>,
    last_checkpoint: Mutex<Option<Timestamp>>,
}

impl BackupCoordinator {
    /// Creates a coordinator after validating `config`.
    ///
    /// # Errors
    ///
    /// Returns `BackupError::InvalidConfig` when the configuration is
    /// rejected, e.g. an interval that is not below the GC lifetime.
    pub fn new(
        client: Arc<dyn ClusterClient>,
        sink: Arc<dyn MetaSink>,
        config: BackupConfig,
    ) -> BackupResult<Self> {
        config.validate()?;

        let scanner = Arc::new(RangeScanner::new(client.clone(), config.scan.clone()));
        let guard = SafePointGuard::new(client.clone());
        let (state_tx, _) = watch::channel(CoordinatorState::Idle);

        Ok(Self {
            client,
            sink,
            config,
            scanner,
            guard,
            state_tx,
            last_checkpoint: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Current loop state.
    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    /// Subscribes to state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Runs rounds until `cancel` fires, `max_rounds` is reached or a round
    /// fails.
    ///
    /// Round numbers continue after the sink's latest recorded round.
    /// Returns the number of rounds completed by this call. Cancellation is a
    /// clean stop; every other error is fatal and returned as is.
    pub async fn run_backup_loop(&self, cancel: CancellationToken) -> BackupResult<u64> {
        let result = self.round_loop(&cancel).await;
        self.set_state(CoordinatorState::Stopped);

        match result {
            Ok(rounds) => {
                info!(rounds, "Backup loop stopped");
                Ok(rounds)
            }
            Err(e) => {
                error!(error = %e, kind = ?e.kind(), "Backup loop failed");
                Err(e)
            }
        }
    }

    async fn round_loop(&self, cancel: &CancellationToken) -> BackupResult<u64> {
        let cluster_version = self
            .client
            .cluster_version()
            .await
            .map_err(|e| BackupError::cluster("fetch cluster version", e))?;
        let resumed = self.resume().await?;
        info!(
            cluster_version = %cluster_version,
            first_round = resumed + 1,
            "Starting backup loop"
        );

        let mut completed = 0u64;
        loop {
            if cancel.is_cancelled() {
                return Ok(completed);
            }

            let round = resumed + completed + 1;
            self.set_state(CoordinatorState::Running { round });

            match self.run_round(round, &cluster_version, cancel).await {
                Ok(_) => completed += 1,
                Err(e) if e.is_cancelled() => {
                    BACKUP_ROUNDS.with_label_values(&["cancelled"]).inc();
                    info!(round, "Backup round cancelled");
                    return Ok(completed);
                }
                Err(e) => return Err(e),
            }

            if self.config.max_rounds.is_some_and(|max| completed >= max) {
                return Ok(completed);
            }

            self.set_state(CoordinatorState::WaitingForNextRound { round });
            tokio::select! {
                () = cancel.cancelled() => return Ok(completed),
                () = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }

    /// Continues from the sink's latest round so that round numbers keep
    /// increasing and checkpoints are compared against the last persisted one.
    ///
    /// Returns the last persisted round number, `0` for an empty sink.
    async fn resume(&self) -> BackupResult<u64> {
        let Some(latest) = self.sink.latest().await? else {
            return Ok(0);
        };

        if let Some(checkpoint) = latest.checkpoint() {
            let mut last = self.last_checkpoint.lock();
            if last.map_or(true, |previous| checkpoint > previous) {
                *last = Some(checkpoint);
            }
        }

        info!(
            round = latest.round,
            checkpoint = %latest.checkpoint().unwrap_or_default(),
            "Resuming after persisted round"
        );
        Ok(latest.round)
    }

    /// Runs one round and records its metadata.
    ///
    /// # Errors
    ///
    /// - `BackupError::StaleCheckpoint` if the safe point reached the
    ///   checkpoint; nothing is recorded in that case
    /// - `BackupError::CheckpointRegressed` if the checkpoint went backwards
    /// - scan, cluster and persistence errors as reported
    pub async fn run_round(
        &self,
        round: u64,
        cluster_version: &str,
        cancel: &CancellationToken,
    ) -> BackupResult<BackupMeta> {
        let started = Instant::now();
        let result = self.do_round(round, cluster_version, cancel).await;
        ROUND_DURATION.observe(started.elapsed().as_secs_f64());

        match &result {
            Ok(meta) => {
                BACKUP_ROUNDS.with_label_values(&["success"]).inc();
                info!(
                    round,
                    checkpoint = %meta.checkpoint().unwrap_or_default(),
                    safe_point = %meta.safe_point,
                    ranges = meta.ranges.len(),
                    regions = meta.total_regions(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Backup round done"
                );
            }
            Err(e) if e.kind() == ErrorKind::StaleCheckpoint => {
                BACKUP_ROUNDS.with_label_values(&["stale_checkpoint"]).inc();
            }
            Err(e) if e.is_cancelled() => {}
            Err(e) => {
                BACKUP_ROUNDS.with_label_values(&["error"]).inc();
                warn!(round, error = %e, "Backup round failed");
            }
        }

        result
    }

    async fn do_round(
        &self,
        round: u64,
        cluster_version: &str,
        cancel: &CancellationToken,
    ) -> BackupResult<BackupMeta> {
        let checkpoint = self.next_checkpoint().await?;
        info!(
            round,
            checkpoint = %checkpoint,
            wall_time = ?checkpoint.to_datetime(),
            "Backup round started"
        );

        let ranges = self.scan_ranges(checkpoint, cancel).await?;

        let safe_point = self.guard.fetch_safe_point().await?;
        for range in &ranges {
            if let Err(e) = SafePointGuard::validate(safe_point, range.checkpoint) {
                error!(
                    round,
                    safe_point = %safe_point,
                    checkpoint = %range.checkpoint,
                    "GC safe point reached the checkpoint, aborting"
                );
                return Err(e);
            }
        }

        self.check_monotonic(checkpoint)?;

        let meta = BackupMeta {
            round,
            created_at: Utc::now(),
            cluster_version: cluster_version.to_string(),
            safe_point,
            ranges,
        };
        self.sink.persist(&meta).await?;

        *self.last_checkpoint.lock() = Some(checkpoint);
        LAST_CHECKPOINT_PHYSICAL.set(checkpoint.physical);
        Ok(meta)
    }

    /// Oracle timestamp shifted back by the transaction safety margin.
    async fn next_checkpoint(&self) -> BackupResult<Timestamp> {
        let now = self
            .client
            .get_timestamp()
            .await
            .map_err(|e| BackupError::cluster("get timestamp", e))?;
        Ok(now.sub_millis(self.config.max_txn_time_use_ms))
    }

    fn check_monotonic(&self, checkpoint: Timestamp) -> BackupResult<()> {
        match *self.last_checkpoint.lock() {
            Some(previous) if checkpoint < previous => Err(BackupError::CheckpointRegressed {
                previous,
                current: checkpoint,
            }),
            _ => Ok(()),
        }
    }

    /// Scans every configured range with at most `concurrency` scans in
    /// flight, returning results in configured order.
    async fn scan_ranges(
        &self,
        checkpoint: Timestamp,
        cancel: &CancellationToken,
    ) -> BackupResult<Vec<RangeMeta>> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut join_set = JoinSet::new();

        for (idx, range) in self.config.ranges.iter().cloned().enumerate() {
            let scanner = self.scanner.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| BackupError::Cancelled)?;
                let regions = scanner.scan(&range, &cancel).await?;
                BackupResult::Ok((idx, RangeMeta::new(&range, checkpoint, regions)))
            });
        }

        let mut slots: Vec<Option<RangeMeta>> = vec![None; self.config.ranges.len()];
        while let Some(joined) = join_set.join_next().await {
            let outcome = joined
                .map_err(|e| BackupError::Internal(format!("range scan task failed: {e}")))
                .and_then(|r| r);

            match outcome {
                Ok((idx, meta)) => slots[idx] = Some(meta),
                Err(e) => {
                    join_set.abort_all();
                    return Err(e);
                }
            }
        }

        slots
            .into_iter()
            .map(|slot| slot.ok_or_else(|| BackupError::Internal("range scan missing".into())))
            .collect()
    }

    fn set_state(&self, state: CoordinatorState) {
        self.state_tx.send_replace(state);
    }
}
