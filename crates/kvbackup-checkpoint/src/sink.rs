//! Destinations for per-round backup metadata.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::info;

use kvbackup_core::{BackupError, BackupMeta, BackupResult, MetaSink};

/// File name of the copy that always holds the most recent round.
pub const LATEST_META_FILE: &str = "backupmeta.latest.json";

/// Writes each round's metadata as pretty JSON under a directory.
///
/// Every round lands in `backupmeta.<round>.json`; `backupmeta.latest.json`
/// is replaced atomically with the newest one.
pub struct LocalMetaSink {
    base_dir: PathBuf,
}

impl LocalMetaSink {
    /// Create a sink rooted at `base_dir`
    ///
    /// Creates the base directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns `BackupError::Io` if directory creation fails
    pub async fn new(base_dir: impl AsRef<Path>) -> BackupResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self { base_dir })
    }

    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the file holding `round`.
    #[must_use]
    pub fn round_path(&self, round: u64) -> PathBuf {
        self.base_dir.join(format!("backupmeta.{round:06}.json"))
    }

    /// Reads back the most recent metadata, if any round was recorded.
    pub async fn load_latest(&self) -> BackupResult<Option<BackupMeta>> {
        let path = self.base_dir.join(LATEST_META_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> BackupResult<()> {
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            BackupError::Persistence(format!("rename {} failed: {e}", tmp.display()))
        })
    }
}

#[async_trait]
impl MetaSink for LocalMetaSink {
    async fn persist(&self, meta: &BackupMeta) -> BackupResult<()> {
        let data = serde_json::to_vec_pretty(meta)?;

        let path = self.round_path(meta.round);
        self.write_atomic(&path, &data).await?;
        self.write_atomic(&self.base_dir.join(LATEST_META_FILE), &data)
            .await?;

        info!(round = meta.round, path = %path.display(), "Backup meta written");
        Ok(())
    }

    async fn latest(&self) -> BackupResult<Option<BackupMeta>> {
        self.load_latest().await
    }
}

/// Keeps recorded metadata in memory.
#[derive(Default)]
pub struct MemoryMetaSink {
    metas: RwLock<Vec<BackupMeta>>,
}

impl MemoryMetaSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded rounds, oldest first.
    #[must_use]
    pub fn metas(&self) -> Vec<BackupMeta> {
        self.metas.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.metas.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.metas.read().is_empty()
    }
}

#[async_trait]
impl MetaSink for MemoryMetaSink {
    async fn persist(&self, meta: &BackupMeta) -> BackupResult<()> {
        self.metas.write().push(meta.clone());
        Ok(())
    }

    async fn latest(&self) -> BackupResult<Option<BackupMeta>> {
        Ok(self.metas.read().last().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kvbackup_core::{KeyRange, RangeMeta, Timestamp};
    use tempfile::TempDir;

    fn sample(round: u64) -> BackupMeta {
        BackupMeta {
            round,
            created_at: Utc::now(),
            cluster_version: "v7.5.0".to_string(),
            safe_point: Timestamp::new(10, 0),
            ranges: vec![RangeMeta::new(&KeyRange::full(), Timestamp::new(20, round as i64), 3)],
        }
    }

    #[tokio::test]
    async fn test_local_sink_writes_round_and_latest() {
        let dir = TempDir::new().unwrap();
        let sink = LocalMetaSink::new(dir.path().join("meta")).await.unwrap();
        assert!(sink.latest().await.unwrap().is_none());

        sink.persist(&sample(1)).await.unwrap();
        sink.persist(&sample(2)).await.unwrap();

        assert!(sink.round_path(1).exists());
        assert!(sink.round_path(2).exists());

        let latest = sink.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.round, 2);
        assert_eq!(latest.ranges[0].checkpoint, Timestamp::new(20, 2));

        let first: BackupMeta =
            serde_json::from_slice(&std::fs::read(sink.round_path(1)).unwrap()).unwrap();
        assert_eq!(first.round, 1);
    }

    #[tokio::test]
    async fn test_memory_sink_keeps_order() {
        let sink = MemoryMetaSink::new();
        assert!(sink.is_empty());
        sink.persist(&sample(1)).await.unwrap();
        sink.persist(&sample(2)).await.unwrap();
        let rounds: Vec<u64> = sink.metas().iter().map(|m| m.round).collect();
        assert_eq!(rounds, vec![1, 2]);
        assert_eq!(sink.latest().await.unwrap().unwrap().round, 2);
    }
}
