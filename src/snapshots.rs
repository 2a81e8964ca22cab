use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs as async_fs;

#[derive(Debug, Error)]
#[error("snapshot store: {0}")]
pub struct SnapshotError(String);

/// Optional sink for the screenshots a run captures.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists one PNG and returns where it went.
    async fn save(&self, run_id: &str, label: &str, png: &[u8]) -> Result<PathBuf, SnapshotError>;
}

/// Writes `<base>/<run_id>/<label>-<timestamp>.png`.
pub struct DiskSnapshotStore {
    base_dir: PathBuf,
}

impl DiskSnapshotStore {
    pub fn new<P: AsRef<Path>>(base: P) -> Self {
        Self { base_dir: base.as_ref().to_path_buf() }
    }
}

#[async_trait]
impl SnapshotStore for DiskSnapshotStore {
    async fn save(&self, run_id: &str, label: &str, png: &[u8]) -> Result<PathBuf, SnapshotError> {
        let dir = self.base_dir.join(run_id);
        async_fs::create_dir_all(&dir)
            .await
            .map_err(|e| SnapshotError(format!("create_dir: {}", e)))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let path = dir.join(format!("{label}-{stamp}.png"));
        async_fs::write(&path, png)
            .await
            .map_err(|e| SnapshotError(format!("write: {}", e)))?;
        Ok(path)
    }
}
