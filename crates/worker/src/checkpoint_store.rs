//! Durable checkpoint storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pipeline_core::{CheckpointRecord, Error, Result};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Where checkpoint records are persisted.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Persists a record durably; it must be loadable once this returns.
    async fn save(&self, record: &CheckpointRecord) -> Result<()>;

    /// The newest readable record, if any.
    async fn load_latest(&self) -> Result<Option<CheckpointRecord>>;
}

const FILE_PREFIX: &str = "chk-";
const FILE_SUFFIX: &str = ".json";

/// JSON files in a directory, one per checkpoint.
///
/// Each record is written to a temporary file, synced, then renamed into
/// place, so a crash never leaves a partially written checkpoint visible.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    retained: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, retained: usize) -> Self {
        Self {
            dir: dir.into(),
            retained: retained.max(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, checkpoint_id: u64) -> PathBuf {
        self.dir
            .join(format!("{}{:020}{}", FILE_PREFIX, checkpoint_id, FILE_SUFFIX))
    }

    /// Checkpoint ids on disk, newest first.
    async fn list(&self) -> Result<Vec<u64>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name
                .strip_prefix(FILE_PREFIX)
                .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
                .and_then(|id| id.parse::<u64>().ok())
            {
                ids.push(id);
            }
        }
        ids.sort_unstable_by(|a, b| b.cmp(a));
        Ok(ids)
    }

    async fn prune(&self) -> Result<()> {
        for id in self.list().await?.into_iter().skip(self.retained) {
            let path = self.path_for(id);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to prune checkpoint");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, record: &CheckpointRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let bytes = serde_json::to_vec_pretty(record)?;
        let target = self.path_for(record.checkpoint_id);
        let tmp = target.with_extension("json.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp, &target).await?;
        if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
            let _ = dir.sync_all().await;
        }

        debug!(checkpoint_id = record.checkpoint_id, path = %target.display(), "Checkpoint written");
        self.prune().await
    }

    async fn load_latest(&self) -> Result<Option<CheckpointRecord>> {
        for id in self.list().await? {
            let path = self.path_for(id);
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<CheckpointRecord>(&bytes) {
                Ok(record) => return Ok(Some(record)),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable checkpoint");
                }
            }
        }
        Ok(None)
    }
}

/// Loads the latest checkpoint, turning storage failures into
/// `CheckpointFailure`.
pub async fn load_restore_point(store: &dyn CheckpointStore) -> Result<Option<CheckpointRecord>> {
    store
        .load_latest()
        .await
        .map_err(|e| Error::checkpoint(format!("load latest: {}", e)))
}
