//! Archive sink and its commit protocol.
//!
//! Rows are buffered per `(date, hour)` partition. A checkpoint flush writes
//! each buffer as a hidden staged file tagged with the checkpoint id. Once
//! the checkpoint is persisted, commit renames the staged files to visible
//! `part-<uuid>.parquet` files and writes `_SUCCESS` into every partition
//! whose first write is at least `commit_delay` old. Committed files are
//! never rewritten.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use pipeline_core::{EnrichedEvent, ProcessedRecord, Result, Sink};
use telemetry::metrics;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::columnar::write_rows;
use crate::config::ArchiveConfig;
use crate::partition::PartitionKey;

pub const SUCCESS_MARKER: &str = "_SUCCESS";
const STAGED_PREFIX: &str = ".staged-";

#[derive(Debug)]
struct PartitionProgress {
    first_write: Instant,
    /// Files committed since the marker was last written
    pending_marker: bool,
    committed_files: usize,
}

impl PartitionProgress {
    fn new() -> Self {
        Self {
            first_write: Instant::now(),
            pending_marker: false,
            committed_files: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct StagedFile {
    checkpoint_id: u64,
    partition: PartitionKey,
    path: PathBuf,
}

/// Outcome of [`ArchiveWriter::recover_staged`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub committed: usize,
    pub discarded: usize,
}

/// Time-partitioned Parquet archive sink.
pub struct ArchiveWriter {
    root: PathBuf,
    commit_delay: Duration,
    max_buffered_rows: usize,
    buffers: BTreeMap<PartitionKey, Vec<ProcessedRecord>>,
    buffered_rows: usize,
    partitions: BTreeMap<PartitionKey, PartitionProgress>,
    staged: Vec<StagedFile>,
    next_checkpoint_id: u64,
}

impl ArchiveWriter {
    pub fn new(config: &ArchiveConfig) -> Self {
        Self {
            root: config.root.clone(),
            commit_delay: config.commit_delay(),
            max_buffered_rows: config.max_buffered_rows.max(1),
            buffers: BTreeMap::new(),
            buffered_rows: 0,
            partitions: BTreeMap::new(),
            staged: Vec::new(),
            next_checkpoint_id: 1,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn buffered_rows(&self) -> usize {
        self.buffered_rows
    }

    /// Resolves staged files left by a previous run.
    ///
    /// Files of the restored checkpoint or older are committed; newer ones
    /// hold rows that will be replayed and are deleted.
    pub async fn recover_staged(
        &mut self,
        restored_checkpoint: Option<u64>,
    ) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.next_checkpoint_id = restored_checkpoint.map_or(1, |id| id + 1);

        let mut dates = match tokio::fs::read_dir(&self.root).await {
            Ok(dates) => dates,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e.into()),
        };

        while let Some(date_entry) = dates.next_entry().await? {
            if !date_entry.file_type().await?.is_dir() {
                continue;
            }
            let date_name = date_entry.file_name().to_string_lossy().into_owned();
            let mut hours = tokio::fs::read_dir(date_entry.path()).await?;

            while let Some(hour_entry) = hours.next_entry().await? {
                let hour_name = hour_entry.file_name().to_string_lossy().into_owned();
                let Some(key) = PartitionKey::parse(&date_name, &hour_name) else {
                    continue;
                };
                self.recover_partition(key, &hour_entry.path(), restored_checkpoint, &mut report)
                    .await?;
            }
        }

        info!(
            committed = report.committed,
            discarded = report.discarded,
            restored_checkpoint = ?restored_checkpoint,
            "Archive recovered"
        );
        Ok(report)
    }

    async fn recover_partition(
        &mut self,
        key: PartitionKey,
        dir: &Path,
        restored_checkpoint: Option<u64>,
        report: &mut RecoveryReport,
    ) -> Result<()> {
        let mut has_marker = false;
        let mut has_parts = false;
        let mut entries = tokio::fs::read_dir(dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == SUCCESS_MARKER {
                has_marker = true;
            } else if name.starts_with("part-") {
                has_parts = true;
            } else if let Some(checkpoint_id) = staged_checkpoint_id(&name) {
                if restored_checkpoint.is_some_and(|restored| checkpoint_id <= restored) {
                    publish(&entry.path(), dir).await?;
                    report.committed += 1;
                    has_parts = true;
                } else {
                    tokio::fs::remove_file(entry.path()).await?;
                    report.discarded += 1;
                }
            }
        }

        if has_parts && !has_marker {
            let progress = self.partitions.entry(key).or_insert_with(PartitionProgress::new);
            progress.pending_marker = true;
            progress.committed_files += 1;
        }
        Ok(())
    }

    /// Writes every buffer as a staged file tagged with `checkpoint_id`.
    async fn stage_all(&mut self, checkpoint_id: u64) -> Result<()> {
        let mut buffers = std::mem::take(&mut self.buffers).into_iter();
        self.buffered_rows = 0;

        while let Some((key, rows)) = buffers.next() {
            if rows.is_empty() {
                continue;
            }
            match self.stage_partition(key, &rows, checkpoint_id).await {
                Ok(path) => self.staged.push(StagedFile {
                    checkpoint_id,
                    partition: key,
                    path,
                }),
                Err(e) => {
                    // Unstaged rows stay buffered for the next flush.
                    self.buffers.insert(key, rows);
                    self.buffers.extend(buffers);
                    self.buffered_rows = self.buffers.values().map(Vec::len).sum();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn stage_partition(
        &self,
        key: PartitionKey,
        rows: &[ProcessedRecord],
        checkpoint_id: u64,
    ) -> Result<PathBuf> {
        let dir = key.dir(&self.root);
        tokio::fs::create_dir_all(&dir).await?;

        let bytes = write_rows(rows)?;
        let path = dir.join(format!(
            "{}{:020}-{}.parquet",
            STAGED_PREFIX,
            checkpoint_id,
            Uuid::new_v4()
        ));

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;

        debug!(partition = %key, checkpoint_id, rows = rows.len(), "Staged archive file");
        Ok(path)
    }

    /// Publishes staged files of checkpoints up to `checkpoint_id`, then
    /// writes due success markers.
    async fn commit_staged(&mut self, checkpoint_id: u64) -> Result<()> {
        let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.staged)
            .into_iter()
            .partition(|f| f.checkpoint_id <= checkpoint_id);
        self.staged = pending;

        let mut ready = ready.into_iter();
        while let Some(file) = ready.next() {
            let dir = file.partition.dir(&self.root);
            if let Err(e) = publish(&file.path, &dir).await {
                // Unpublished files are retried by the next commit.
                self.staged.push(file);
                self.staged.extend(ready);
                return Err(e);
            }
            metrics().archive_files_committed.inc();

            let progress = self
                .partitions
                .entry(file.partition)
                .or_insert_with(PartitionProgress::new);
            progress.committed_files += 1;
            progress.pending_marker = true;
        }

        self.write_due_markers(checkpoint_id).await
    }

    async fn write_due_markers(&mut self, checkpoint_id: u64) -> Result<()> {
        let mut done = Vec::new();

        for (key, progress) in self.partitions.iter_mut() {
            if !progress.pending_marker || progress.first_write.elapsed() < self.commit_delay {
                continue;
            }
            let unpublished = self
                .staged
                .iter()
                .any(|f| f.partition == *key && f.checkpoint_id <= checkpoint_id);
            if unpublished {
                continue;
            }

            let dir = key.dir(&self.root);
            let marker = tokio::fs::File::create(dir.join(SUCCESS_MARKER)).await?;
            marker.sync_all().await?;
            progress.pending_marker = false;
            metrics().archive_partitions_committed.inc();

            info!(
                partition = %key,
                files = progress.committed_files,
                "Archive partition committed"
            );
            done.push(*key);
        }

        for key in done {
            let busy = self.buffers.contains_key(&key)
                || self.staged.iter().any(|f| f.partition == key);
            if !busy {
                self.partitions.remove(&key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Sink<EnrichedEvent> for ArchiveWriter {
    fn name(&self) -> &'static str {
        "archive"
    }

    async fn write_batch(&mut self, records: &[EnrichedEvent]) -> Result<()> {
        for event in records {
            let key = PartitionKey::for_event_time(event.event_time());
            self.partitions
                .entry(key)
                .or_insert_with(PartitionProgress::new);
            self.buffers.entry(key).or_default().push(event.to_record());
            self.buffered_rows += 1;
        }

        if self.buffered_rows >= self.max_buffered_rows {
            warn!(
                rows = self.buffered_rows,
                checkpoint_id = self.next_checkpoint_id,
                "Archive buffer full, staging early"
            );
            // The rows are buffered either way; failing here would make the
            // sink worker retry the batch and buffer it twice.
            if let Err(e) = self.stage_all(self.next_checkpoint_id).await {
                warn!(error = %e, "Early staging failed, keeping rows for the next flush");
            }
        }
        Ok(())
    }

    async fn recover(&mut self, restored_checkpoint: Option<u64>) -> Result<()> {
        self.recover_staged(restored_checkpoint).await.map(|_| ())
    }

    async fn flush(&mut self, checkpoint_id: u64) -> Result<()> {
        self.stage_all(checkpoint_id).await?;
        self.next_checkpoint_id = checkpoint_id + 1;
        Ok(())
    }

    async fn commit(&mut self, checkpoint_id: u64) -> Result<()> {
        self.commit_staged(checkpoint_id).await
    }
}

fn staged_checkpoint_id(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(STAGED_PREFIX)?;
    let (id, _) = rest.split_once('-')?;
    id.parse().ok()
}

/// Renames a staged file to its visible name and syncs the directory.
async fn publish(staged: &Path, dir: &Path) -> Result<()> {
    let target = dir.join(format!("part-{}.parquet", Uuid::new_v4()));
    tokio::fs::rename(staged, &target).await?;
    if let Ok(handle) = tokio::fs::File::open(dir).await {
        let _ = handle.sync_all().await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnar::read_rows;
    use chrono::{TimeZone, Utc};
    use pipeline_core::{HumidityCategory, SensorEvent, TempTrend};

    fn event(sensor: &str, hour: u32) -> EnrichedEvent {
        EnrichedEvent {
            event: SensorEvent {
                sensor_id: sensor.to_string(),
                event_time: Utc.with_ymd_and_hms(2024, 3, 1, hour, 30, 0).unwrap(),
                temperature: 21.0,
                humidity: 45.0,
                pressure: 1013.0,
                is_anomaly: false,
                building: "Building_001".into(),
                floor: None,
                room: None,
                model: None,
                firmware_version: None,
                battery_level: Some(90),
            },
            temp_trend: TempTrend::Normal,
            humidity_category: HumidityCategory::Moderate,
            comfort_index: 98.0,
            anomaly_score: 0.1,
            processing_time: Utc::now(),
        }
    }

    fn writer(root: &Path, commit_delay_secs: u64) -> ArchiveWriter {
        ArchiveWriter::new(&ArchiveConfig {
            root: root.to_path_buf(),
            commit_delay_secs,
            max_buffered_rows: 1000,
        })
    }

    fn files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_flush_stages_then_commit_publishes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = writer(tmp.path(), 0);

        archive
            .write_batch(&[event("s1", 10), event("s2", 10), event("s3", 11)])
            .await
            .unwrap();
        archive.flush(1).await.unwrap();

        let hour10 = tmp.path().join("date=2024-03-01/hour=10");
        let staged = files(&hour10);
        assert_eq!(staged.len(), 1);
        assert!(staged[0].starts_with(".staged-"));

        archive.commit(1).await.unwrap();

        let names = files(&hour10);
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], SUCCESS_MARKER);
        assert!(names[1].starts_with("part-"));

        let bytes = bytes::Bytes::from(std::fs::read(hour10.join(&names[1])).unwrap());
        let rows = read_rows(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        assert!(files(&tmp.path().join("date=2024-03-01/hour=11")).contains(&SUCCESS_MARKER.to_string()));
    }

    #[tokio::test]
    async fn test_marker_waits_for_commit_delay() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = writer(tmp.path(), 3600);

        archive.write_batch(&[event("s1", 10)]).await.unwrap();
        archive.flush(1).await.unwrap();
        archive.commit(1).await.unwrap();

        let names = files(&tmp.path().join("date=2024-03-01/hour=10"));
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("part-"));
    }

    #[tokio::test]
    async fn test_commit_only_covers_persisted_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = writer(tmp.path(), 0);

        archive.write_batch(&[event("s1", 10)]).await.unwrap();
        archive.flush(1).await.unwrap();
        archive.write_batch(&[event("s2", 10)]).await.unwrap();
        archive.flush(2).await.unwrap();
        archive.commit(1).await.unwrap();

        let names = files(&tmp.path().join("date=2024-03-01/hour=10"));
        assert_eq!(names.iter().filter(|n| n.starts_with("part-")).count(), 1);
        assert_eq!(names.iter().filter(|n| n.starts_with(".staged-")).count(), 1);
    }

    #[tokio::test]
    async fn test_recover_commits_old_and_discards_new() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut archive = writer(tmp.path(), 0);
            archive.write_batch(&[event("s1", 10)]).await.unwrap();
            archive.flush(4).await.unwrap();
            archive.write_batch(&[event("s2", 10)]).await.unwrap();
            archive.flush(5).await.unwrap();
        }

        let mut archive = writer(tmp.path(), 0);
        let report = archive.recover_staged(Some(4)).await.unwrap();
        assert_eq!(report, RecoveryReport { committed: 1, discarded: 1 });

        let dir = tmp.path().join("date=2024-03-01/hour=10");
        let names = files(&dir);
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("part-"));

        archive.flush(5).await.unwrap();
        archive.commit(5).await.unwrap();
        assert!(files(&dir).contains(&SUCCESS_MARKER.to_string()));
    }

    #[tokio::test]
    async fn test_recover_without_checkpoint_discards_everything() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut archive = writer(tmp.path(), 0);
            archive.write_batch(&[event("s1", 10)]).await.unwrap();
            archive.flush(1).await.unwrap();
        }

        let mut archive = writer(tmp.path(), 0);
        let report = archive.recover_staged(None).await.unwrap();
        assert_eq!(report.discarded, 1);
        assert!(files(&tmp.path().join("date=2024-03-01/hour=10")).is_empty());
    }

    #[tokio::test]
    async fn test_recover_missing_root() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = writer(&tmp.path().join("absent"), 0);
        assert_eq!(archive.recover_staged(Some(3)).await.unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_failed_early_staging_keeps_rows_once() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("archive");
        // A file where the root directory should be makes staging fail.
        std::fs::write(&root, b"").unwrap();
        let mut archive = ArchiveWriter::new(&ArchiveConfig {
            root: root.clone(),
            commit_delay_secs: 0,
            max_buffered_rows: 1,
        });

        archive.write_batch(&[event("s1", 10)]).await.unwrap();
        assert_eq!(archive.buffered_rows(), 1);

        std::fs::remove_file(&root).unwrap();
        archive.flush(1).await.unwrap();
        archive.commit(1).await.unwrap();

        let dir = root.join("date=2024-03-01/hour=10");
        let parts: Vec<String> = files(&dir).into_iter().filter(|n| n.starts_with("part-")).collect();
        assert_eq!(parts.len(), 1);
        let bytes = bytes::Bytes::from(std::fs::read(dir.join(&parts[0])).unwrap());
        assert_eq!(read_rows(&bytes).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_publish_is_retried_before_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut archive = writer(tmp.path(), 0);
        let dir = tmp.path().join("date=2024-03-01/hour=10");

        archive.write_batch(&[event("s1", 10)]).await.unwrap();
        archive.flush(1).await.unwrap();
        archive.write_batch(&[event("s2", 10)]).await.unwrap();
        archive.flush(2).await.unwrap();

        let second = files(&dir)
            .into_iter()
            .find(|n| n.starts_with(&format!("{}{:020}-", STAGED_PREFIX, 2)))
            .unwrap();
        let hidden = tmp.path().join("hidden.parquet");
        std::fs::rename(dir.join(&second), &hidden).unwrap();

        assert!(archive.commit(2).await.is_err());
        assert!(archive.commit(3).await.is_err());
        let names = files(&dir);
        assert_eq!(names.iter().filter(|n| n.starts_with("part-")).count(), 1);
        assert!(!names.contains(&SUCCESS_MARKER.to_string()));

        std::fs::rename(&hidden, dir.join(&second)).unwrap();
        archive.commit(3).await.unwrap();
        let names = files(&dir);
        assert_eq!(names.iter().filter(|n| n.starts_with("part-")).count(), 2);
        assert!(names.contains(&SUCCESS_MARKER.to_string()));
    }

    #[test]
    fn test_staged_name_parsing() {
        assert_eq!(
            staged_checkpoint_id(".staged-00000000000000000042-abc.parquet"),
            Some(42)
        );
        assert_eq!(staged_checkpoint_id("part-abc.parquet"), None);
    }
}
