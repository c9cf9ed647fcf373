//! Checkpoint contents, restore after a crash, and the archive's
//! exactly-once commit across restarts.

use std::collections::BTreeSet;
use std::path::Path;

use archive::{columnar::read_rows, ArchiveConfig, ArchiveWriter, SUCCESS_MARKER};
use integration_tests::fixtures::{at_ms, reading};
use integration_tests::setup::{wait_until, TestPipeline};
use pipeline_core::error::ErrorCode;
use pipeline_core::{ProcessedRecord, Watermark};

#[tokio::test]
async fn test_checkpoint_captures_offsets_windows_and_watermark() {
    let harness = TestPipeline::new(1);
    harness.partitions[0].append(&[
        reading("s1", "B1", 10, 20.0),
        reading("s2", "B1", 20, 22.0),
        reading("s3", "B1", 30, 24.0),
    ]);

    let handle = harness.start().await;
    wait_until("enriched events", || harness.enriched.len() == 3).await;

    let checkpoint_id = handle.checkpoint_now().await.unwrap();
    assert_eq!(checkpoint_id, 1);

    let record = harness.store.latest().unwrap();
    assert_eq!(record.checkpoint_id, 1);
    assert_eq!(record.offsets.get(&0), Some(&3));
    assert_eq!(record.partition_event_time.get(&0), Some(&at_ms(30)));
    assert_eq!(record.watermark, Watermark(at_ms(25)));
    assert_eq!(record.windows.len(), 1);
    assert_eq!(record.windows[0].building, "B1");
    assert_eq!(record.windows[0].count, 3);

    assert_eq!(harness.enriched.flushes(), vec![1]);
    assert_eq!(harness.archive.flushes(), vec![1]);
    assert_eq!(harness.metrics.flushes(), vec![1]);
    assert_eq!(harness.late_sink().flushes(), vec![1]);
    wait_until("commits", || {
        harness.enriched.commits() == vec![1] && harness.archive.commits() == vec![1]
    })
    .await;

    assert_eq!(handle.checkpoint_now().await.unwrap(), 2);
    assert_eq!(harness.store.ids(), vec![1, 2]);

    handle.shutdown().await.unwrap();
    assert_eq!(harness.store.latest().unwrap().checkpoint_id, 3);
}

#[tokio::test]
async fn test_failed_checkpoint_keeps_processing() {
    let harness = TestPipeline::new(1);
    harness.partitions[0].append(&[reading("s1", "B1", 10, 20.0)]);

    let handle = harness.start().await;
    wait_until("enriched event", || harness.enriched.len() == 1).await;

    harness.store.set_failing(true);
    let err = handle.checkpoint_now().await.unwrap_err();
    assert_eq!(err.error_code(), Some(ErrorCode::CheckpointFailure));
    assert!(harness.enriched.commits().is_empty());

    harness.partitions[0].append(&[reading("s2", "B1", 70, 20.0)]);
    wait_until("window after failed checkpoint", || harness.metrics.len() == 1).await;

    harness.store.set_failing(false);
    assert_eq!(handle.checkpoint_now().await.unwrap(), 2);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_from_last_checkpoint() {
    let harness = TestPipeline::new(1);
    let partition = &harness.partitions[0];
    partition.append(&[reading("s1", "B1", 10, 20.0), reading("s2", "B1", 20, 22.0)]);

    let first = harness.start().await;
    wait_until("first events", || harness.enriched.len() == 2).await;
    assert_eq!(first.checkpoint_now().await.unwrap(), 1);

    partition.append(&[reading("s3", "B1", 30, 24.0)]);
    wait_until("event after checkpoint", || harness.enriched.len() == 3).await;

    // Nothing after checkpoint 1 becomes durable, as if the process died.
    harness.store.set_failing(true);
    assert!(first.shutdown().await.is_err());
    harness.store.set_failing(false);
    assert!(harness.metrics.is_empty());

    let second = harness.start().await;
    assert_eq!(harness.enriched.recovered_from(), vec![None, Some(1)]);
    assert!(second.current_watermark() >= Watermark(at_ms(15)));

    // s3 is replayed from the checkpointed offset.
    wait_until("replayed event", || harness.enriched.len() == 4).await;
    assert_eq!(harness.enriched.records()[3].sensor_id(), "s3");

    partition.append(&[reading("s4", "B1", 70, 20.0)]);
    wait_until("restored window", || harness.metrics.len() == 1).await;

    let summary = &harness.metrics.records()[0];
    assert_eq!(summary.sensor_count, 3);
    assert_eq!(summary.avg_temperature, 22.0);

    second.shutdown().await.unwrap();
}

fn archived_rows(root: &Path) -> Vec<ProcessedRecord> {
    let mut rows = Vec::new();
    let Ok(dates) = std::fs::read_dir(root) else {
        return rows;
    };
    for date in dates {
        for hour in std::fs::read_dir(date.unwrap().path()).unwrap() {
            for file in std::fs::read_dir(hour.unwrap().path()).unwrap() {
                let path = file.unwrap().path();
                let name = path.file_name().unwrap().to_string_lossy().into_owned();
                if name.starts_with("part-") {
                    let bytes = bytes::Bytes::from(std::fs::read(&path).unwrap());
                    rows.extend(read_rows(&bytes).unwrap());
                }
            }
        }
    }
    rows
}

fn archive_sink(root: &Path) -> Box<ArchiveWriter> {
    Box::new(ArchiveWriter::new(&ArchiveConfig {
        root: root.to_path_buf(),
        commit_delay_secs: 0,
        max_buffered_rows: 10_000,
    }))
}

#[tokio::test]
async fn test_archive_is_exactly_once_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let harness = TestPipeline::new(1);
    let partition = &harness.partitions[0];
    partition.append(&[
        reading("s1", "B1", 10, 20.0),
        reading("s2", "B1", 20, 20.0),
        reading("s3", "B1", 30, 20.0),
    ]);

    let first = harness.builder().archive_sink(archive_sink(dir.path())).start().await.unwrap();
    wait_until("first events", || harness.enriched.len() == 3).await;
    first.checkpoint_now().await.unwrap();
    let marker = dir.path().join("date=2024-03-01/hour=10").join(SUCCESS_MARKER);
    wait_until("archive commit", || marker.exists()).await;
    assert_eq!(archived_rows(dir.path()).len(), 3);

    partition.append(&[reading("s4", "B1", 40, 20.0), reading("s5", "B1", 50, 20.0)]);
    wait_until("more events", || harness.enriched.len() == 5).await;

    // The final checkpoint stages s4 and s5 but is never persisted.
    harness.store.set_failing(true);
    assert!(first.shutdown().await.is_err());
    harness.store.set_failing(false);
    assert_eq!(archived_rows(dir.path()).len(), 3);

    let second = harness.builder().archive_sink(archive_sink(dir.path())).start().await.unwrap();
    wait_until("replayed events", || harness.enriched.len() == 7).await;
    second.shutdown().await.unwrap();

    let rows = archived_rows(dir.path());
    assert_eq!(rows.len(), 5);
    let ids: BTreeSet<String> = rows.into_iter().map(|r| r.sensor_id).collect();
    assert_eq!(ids, ["s1", "s2", "s3", "s4", "s5"].into_iter().map(String::from).collect());
}
