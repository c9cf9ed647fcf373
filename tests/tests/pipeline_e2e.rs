//! End-to-end flow: source partitions through enrichment, windowing and
//! every sink.

use std::collections::BTreeSet;

use chrono::Duration;
use integration_tests::fixtures::{anomalous, at_ms, corrupt_payloads, nested_reading, reading, t0};
use integration_tests::setup::{settle, wait_until, TestPipeline};
use pipeline_core::{TempTrend, Watermark};
use telemetry::metrics;

#[tokio::test]
async fn test_enriches_and_aggregates_one_window() {
    let harness = TestPipeline::new(1);
    harness.partitions[0].append(&[
        reading("s1", "B1", 5, 26.0),
        anomalous("s2", "B1", 20, 22.0),
        reading("s3", "B1", 40, 20.0),
        // Pushes the watermark to t0 + 65s, closing [t0, t0 + 60s).
        reading("s1", "B1", 70, 21.0),
    ]);

    let handle = harness.start().await;
    wait_until("window summary", || harness.metrics.len() == 1).await;
    wait_until("enriched events", || harness.enriched.len() == 4).await;
    wait_until("archived events", || harness.archive.len() == 4).await;

    let summary = &harness.metrics.records()[0];
    assert_eq!(summary.building, "B1");
    assert_eq!(summary.window_start, t0());
    assert_eq!(summary.window_end, t0() + Duration::seconds(60));
    assert_eq!(summary.sensor_count, 3);
    assert_eq!(summary.avg_temperature, 22.67);
    assert_eq!(summary.avg_humidity, 45.0);
    assert_eq!(summary.anomaly_count, 1);
    assert_eq!(summary.anomaly_rate, 0.333);
    assert_eq!(summary.low_battery_count, 0);

    let enriched = harness.enriched.records();
    let ids: Vec<&str> = enriched.iter().map(|e| e.sensor_id()).collect();
    assert_eq!(ids, vec!["s1", "s2", "s3", "s1"]);
    assert_eq!(enriched[0].temp_trend, TempTrend::Hot);
    assert_eq!(enriched[2].temp_trend, TempTrend::Normal);

    assert_eq!(handle.current_watermark(), Watermark(at_ms(65)));
    assert_eq!(handle.offsets().get(&0), Some(&4));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_corrupt_records_are_skipped() {
    let harness = TestPipeline::new(1);
    let partition = &harness.partitions[0];
    let corrupt_before = metrics().corrupt_records.get();

    partition.append(&[reading("s1", "B1", 10, 21.0)]);
    partition.append_raw(corrupt_payloads());
    partition.append_tombstone();
    partition.append(&[reading("s2", "B1", 12, 21.0)]);

    let handle = harness.start().await;
    wait_until("valid events", || harness.enriched.len() == 2).await;
    wait_until("offsets past every record", || handle.offsets().get(&0) == Some(&6)).await;

    let ids: Vec<String> = harness
        .enriched
        .records()
        .iter()
        .map(|e| e.sensor_id().to_string())
        .collect();
    assert_eq!(ids, vec!["s1", "s2"]);
    assert!(metrics().corrupt_records.get() >= corrupt_before + 4);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_nested_payload_is_normalised() {
    let harness = TestPipeline::new(1);
    harness.partitions[0].append(&[
        nested_reading("s7", "B2", 10),
        reading("s1", "B1", 70, 21.0),
    ]);

    let handle = harness.start().await;
    wait_until("window summary", || harness.metrics.len() == 1).await;

    let summary = &harness.metrics.records()[0];
    assert_eq!(summary.building, "B2");
    assert_eq!(summary.sensor_count, 1);
    assert_eq!(summary.avg_pressure, 1010.0);
    assert_eq!(summary.low_battery_count, 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_watermark_waits_for_slowest_partition() {
    let harness = TestPipeline::new(2);
    harness.partitions[0].append(&[reading("s1", "B1", 10, 21.0), reading("s1", "B1", 130, 21.0)]);
    harness.partitions[1].append(&[reading("s2", "B2", 15, 19.0)]);

    let handle = harness.start().await;
    wait_until("enriched events", || harness.enriched.len() == 3).await;
    settle().await;

    // Partition 1 holds the watermark at 15s - 5s.
    assert_eq!(handle.current_watermark(), Watermark(at_ms(10)));
    assert!(harness.metrics.is_empty());

    harness.partitions[1].append(&[reading("s2", "B2", 100, 19.0)]);
    wait_until("first windows", || harness.metrics.len() == 2).await;
    assert_eq!(handle.current_watermark(), Watermark(at_ms(95)));

    let buildings: BTreeSet<String> = harness
        .metrics
        .records()
        .into_iter()
        .map(|s| {
            assert_eq!(s.window_start, t0());
            s.building
        })
        .collect();
    assert_eq!(buildings, BTreeSet::from(["B1".to_string(), "B2".to_string()]));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_sink_errors_are_retried() {
    let harness = TestPipeline::new(1);
    harness.enriched.fail_next_writes(2);
    harness.partitions[0].append(&[reading("s1", "B1", 10, 21.0), reading("s2", "B1", 11, 21.0)]);

    let handle = harness.start().await;
    wait_until("retried write", || harness.enriched.len() == 2).await;

    handle.shutdown().await.unwrap();
    assert_eq!(harness.enriched.len(), 2);
}
