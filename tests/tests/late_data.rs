//! Events whose window already closed.

use chrono::Duration;
use integration_tests::fixtures::{reading, t0};
use integration_tests::setup::{settle, wait_until, TestPipeline};
use telemetry::metrics;

#[tokio::test]
async fn test_late_event_goes_to_side_channel() {
    let harness = TestPipeline::new(1);
    let partition = &harness.partitions[0];
    partition.append(&[reading("s1", "B1", 10, 21.0), reading("s1", "B1", 70, 21.0)]);

    let handle = harness.start().await;
    wait_until("first window", || harness.metrics.len() == 1).await;

    partition.append(&[reading("s2", "B1", 20, 30.0)]);
    wait_until("late event", || harness.late_sink().len() == 1).await;

    let late = &harness.late_sink().records()[0];
    assert_eq!(late.enriched.sensor_id(), "s2");
    assert_eq!(late.window_start, t0());
    assert_eq!(late.window_end, t0() + Duration::seconds(60));
    assert_eq!(late.watermark, t0() + Duration::seconds(65));

    // Late events are still enriched and archived.
    wait_until("enriched late event", || harness.enriched.len() == 3).await;
    wait_until("archived late event", || harness.archive.len() == 3).await;

    // The closed window is not reopened.
    partition.append(&[reading("s1", "B1", 140, 21.0)]);
    wait_until("second window", || harness.metrics.len() == 2).await;
    let summaries = harness.metrics.records();
    assert_eq!(summaries[0].window_start, t0());
    assert_eq!(summaries[0].sensor_count, 1);
    assert_eq!(summaries[0].avg_temperature, 21.0);
    assert_eq!(summaries[1].window_start, t0() + Duration::seconds(60));

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_window_end_equal_to_watermark_is_closed() {
    let harness = TestPipeline::new(1);
    let partition = &harness.partitions[0];
    // Watermark lands exactly on the end of [t0, t0 + 60s).
    partition.append(&[reading("s1", "B1", 10, 21.0), reading("s1", "B1", 65, 21.0)]);

    let handle = harness.start().await;
    wait_until("boundary window", || harness.metrics.len() == 1).await;

    partition.append(&[reading("s2", "B1", 59, 21.0), reading("s3", "B1", 60, 21.0)]);
    wait_until("late event", || harness.late_sink().len() == 1).await;
    wait_until("enriched events", || harness.enriched.len() == 4).await;
    settle().await;

    assert_eq!(harness.late_sink().records()[0].enriched.sensor_id(), "s2");
    assert_eq!(harness.late_sink().len(), 1);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_late_events_counted_without_side_channel() {
    let harness = TestPipeline::new(1).without_late_sink();
    let partition = &harness.partitions[0];
    let late_before = metrics().late_events.get();

    partition.append(&[reading("s1", "B1", 10, 21.0), reading("s1", "B1", 70, 21.0)]);
    let handle = harness.start().await;
    wait_until("first window", || harness.metrics.len() == 1).await;

    partition.append(&[reading("s2", "B1", 20, 30.0)]);
    wait_until("late counter", || metrics().late_events.get() > late_before).await;
    wait_until("enriched late event", || harness.enriched.len() == 3).await;
    assert_eq!(harness.metrics.len(), 1);

    handle.shutdown().await.unwrap();
}
