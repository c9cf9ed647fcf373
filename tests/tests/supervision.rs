//! Partition restarts and pipeline-halting failures.

use integration_tests::fixtures::reading;
use integration_tests::setup::{wait_until, TestPipeline, WAIT_TIMEOUT};
use pipeline_core::error::ErrorCode;
use redpanda::RetryPolicy;
use std::time::Duration;
use telemetry::metrics;

#[tokio::test]
async fn test_partition_restarts_after_source_loss() {
    let harness = TestPipeline::new(1);
    let partition = &harness.partitions[0];
    partition.append(&[reading("s1", "B1", 10, 21.0), reading("s2", "B1", 11, 21.0)]);
    // More consecutive failures than one retry budget covers.
    partition.fail_next_fetches(4);
    let restarts_before = metrics().partition_restarts.get();

    let handle = harness.start().await;
    wait_until("events after restart", || harness.enriched.len() == 2).await;
    assert!(metrics().partition_restarts.get() > restarts_before);

    partition.append(&[reading("s3", "B1", 12, 21.0)]);
    wait_until("later events", || harness.enriched.len() == 3).await;

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_restarts_halt_pipeline() {
    let harness = TestPipeline::new(1).with_config(|c| c.max_partition_restarts = 1);
    harness.partitions[0].set_unreachable(true);

    let handle = harness.start().await;
    let err = tokio::time::timeout(WAIT_TIMEOUT, handle.wait())
        .await
        .expect("pipeline did not halt");
    assert_eq!(err.error_code(), Some(ErrorCode::SourceUnavailable));
    assert!(err.is_fatal());

    let _ = handle.shutdown().await;
}

#[tokio::test]
async fn test_stalled_sink_halts_pipeline() {
    let harness = TestPipeline::new(1).with_config(|c| {
        c.sink_buffer_capacity = 4;
        c.sink_send_timeout_ms = 100;
    });
    harness.enriched.stall();
    let events: Vec<_> = (0..50).map(|i| reading("s1", "B1", i, 21.0)).collect();
    harness.partitions[0].append(&events);

    let handle = harness.start().await;
    let err = tokio::time::timeout(WAIT_TIMEOUT, handle.wait())
        .await
        .expect("pipeline did not halt");
    assert_eq!(err.error_code(), Some(ErrorCode::SinkUnavailable));
    assert!(metrics().enriched_sink.send_timeouts.get() >= 1);
}

#[tokio::test]
async fn test_shutdown_during_broker_loss_is_prompt() {
    let mut harness = TestPipeline::new(1).with_config(|c| c.max_partition_restarts = 5);
    harness.retry = RetryPolicy {
        max_retries: 1,
        initial_backoff: Duration::from_secs(30),
        max_backoff: Duration::from_secs(30),
    };
    harness.partitions[0].set_unreachable(true);

    let handle = harness.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let _ = tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
        .await
        .expect("shutdown waited out the retry backoff");
}
