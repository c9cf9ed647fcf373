//! Health and metrics endpoints over a running pipeline.
//!
//! Health is process-wide, so the whole lifecycle is one test.

use axum::http::StatusCode;
use axum_test::TestServer;
use integration_tests::fixtures::reading;
use integration_tests::setup::{wait_until, TestPipeline};

#[tokio::test]
async fn test_health_follows_pipeline_lifecycle() {
    let server = TestServer::new(api::router(api::AppState::new(120.0)))
        .expect("Failed to create test server");

    server.get("/health/live").await.assert_status_ok();

    let harness = TestPipeline::new(1);
    harness.partitions[0].append(&[
        reading("s1", "B1", 10, 21.0),
        reading("s2", "B2", 20, 21.0),
        reading("s1", "B1", 70, 21.0),
    ]);
    let handle = harness.start().await;
    wait_until("window summary", || harness.metrics.len() == 2).await;

    server.get("/health/ready").await.assert_status_ok();

    let response = server.get("/health").await;
    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["consuming"], true);
    assert_eq!(body["last_watermark"], "2024-03-01T10:01:05+00:00");
    // Only B1's [60s, 120s) window is still open.
    assert_eq!(body["open_window_count"], 1);
    assert!(body["components"].as_array().is_some_and(|c| !c.is_empty()));

    let response = server.get("/metrics").await;
    response.assert_status_ok();
    let metrics: serde_json::Value = response.json();
    assert_eq!(metrics["events_enriched"], 3);
    assert_eq!(metrics["windows_emitted"], 2);
    assert_eq!(metrics["late_events"], 0);

    handle.shutdown().await.unwrap();

    server
        .get("/health/ready")
        .await
        .assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let response = server.get("/health").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "unhealthy");
    assert_eq!(body["consuming"], false);
}
