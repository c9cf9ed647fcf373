//! Standardized API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use telemetry::{HealthReport, HealthStatus};

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub consuming: bool,
    /// RFC 3339, absent until the first watermark
    pub last_watermark: Option<String>,
    pub open_window_count: i64,
    pub checkpoint_lag_seconds: f64,
    pub late_events: u64,
    pub components: Vec<ComponentStatus>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub name: String,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<HealthReport> for HealthResponse {
    fn from(report: HealthReport) -> Self {
        Self {
            status: report.status,
            consuming: report.consuming,
            last_watermark: report.last_watermark.map(|wm| wm.to_rfc3339()),
            open_window_count: report.open_window_count,
            checkpoint_lag_seconds: report.checkpoint_lag_seconds,
            late_events: report.late_events,
            components: report
                .components
                .into_iter()
                .map(|c| ComponentStatus {
                    name: c.name,
                    healthy: c.healthy,
                    message: c.message,
                })
                .collect(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl IntoResponse for HealthResponse {
    fn into_response(self) -> Response {
        let status = if self.status.is_serving() {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        (status, Json(self)).into_response()
    }
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

/// Fallback for unknown paths.
pub async fn not_found() -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new("No such endpoint", "NOT_FOUND")),
    )
}
