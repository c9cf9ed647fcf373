//! Application state shared across handlers.

/// Handler state.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Checkpoint lag, in seconds, beyond which health reports degraded
    pub lag_alert_secs: f64,
}

impl AppState {
    pub fn new(lag_alert_secs: f64) -> Self {
        Self { lag_alert_secs }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new(120.0)
    }
}
