//! Health check endpoint.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::Serialize;

use super::ControlState;

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    collector_running: bool,
    sink: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sink_error: Option<String>,
}

/// Liveness plus sink reachability.
///
/// Answers 503 when the sink cannot be reached.
pub async fn health_check(State(state): State<ControlState>) -> (StatusCode, Json<HealthResponse>) {
    let collector_running = state.controller.is_running().await;
    let sink = state.controller.sink_health().await;

    let (code, status, sink_status, sink_error) = match sink {
        Ok(()) => (StatusCode::OK, "ok", "ok", None),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "degraded",
            "unreachable",
            Some(e.to_string()),
        ),
    };

    (
        code,
        Json(HealthResponse {
            status,
            version: env!("CARGO_PKG_VERSION"),
            collector_running,
            sink: sink_status,
            sink_error,
        }),
    )
}
