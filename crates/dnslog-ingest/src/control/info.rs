//! Local log tail and effective configuration.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use super::ControlState;
use super::error::ApiError;
use crate::config::Config;
use crate::logging::{self, MAX_TAIL_LINES};

const DEFAULT_TAIL_LINES: usize = 100;

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsResponse {
    lines: Vec<String>,
}

/// Tail of the newest local log file (`?lines=N`, default 100, max 1000).
pub async fn logs(
    State(state): State<ControlState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<LogsResponse>, ApiError> {
    let requested = query.lines.unwrap_or(DEFAULT_TAIL_LINES);
    if requested == 0 {
        return Err(ApiError::BadRequest("lines must be at least 1".to_string()));
    }

    let config = state.config.logging.clone();
    let lines = tokio::task::spawn_blocking(move || {
        logging::tail_local_log(&config, requested.min(MAX_TAIL_LINES))
    })
    .await
    .map_err(|e| crate::Error::Io(std::io::Error::other(e)))??;

    Ok(Json(LogsResponse { lines }))
}

/// Effective configuration; the ClickHouse password is redacted.
pub async fn config(State(state): State<ControlState>) -> Json<Config> {
    Json(state.config.as_ref().clone())
}
