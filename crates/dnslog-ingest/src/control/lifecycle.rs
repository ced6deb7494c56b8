//! Collector lifecycle, status and stats endpoints.

use std::path::PathBuf;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::ControlState;
use super::error::ApiError;
use crate::collector::CollectorStats;

#[derive(Debug, Clone, Serialize)]
pub struct ActionResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    running: bool,
    file_path: PathBuf,
    read_offset: u64,
    committed_offset: u64,
    buffer_size: usize,
}

pub async fn status(State(state): State<ControlState>) -> Json<StatusResponse> {
    let running = state.controller.is_running().await;
    let stats = state.controller.stats();

    Json(StatusResponse {
        running,
        file_path: stats.file_path,
        read_offset: stats.read_offset,
        committed_offset: stats.committed_offset,
        buffer_size: stats.buffer_size,
    })
}

pub async fn stats(State(state): State<ControlState>) -> Json<CollectorStats> {
    Json(state.controller.stats())
}

pub async fn start(State(state): State<ControlState>) -> Result<Json<ActionResponse>, ApiError> {
    state
        .controller
        .start()
        .await
        .map_err(ApiError::from_lifecycle)?;
    Ok(Json(ActionResponse { status: "started" }))
}

pub async fn stop(State(state): State<ControlState>) -> Result<Json<ActionResponse>, ApiError> {
    state
        .controller
        .stop()
        .await
        .map_err(ApiError::from_lifecycle)?;
    Ok(Json(ActionResponse { status: "stopped" }))
}

pub async fn restart(State(state): State<ControlState>) -> Result<Json<ActionResponse>, ApiError> {
    state
        .controller
        .restart()
        .await
        .map_err(ApiError::from_lifecycle)?;
    Ok(Json(ActionResponse { status: "restarted" }))
}
