//! Local HTTP control surface for the agent.

mod error;
mod health;
mod info;
mod lifecycle;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;

pub use error::ApiError;

use crate::Result;
use crate::config::Config;
use crate::controller::AgentController;

/// Shared state available to all control handlers.
#[derive(Clone)]
pub struct ControlState {
    pub controller: Arc<AgentController>,
    pub config: Arc<Config>,
}

/// Build the control router.
///
/// # Routes
///
/// - `GET /health` - Liveness and sink reachability
/// - `GET /status` - Running flag, file path and offsets
/// - `GET /stats` - Collector counters and buffer size
/// - `POST /start` - Start the collector (409 if running)
/// - `POST /stop` - Stop the collector and wait for shutdown (409 if stopped)
/// - `POST /restart` - Stop if running, then start
/// - `GET /logs?lines=N` - Tail of the newest local log file
/// - `GET /config` - Effective configuration, password redacted
pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/status", get(lifecycle::status))
        .route("/stats", get(lifecycle::stats))
        .route("/start", post(lifecycle::start))
        .route("/stop", post(lifecycle::stop))
        .route("/restart", post(lifecycle::restart))
        .route("/logs", get(info::logs))
        .route("/config", get(info::config))
        .with_state(state)
}

/// Serve the control surface on `addr` until `shutdown` fires.
///
/// The listener is bound before returning so address conflicts surface as an
/// error.
pub async fn serve(
    addr: SocketAddr,
    state: ControlState,
    shutdown: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Control surface listening on http://{}", addr);

    let app = router(state);
    Ok(tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "control surface stopped");
        }
    }))
}
