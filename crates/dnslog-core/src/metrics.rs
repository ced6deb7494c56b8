//! Prometheus metrics helpers for the dnslog agent.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dnslog_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() -> dnslog_core::Result<()> {
//!     let handle = init_metrics()?;
//!     start_metrics_server(9090, handle).await?;
//!
//!     metrics::counter!(dnslog_core::metrics::LINES_PROCESSED).increment(1);
//!     Ok(())
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: `dnslog_`
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: avoided, every agent already owns a single log file

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

use crate::{Error, Result};

// =========================================================================
// Metric names
// =========================================================================

pub const LINES_PROCESSED: &str = "dnslog_lines_processed_total";
pub const LINES_SKIPPED: &str = "dnslog_lines_skipped_total";
pub const RECORDS_BUFFERED: &str = "dnslog_records_buffered_total";
pub const RECORDS_SENT: &str = "dnslog_records_sent_total";
pub const RECORDS_DROPPED: &str = "dnslog_records_dropped_total";
pub const BATCHES_SENT: &str = "dnslog_batches_sent_total";
pub const FLUSH_ERRORS: &str = "dnslog_flush_errors_total";
pub const READ_ERRORS: &str = "dnslog_read_errors_total";
pub const ROTATIONS: &str = "dnslog_rotations_total";
pub const CHECKPOINT_WRITES: &str = "dnslog_checkpoint_writes_total";
pub const BUFFER_SIZE: &str = "dnslog_buffer_size";
pub const READ_OFFSET: &str = "dnslog_read_offset";
pub const COLLECTOR_RUNNING: &str = "dnslog_collector_running";
pub const FLUSH_DURATION: &str = "dnslog_flush_duration_seconds";

/// Install the Prometheus recorder and register metric descriptions.
///
/// Must be called once at startup before metrics are recorded. Fails if a
/// recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Metrics(e.to_string()))?;

    register_metrics();

    Ok(handle)
}

/// Try to install the recorder, returning `None` if one already exists.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

/// Start the `/metrics` HTTP server on `port`.
///
/// The listener is bound before returning so address conflicts surface as an
/// error; serving then continues on a background task.
pub async fn start_metrics_server(port: u16, handle: PrometheusHandle) -> Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "metrics server stopped");
        }
    });

    Ok(())
}

/// Register descriptions for the agent's metrics.
fn register_metrics() {
    // =========================================================================
    // Tailer
    // =========================================================================

    describe_counter!(LINES_PROCESSED, "Log lines read from the tailed file");
    describe_counter!(
        LINES_SKIPPED,
        "Lines that matched neither query-log grammar"
    );
    describe_counter!(RECORDS_BUFFERED, "Parsed records appended to the buffer");
    describe_counter!(READ_ERRORS, "Failed read passes over the log file");
    describe_counter!(ROTATIONS, "Detected log rotations or truncations");
    describe_gauge!(READ_OFFSET, "Current read offset in the log file (bytes)");
    describe_gauge!(
        COLLECTOR_RUNNING,
        "Whether the collector is running (1=yes, 0=no)"
    );

    // =========================================================================
    // Buffer / flush
    // =========================================================================

    describe_gauge!(BUFFER_SIZE, "Records waiting in the batch buffer");
    describe_counter!(RECORDS_SENT, "Records inserted into ClickHouse");
    describe_counter!(
        RECORDS_DROPPED,
        "Records discarded because their batch insert failed"
    );
    describe_counter!(BATCHES_SENT, "Batches inserted into ClickHouse");
    describe_counter!(FLUSH_ERRORS, "Failed batch inserts");
    describe_histogram!(FLUSH_DURATION, "Time spent on ClickHouse batch inserts");

    // =========================================================================
    // Checkpoint
    // =========================================================================

    describe_counter!(CHECKPOINT_WRITES, "Checkpoint files written to disk");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_metrics_init() {
        INIT.call_once(|| {
            let _ = try_init_metrics();
        });
    }

    #[test]
    fn test_try_init_metrics_idempotent() {
        let handle1 = try_init_metrics();
        let handle2 = try_init_metrics();

        // At most one should succeed
        assert!(handle1.is_none() || handle2.is_none());
    }

    #[test]
    fn test_init_metrics_fails_when_installed() {
        ensure_metrics_init();
        assert!(matches!(init_metrics(), Err(Error::Metrics(_))));
    }

    #[test]
    fn test_register_metrics_does_not_panic() {
        ensure_metrics_init();
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_recording_does_not_panic() {
        ensure_metrics_init();
        metrics::counter!(LINES_PROCESSED).increment(1);
        metrics::gauge!(BUFFER_SIZE).set(0.0);
        metrics::histogram!(FLUSH_DURATION).record(0.01);
    }
}
