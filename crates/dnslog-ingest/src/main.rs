//! dnslog ingestion agent.
//!
//! Tails a DNS query log and ships parsed records to ClickHouse. All settings
//! come from the environment (see [`dnslog_ingest::Config::from_env`]).
//!
//! # Usage
//!
//! ```bash
//! # Run with settings from the environment / ./.env
//! DNSLOG_NODE_ID=3 CLICKHOUSE_HOST=clickhouse dnslog-ingest
//!
//! # Load a specific env file
//! dnslog-ingest --dotenv /etc/dnslog/agent.env
//!
//! # Print the effective configuration and exit
//! dnslog-ingest --check-config
//! ```
//!
//! # Graceful Shutdown
//!
//! The agent handles SIGINT (Ctrl+C) and SIGTERM for graceful shutdown:
//! 1. Stops reading the log file
//! 2. Flushes buffered records to ClickHouse
//! 3. Persists the checkpoint
//! 4. Closes the sink and the control surface

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dnslog_core::metrics::{init_metrics, start_metrics_server};
use dnslog_ingest::control::{self, ControlState};
use dnslog_ingest::logging::{init_logging, run_log_pruner};
use dnslog_ingest::{AgentController, Collector, Config, Error, RecordSink, SinkWriter};
use tokio_util::sync::CancellationToken;

/// dnslog ingestion agent.
#[derive(Parser, Debug)]
#[command(name = "dnslog-ingest")]
#[command(about = "Tails a DNS query log into ClickHouse")]
#[command(version)]
struct Args {
    /// Env file to load before reading configuration (default: ./.env if present)
    #[arg(long, env = "DNSLOG_DOTENV")]
    dotenv: Option<PathBuf>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match &args.dotenv {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("Failed to load env file {}", path.display()))?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }

    let config = Config::from_env().context("Invalid configuration")?;

    if args.check_config {
        for warning in &config.warnings {
            eprintln!("warning: {warning}");
        }
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let _log_guard = init_logging(&config.logging).context("Failed to initialize logging")?;
    tokio::spawn(run_log_pruner(config.logging.clone()));

    tracing::info!("dnslog ingestion agent starting...");
    config.log_summary();

    // Initialize metrics
    if config.metrics_port > 0 {
        let metrics_handle = init_metrics()?;
        start_metrics_server(config.metrics_port, metrics_handle).await?;
    }

    // Set up graceful shutdown
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    // Sink first: migrations must succeed before anything is read
    let sink = Arc::new(
        SinkWriter::open(config.clickhouse.clone())
            .await
            .context("Failed to open ClickHouse sink")?,
    );
    let record_sink: Arc<dyn RecordSink> = sink.clone();

    let collector = Arc::new(
        Collector::new(config.collector.clone(), Arc::clone(&record_sink))
            .context("Failed to create collector")?,
    );
    let controller = Arc::new(AgentController::new(collector, record_sink));
    controller.start().await?;

    let control_task = control::serve(
        config.control_addr,
        ControlState {
            controller: Arc::clone(&controller),
            config: Arc::new(config.clone()),
        },
        shutdown.clone(),
    )
    .await
    .context("Failed to start control surface")?;

    shutdown.cancelled().await;

    // Shutdown sequence
    tracing::info!("Shutting down...");

    match controller.stop().await {
        Ok(()) | Err(Error::NotRunning) => {}
        Err(e) => tracing::warn!(error = %e, "Collector did not stop cleanly"),
    }
    sink.close();

    if let Err(e) = control_task.await {
        tracing::warn!("Control surface task failed: {:?}", e);
    }

    // Print summary
    let stats = controller.stats();
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Lines processed:      {}", stats.lines_processed);
    tracing::info!("Lines skipped:        {}", stats.lines_skipped);
    tracing::info!("Records sent:         {}", stats.records_sent);
    tracing::info!("Records dropped:      {}", stats.records_dropped);
    tracing::info!("Batches sent:         {}", stats.batches_sent);
    tracing::info!("Errors:               {}", stats.errors);
    tracing::info!("Committed offset:     {}", stats.committed_offset);

    Ok(())
}
