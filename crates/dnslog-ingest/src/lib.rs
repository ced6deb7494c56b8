//! dnslog ingestion agent.
//!
//! Tails one DNS query log, parses each line into a [`QueryLogRecord`],
//! batches records and inserts them into ClickHouse, keeping a durable read
//! position across restarts.
//!
//! # Modules
//!
//! - [`collector`] - Tailer: rotation handling, parsing, flush and checkpoint timers
//! - [`buffer`] - Batch buffer with atomic drain
//! - [`checkpoint`] - JSON checkpoint file and cold-start reconciliation
//! - [`pipeline`] - ClickHouse sink writer, schema and migrations
//! - [`controller`] - Start/stop/restart around the collector task
//! - [`control`] - Local HTTP control surface
//! - [`config`] / [`logging`] - Environment configuration and tracing setup
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   audit.log     │  appended by the DNS server, rotated externally
//! └────────┬────────┘
//!          │ poll + read complete lines
//!          ▼
//! ┌─────────────────┐        ┌──────────────────┐
//! │    Collector    │───────▶│ CheckpointStore  │  committed offset (JSON)
//! └────────┬────────┘        └──────────────────┘
//!          │ parse_line
//!          ▼
//! ┌─────────────────┐
//! │   BatchBuffer   │  drained when full or on the flush timer
//! └────────┬────────┘
//!          │ RecordSink::insert_batch
//!          ▼
//! ┌─────────────────┐
//! │   SinkWriter    │  ClickHouse: base table, views, skip indexes
//! └─────────────────┘
//! ```
//!
//! Delivery is at-least-once: a crash re-reads lines that were buffered but
//! not yet inserted. A batch whose insert fails is dropped.
//!
//! [`QueryLogRecord`]: dnslog_core::QueryLogRecord

pub mod buffer;
pub mod checkpoint;
pub mod collector;
pub mod config;
pub mod control;
pub mod controller;
pub mod error;
pub mod logging;
pub mod pipeline;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

pub use buffer::BatchBuffer;
pub use checkpoint::{Checkpoint, CheckpointStore};
pub use collector::{Collector, CollectorConfig, CollectorStats};
pub use config::Config;
pub use controller::AgentController;
pub use pipeline::{ClickHouseConfig, MigrationRunner, RecordSink, SinkWriter};
