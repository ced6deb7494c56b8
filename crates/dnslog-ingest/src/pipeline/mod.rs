//! Sink side of the agent.
//!
//! - [`SinkWriter`] - Owns the ClickHouse client, bootstraps the schema, inserts batches
//! - [`migrations`] - Versioned, forward-only schema migrations
//! - [`schema`] - DDL for the base table, views and skip indexes
//!
//! # Architecture
//!
//! ```text
//! [Collector] → [BatchBuffer] → RecordSink::insert_batch → [SinkWriter] → ClickHouse
//!                                                               ↑
//!                                                      [MigrationRunner] (startup)
//! ```
//!
//! The collector only sees the [`RecordSink`] trait, so it can run against an
//! in-memory sink in tests.

use async_trait::async_trait;
use dnslog_core::QueryLogRecord;

use crate::Result;

mod clickhouse;
pub mod migrations;
pub mod schema;

pub use clickhouse::{
    ClickHouseConfig, MAX_RETENTION_DAYS, MIN_RETENTION_DAYS, QueryLogRow, SinkWriter,
};
pub use migrations::{
    Migration, MigrationReport, MigrationRunner, MigrationStep, Procedure, SchemaStore,
};

/// Destination for parsed record batches.
///
/// Implementations must be safe to call from multiple tasks. The collector
/// serializes its own flushes, so at most one batch is in flight per agent.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Insert `records` as one batch.
    ///
    /// An empty slice is a successful no-op. Errors are returned as-is; the
    /// caller decides what happens to the batch.
    async fn insert_batch(&self, records: &[QueryLogRecord]) -> Result<()>;

    /// Check that the sink is reachable.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
