//! ClickHouse sink writer for query-log records.
//!
//! This module provides the [`SinkWriter`], which owns the single long-lived
//! ClickHouse client of the agent.
//!
//! # Lifecycle
//!
//! [`SinkWriter::open`] bootstraps the store before any write is accepted:
//! - Connects without a database and verifies connectivity (`SELECT 1`)
//! - Creates the target database and rebinds the client to it
//! - Runs pending migrations (fatal on failure)
//! - Creates aggregation views and skip indexes (best-effort)
//!
//! Batch inserts are one `INSERT ... FORMAT RowBinary` per batch. Errors are
//! returned to the caller unchanged; retry policy belongs to the collector.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use clickhouse::{Client, Row};
use dnslog_core::QueryLogRecord;
use serde::{Deserialize, Serialize, Serializer};

use super::RecordSink;
use super::migrations::{MigrationRunner, SchemaStore};
use super::schema;
use crate::{Error, Result};

/// Shortest supported TTL on the base table.
pub const MIN_RETENTION_DAYS: u32 = 30;

/// Longest supported TTL on the base table.
pub const MAX_RETENTION_DAYS: u32 = 90;

/// Configuration for the ClickHouse sink.
#[derive(Debug, Clone, Serialize)]
pub struct ClickHouseConfig {
    /// Server host name
    pub host: String,

    /// HTTP interface port
    pub port: u16,

    /// Database name
    pub database: String,

    /// User name
    pub username: String,

    /// Password (never serialized in clear)
    #[serde(serialize_with = "redact")]
    pub password: String,

    /// TTL of the base table and views, in days
    pub retention_days: u32,
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            database: "dns_logs".to_string(),
            username: "default".to_string(),
            password: String::new(),
            retention_days: MIN_RETENTION_DAYS,
        }
    }
}

impl ClickHouseConfig {
    /// HTTP URL of the server.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        let valid = !self.database.is_empty()
            && self
                .database
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(Error::Config(format!(
                "invalid ClickHouse database name: {:?}",
                self.database
            )));
        }
        Ok(())
    }
}

fn redact<S: Serializer>(password: &str, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    if password.is_empty() {
        serializer.serialize_str("")
    } else {
        serializer.serialize_str("***")
    }
}

/// Row structure matching the `dns_query_log` table.
///
/// Field order is the column order of the insert.
#[derive(Debug, Clone, Row, Serialize)]
pub struct QueryLogRow {
    pub timestamp: i64, // DateTime64(3) as Unix milliseconds
    pub date: u16,      // Date as days since epoch
    pub node_id: u32,
    pub client_ip: String,
    pub domain: String,
    pub query_type: u16,
    pub time_ms: u32,
    pub speed_ms: f32,
    pub result_ips: Vec<String>,
    pub result_count: u8,
    pub group_name: String,
    pub raw_log: String,
}

impl From<&QueryLogRecord> for QueryLogRow {
    fn from(record: &QueryLogRecord) -> Self {
        Self {
            timestamp: record.timestamp_millis(),
            date: record.days_since_epoch(),
            node_id: record.node_id,
            client_ip: record.client_ip.clone(),
            domain: record.domain.clone(),
            query_type: record.query_type,
            time_ms: record.time_ms,
            speed_ms: record.speed_ms,
            result_ips: record.result_ips.clone(),
            result_count: record.result_count,
            group_name: record.group.clone().unwrap_or_default(),
            raw_log: record.raw_log.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Row)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Deserialize, Row)]
struct VersionRow {
    version: u32,
}

/// Owns the ClickHouse connection and writes record batches.
pub struct SinkWriter {
    client: Client,
    config: ClickHouseConfig,
    closed: AtomicBool,
}

impl SinkWriter {
    /// Connect, bootstrap the database and bring the schema up to date.
    pub async fn open(config: ClickHouseConfig) -> Result<Self> {
        config.validate()?;

        let base = Client::default()
            .with_url(config.url())
            .with_user(&config.username)
            .with_password(&config.password);

        base.query("SELECT 1").execute().await?;
        base.query(&schema::create_database(&config.database))
            .execute()
            .await?;

        let client = base.with_database(&config.database);

        tracing::info!(
            "ClickHouse sink connected: url={}, database={}",
            config.url(),
            config.database
        );

        let writer = Self {
            client,
            config,
            closed: AtomicBool::new(false),
        };

        MigrationRunner::builtin(writer.config.retention_days)
            .run(&writer)
            .await?;
        let failed = writer.ensure_derived_objects().await;
        if failed > 0 {
            tracing::warn!(failed, "Continuing without some derived views or indexes");
        }

        Ok(writer)
    }

    /// Create views and indexes, logging failures.
    ///
    /// Returns the number of objects that could not be created.
    async fn ensure_derived_objects(&self) -> usize {
        let objects = schema::views(self.config.retention_days)
            .into_iter()
            .chain(schema::indexes());

        let mut failed = 0;
        for object in objects {
            if let Err(e) = self.client.query(&object.ddl).execute().await {
                failed += 1;
                tracing::warn!(name = object.name, error = %e, "Failed to create derived object");
            }
        }

        if failed == 0 {
            tracing::debug!("Derived views and indexes in place");
        }
        failed
    }

    /// Check that the server answers.
    pub async fn health_check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SinkClosed);
        }
        self.client.query("SELECT 1").execute().await?;
        Ok(())
    }

    /// Stop accepting writes.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!("ClickHouse sink closed");
        }
    }

    pub fn config(&self) -> &ClickHouseConfig {
        &self.config
    }
}

#[async_trait]
impl RecordSink for SinkWriter {
    async fn insert_batch(&self, records: &[QueryLogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SinkClosed);
        }

        let mut insert = self.client.insert::<QueryLogRow>(schema::TABLE)?;
        for record in records {
            insert.write(&QueryLogRow::from(record)).await?;
        }
        insert.end().await?;

        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        SinkWriter::health_check(self).await
    }
}

#[async_trait]
impl SchemaStore for SinkWriter {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.client.query(sql).execute().await?;
        Ok(())
    }

    async fn query_count(&self, sql: &str) -> Result<u64> {
        let row = self.client.query(sql).fetch_optional::<CountRow>().await?;
        Ok(row.map_or(0, |r| r.count))
    }

    async fn ensure_history(&self) -> Result<()> {
        self.execute(&schema::create_migrations_table()).await
    }

    async fn applied_versions(&self) -> Result<BTreeSet<u32>> {
        let rows = self
            .client
            .query(&format!("SELECT version FROM {}", schema::MIGRATIONS_TABLE))
            .fetch_all::<VersionRow>()
            .await?;
        Ok(rows.into_iter().map(|r| r.version).collect())
    }

    async fn record_migration(&self, version: u32, description: &str) -> Result<()> {
        self.client
            .query(&format!(
                "INSERT INTO {} (version, description) VALUES (?, ?)",
                schema::MIGRATIONS_TABLE
            ))
            .bind(version)
            .bind(description)
            .execute()
            .await?;
        Ok(())
    }
}
