//! Versioned, forward-only schema migrations.
//!
//! Executed versions are recorded in `schema_migrations`. On every start the
//! runner applies the pending ones in ascending order and records each right
//! after it succeeds, so a failure leaves earlier migrations recorded and the
//! failing one pending for the next start.

use std::collections::BTreeSet;

use async_trait::async_trait;

use super::schema;
use crate::{Error, Result};

/// Store operations the migration runner needs.
#[async_trait]
pub trait SchemaStore: Send + Sync {
    /// Execute a statement that returns no rows.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run a query returning a single `count` column.
    async fn query_count(&self, sql: &str) -> Result<u64>;

    /// Create the history table if needed.
    async fn ensure_history(&self) -> Result<()>;

    /// Versions already recorded in the history table.
    async fn applied_versions(&self) -> Result<BTreeSet<u32>>;

    /// Record a successful migration.
    async fn record_migration(&self, version: u32, description: &str) -> Result<()>;
}

/// A migration step expressed as code rather than a single statement.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn run(&self, store: &dyn SchemaStore) -> Result<()>;
}

/// What a migration does.
pub enum MigrationStep {
    Sql(String),
    Procedure(Box<dyn Procedure>),
}

impl std::fmt::Debug for MigrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStep::Sql(sql) => f.debug_tuple("Sql").field(sql).finish(),
            MigrationStep::Procedure(_) => f.write_str("Procedure"),
        }
    }
}

#[derive(Debug)]
pub struct Migration {
    pub version: u32,
    pub description: String,
    pub step: MigrationStep,
}

impl Migration {
    pub fn sql(version: u32, description: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            description: description.into(),
            step: MigrationStep::Sql(sql.into()),
        }
    }

    pub fn procedure(
        version: u32,
        description: impl Into<String>,
        procedure: impl Procedure + 'static,
    ) -> Self {
        Self {
            version,
            description: description.into(),
            step: MigrationStep::Procedure(Box::new(procedure)),
        }
    }
}

/// Outcome of a migration run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MigrationReport {
    /// Versions executed by this run.
    pub applied: Vec<u32>,
    /// Versions that were already recorded.
    pub skipped: usize,
}

pub struct MigrationRunner {
    migrations: Vec<Migration>,
}

impl MigrationRunner {
    /// Build a runner over `migrations` (any order).
    pub fn new(mut migrations: Vec<Migration>) -> Self {
        migrations.sort_by_key(|m| m.version);
        Self { migrations }
    }

    /// The agent's built-in migrations.
    pub fn builtin(retention_days: u32) -> Self {
        Self::new(vec![
            Migration::sql(
                1,
                "create dns_query_log table",
                schema::create_base_table(retention_days),
            ),
            Migration::sql(2, "add group_name column", schema::add_group_column()),
            Migration::procedure(3, "repair result_count", RepairResultCount),
        ])
    }

    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Apply every pending migration.
    ///
    /// Stops at the first failure with [`Error::Migration`].
    pub async fn run(&self, store: &dyn SchemaStore) -> Result<MigrationReport> {
        if let Some(dup) = self
            .migrations
            .windows(2)
            .find(|w| w[0].version == w[1].version)
        {
            return Err(Error::Migration {
                version: dup[0].version,
                message: "version declared more than once".to_string(),
            });
        }

        store.ensure_history().await?;
        let applied = store.applied_versions().await?;

        let mut report = MigrationReport::default();
        for migration in &self.migrations {
            if applied.contains(&migration.version) {
                report.skipped += 1;
                continue;
            }

            tracing::info!(
                version = migration.version,
                description = %migration.description,
                "Applying migration"
            );

            let outcome = match &migration.step {
                MigrationStep::Sql(sql) => store.execute(sql).await,
                MigrationStep::Procedure(procedure) => procedure.run(store).await,
            };

            let failed = |e: Error| Error::Migration {
                version: migration.version,
                message: e.to_string(),
            };
            outcome.map_err(failed)?;
            store
                .record_migration(migration.version, &migration.description)
                .await
                .map_err(failed)?;

            report.applied.push(migration.version);
        }

        if report.applied.is_empty() {
            tracing::debug!(skipped = report.skipped, "Schema up to date");
        } else {
            tracing::info!(applied = ?report.applied, "Migrations complete");
        }

        Ok(report)
    }
}

/// Fix rows whose `result_count` disagrees with `length(result_ips)`.
struct RepairResultCount;

#[async_trait]
impl Procedure for RepairResultCount {
    async fn run(&self, store: &dyn SchemaStore) -> Result<()> {
        let mismatched = store
            .query_count(&schema::count_result_count_mismatches())
            .await?;
        if mismatched == 0 {
            return Ok(());
        }

        tracing::info!(rows = mismatched, "Repairing result_count");
        store.execute(&schema::repair_result_count()).await
    }
}
