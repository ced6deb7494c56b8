//! ClickHouse DDL for the query-log table and its derived objects.
//!
//! The base table is created by migration 1. Views and skip indexes are
//! created after migrations on every start; they are best-effort and use
//! `IF NOT EXISTS` so re-creating them is a no-op.

/// Base table holding one row per query-log line.
pub const TABLE: &str = "dns_query_log";

/// Migration history table.
pub const MIGRATIONS_TABLE: &str = "schema_migrations";

/// A named derived object (view or index) and the statement creating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    pub name: &'static str,
    pub ddl: String,
}

pub fn create_database(database: &str) -> String {
    format!("CREATE DATABASE IF NOT EXISTS {database}")
}

pub fn create_migrations_table() -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE}
(
    version UInt32,
    description String,
    executed_at DateTime DEFAULT now()
)
ENGINE = MergeTree
ORDER BY version"#
    )
}

pub fn create_base_table(retention_days: u32) -> String {
    format!(
        r#"CREATE TABLE IF NOT EXISTS {TABLE}
(
    timestamp DateTime64(3),
    date Date,
    node_id UInt32,
    client_ip String,
    domain String,
    query_type UInt16,
    time_ms UInt32,
    speed_ms Float32,
    result_ips Array(String),
    result_count UInt8,
    raw_log String CODEC(ZSTD(3))
)
ENGINE = MergeTree
PARTITION BY date
ORDER BY (date, node_id, timestamp)
TTL date + INTERVAL {retention_days} DAY
SETTINGS index_granularity = 8192"#
    )
}

pub fn add_group_column() -> String {
    format!("ALTER TABLE {TABLE} ADD COLUMN IF NOT EXISTS group_name String DEFAULT '' AFTER result_count")
}

/// Predicate selecting rows whose `result_count` disagrees with their list.
pub const RESULT_COUNT_MISMATCH: &str = "result_count != least(length(result_ips), 255)";

pub fn count_result_count_mismatches() -> String {
    format!("SELECT count() AS count FROM {TABLE} WHERE {RESULT_COUNT_MISMATCH}")
}

pub fn repair_result_count() -> String {
    format!(
        "ALTER TABLE {TABLE} UPDATE result_count = least(length(result_ips), 255) WHERE {RESULT_COUNT_MISMATCH}"
    )
}

/// Aggregating materialized views over the base table.
pub fn views(retention_days: u32) -> Vec<SchemaObject> {
    let ttl = format!("TTL date + INTERVAL {retention_days} DAY");

    vec![
        SchemaObject {
            name: "dns_hourly_stats",
            ddl: format!(
                r#"CREATE MATERIALIZED VIEW IF NOT EXISTS dns_hourly_stats
ENGINE = SummingMergeTree
PARTITION BY date
ORDER BY (date, hour, node_id, domain)
{ttl}
AS SELECT
    date,
    toStartOfHour(timestamp) AS hour,
    node_id,
    domain,
    count() AS queries,
    sum(time_ms) AS total_time_ms,
    countIf(result_count = 0) AS empty_results
FROM {TABLE}
GROUP BY date, hour, node_id, domain"#
            ),
        },
        SchemaObject {
            name: "dns_top_domains_daily",
            ddl: format!(
                r#"CREATE MATERIALIZED VIEW IF NOT EXISTS dns_top_domains_daily
ENGINE = SummingMergeTree
PARTITION BY date
ORDER BY (date, node_id, domain)
{ttl}
AS SELECT
    date,
    node_id,
    domain,
    count() AS queries
FROM {TABLE}
GROUP BY date, node_id, domain"#
            ),
        },
        SchemaObject {
            name: "dns_client_stats_daily",
            ddl: format!(
                r#"CREATE MATERIALIZED VIEW IF NOT EXISTS dns_client_stats_daily
ENGINE = SummingMergeTree
PARTITION BY date
ORDER BY (date, node_id, client_ip)
{ttl}
AS SELECT
    date,
    node_id,
    client_ip,
    count() AS queries,
    sum(time_ms) AS total_time_ms
FROM {TABLE}
GROUP BY date, node_id, client_ip"#
            ),
        },
        SchemaObject {
            name: "dns_daily_summary",
            ddl: format!(
                r#"CREATE MATERIALIZED VIEW IF NOT EXISTS dns_daily_summary
ENGINE = SummingMergeTree
PARTITION BY date
ORDER BY (date, node_id)
{ttl}
AS SELECT
    date,
    node_id,
    count() AS queries,
    sum(time_ms) AS total_time_ms,
    countIf(result_count = 0) AS empty_results
FROM {TABLE}
GROUP BY date, node_id"#
            ),
        },
    ]
}

/// Data-skipping indexes on the base table.
pub fn indexes() -> Vec<SchemaObject> {
    let index = |name: &'static str, expr: &str, kind: &str| SchemaObject {
        name,
        ddl: format!(
            "ALTER TABLE {TABLE} ADD INDEX IF NOT EXISTS {name} {expr} TYPE {kind} GRANULARITY 4"
        ),
    };

    vec![
        index("idx_timestamp", "timestamp", "minmax"),
        index("idx_domain_bloom", "domain", "bloom_filter(0.01)"),
        index("idx_client_ip_bloom", "client_ip", "bloom_filter(0.01)"),
        index("idx_domain_ngram", "domain", "ngrambf_v1(3, 256, 2, 0)"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_table_layout() {
        let ddl = create_base_table(45);
        assert!(ddl.contains("CREATE TABLE IF NOT EXISTS dns_query_log"));
        assert!(ddl.contains("PARTITION BY date"));
        assert!(ddl.contains("ORDER BY (date, node_id, timestamp)"));
        assert!(ddl.contains("TTL date + INTERVAL 45 DAY"));
        assert!(ddl.contains("raw_log String CODEC(ZSTD(3))"));
    }

    #[test]
    fn test_views_are_idempotent_and_keyed_by_date() {
        let views = views(30);
        assert_eq!(views.len(), 4);
        for view in &views {
            assert!(view.ddl.starts_with("CREATE MATERIALIZED VIEW IF NOT EXISTS"));
            assert!(view.ddl.contains(view.name));
            assert!(view.ddl.contains("ORDER BY (date"));
            assert!(view.ddl.contains("INTERVAL 30 DAY"));
        }
    }

    #[test]
    fn test_indexes() {
        let indexes = indexes();
        let names: Vec<_> = indexes.iter().map(|i| i.name).collect();
        assert_eq!(
            names,
            vec![
                "idx_timestamp",
                "idx_domain_bloom",
                "idx_client_ip_bloom",
                "idx_domain_ngram"
            ]
        );
        assert!(indexes.iter().all(|i| i.ddl.contains("ADD INDEX IF NOT EXISTS")));
        assert!(indexes[3].ddl.contains("ngrambf_v1(3, 256, 2, 0)"));
    }

    #[test]
    fn test_repair_targets_mismatched_rows() {
        assert!(repair_result_count().contains(RESULT_COUNT_MISMATCH));
        assert!(count_result_count_mismatches().starts_with("SELECT count()"));
    }
}
