//! Agent configuration loaded from environment variables.

use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Serialize;

use crate::collector::CollectorConfig;
use crate::logging::LoggingConfig;
use crate::pipeline::{ClickHouseConfig, MAX_RETENTION_DAYS, MIN_RETENTION_DAYS};
use crate::{Error, Result};

/// Default control surface bind address.
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:8686";

/// Default Prometheus port.
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Full agent configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Tailer, buffer and checkpoint settings.
    pub collector: CollectorConfig,

    /// ClickHouse connection and schema settings.
    pub clickhouse: ClickHouseConfig,

    /// Local log files written by the agent itself.
    pub logging: LoggingConfig,

    /// Control surface bind address.
    pub control_addr: SocketAddr,

    /// Metrics HTTP server port (0 disables).
    pub metrics_port: u16,

    /// Adjustments made while loading, logged once tracing is up.
    #[serde(skip)]
    pub warnings: Vec<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `DNSLOG_NODE_ID`: numeric identity of this DNS node
    /// - `CLICKHOUSE_HOST`: ClickHouse host name
    ///
    /// Optional:
    /// - `DNSLOG_LOG_FILE`: file to tail (default: "/var/log/smartdns/audit.log")
    /// - `DNSLOG_BATCH_SIZE`: records per batch (default: 1000)
    /// - `DNSLOG_FLUSH_INTERVAL_SECS`: flush timer (default: 5)
    /// - `DNSLOG_CHECKPOINT_INTERVAL_SECS`: checkpoint timer (default: 30)
    /// - `DNSLOG_POLL_INTERVAL_MS`: idle poll sleep (default: 500)
    /// - `DNSLOG_ERROR_BACKOFF_SECS`: delay after a read error (default: 5)
    /// - `DNSLOG_STATE_DIR`: checkpoint directory (default: "/var/lib/dnslog")
    /// - `CLICKHOUSE_PORT`: HTTP port (default: 8123)
    /// - `CLICKHOUSE_DATABASE`: database name (default: "dns_logs")
    /// - `CLICKHOUSE_USER` / `CLICKHOUSE_PASSWORD`: credentials (default: "default" / "")
    /// - `DNSLOG_RETENTION_DAYS`: table TTL, clamped to 30..=90 (default: 30)
    /// - `DNSLOG_LOCAL_LOG_DIR`: agent log directory (default: "./logs")
    /// - `DNSLOG_LOCAL_LOG_RETENTION_DAYS`: agent log retention (default: 7)
    /// - `DNSLOG_CONTROL_ADDR`: control surface address (default: "127.0.0.1:8686")
    /// - `DNSLOG_METRICS_PORT`: Prometheus port, 0 disables (default: 9090)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let node_id: u32 = env.required("DNSLOG_NODE_ID")?;
        let host: String = env.required("CLICKHOUSE_HOST")?;

        let collector_defaults = CollectorConfig::default();
        let collector = CollectorConfig {
            node_id,
            log_file: env.parse_or("DNSLOG_LOG_FILE", collector_defaults.log_file)?,
            batch_size: env.parse_or("DNSLOG_BATCH_SIZE", collector_defaults.batch_size)?,
            flush_interval: Duration::from_secs(env.parse_or(
                "DNSLOG_FLUSH_INTERVAL_SECS",
                collector_defaults.flush_interval.as_secs(),
            )?),
            checkpoint_interval: Duration::from_secs(env.parse_or(
                "DNSLOG_CHECKPOINT_INTERVAL_SECS",
                collector_defaults.checkpoint_interval.as_secs(),
            )?),
            poll_interval: Duration::from_millis(env.parse_or(
                "DNSLOG_POLL_INTERVAL_MS",
                collector_defaults.poll_interval.as_millis() as u64,
            )?),
            error_backoff: Duration::from_secs(env.parse_or(
                "DNSLOG_ERROR_BACKOFF_SECS",
                collector_defaults.error_backoff.as_secs(),
            )?),
            state_dir: env.parse_or("DNSLOG_STATE_DIR", collector_defaults.state_dir)?,
        };

        if collector.batch_size == 0 {
            return Err(Error::Config("DNSLOG_BATCH_SIZE must be at least 1".to_string()));
        }
        if collector.flush_interval.is_zero() || collector.checkpoint_interval.is_zero() {
            return Err(Error::Config(
                "flush and checkpoint intervals must be at least one second".to_string(),
            ));
        }

        let ch_defaults = ClickHouseConfig::default();
        let requested_retention: u32 =
            env.parse_or("DNSLOG_RETENTION_DAYS", ch_defaults.retention_days)?;
        let retention_days = requested_retention.clamp(MIN_RETENTION_DAYS, MAX_RETENTION_DAYS);
        let mut warnings = Vec::new();
        if retention_days != requested_retention {
            warnings.push(format!(
                "DNSLOG_RETENTION_DAYS={requested_retention} outside supported range, using {retention_days}"
            ));
        }

        let clickhouse = ClickHouseConfig {
            host,
            port: env.parse_or("CLICKHOUSE_PORT", ch_defaults.port)?,
            database: env.parse_or("CLICKHOUSE_DATABASE", ch_defaults.database)?,
            username: env.parse_or("CLICKHOUSE_USER", ch_defaults.username)?,
            password: env.parse_or("CLICKHOUSE_PASSWORD", ch_defaults.password)?,
            retention_days,
        };

        let log_defaults = LoggingConfig::default();
        let logging = LoggingConfig {
            directory: env.parse_or("DNSLOG_LOCAL_LOG_DIR", log_defaults.directory)?,
            retention_days: env.parse_or(
                "DNSLOG_LOCAL_LOG_RETENTION_DAYS",
                log_defaults.retention_days,
            )?,
            ..log_defaults
        };

        let control_addr = env.parse_or(
            "DNSLOG_CONTROL_ADDR",
            DEFAULT_CONTROL_ADDR
                .parse::<SocketAddr>()
                .map_err(|e| Error::Config(e.to_string()))?,
        )?;

        let metrics_port = env.parse_or("DNSLOG_METRICS_PORT", DEFAULT_METRICS_PORT)?;

        Ok(Self {
            collector,
            clickhouse,
            logging,
            control_addr,
            metrics_port,
            warnings,
        })
    }

    /// Node identity of this agent.
    pub fn node_id(&self) -> u32 {
        self.collector.node_id
    }

    /// Log the effective configuration (password omitted).
    pub fn log_summary(&self) {
        for warning in &self.warnings {
            tracing::warn!("{}", warning);
        }
        tracing::info!("Configuration:");
        tracing::info!("  Node: {}", self.collector.node_id);
        tracing::info!("  Log file: {}", self.collector.log_file.display());
        tracing::info!("  State dir: {}", self.collector.state_dir.display());
        tracing::info!(
            "  Batch: {} records / {:?}",
            self.collector.batch_size,
            self.collector.flush_interval
        );
        tracing::info!("  Checkpoint interval: {:?}", self.collector.checkpoint_interval);
        tracing::info!(
            "  ClickHouse: {} (database {}, retention {} days)",
            self.clickhouse.url(),
            self.clickhouse.database,
            self.clickhouse.retention_days
        );
        tracing::info!("  Local logs: {}", self.logging.directory.display());
        tracing::info!("  Control: {}", self.control_addr);
    }
}

/// Typed access to a key lookup.
struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required<T>(&self, key: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self
            .get(key)
            .ok_or_else(|| Error::Config(format!("{key} environment variable is required")))?;
        parse_value(key, &raw)
    }

    fn parse_or<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse()
        .map_err(|e| Error::Config(format!("invalid value for {key} ({raw:?}): {e}")))
}

/// Default directory for agent state.
pub fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/lib/dnslog")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    const REQUIRED: &[(&str, &str)] = &[("DNSLOG_NODE_ID", "3"), ("CLICKHOUSE_HOST", "ch.local")];

    #[test]
    fn config_defaults() {
        let config = load(REQUIRED).unwrap();

        assert_eq!(config.node_id(), 3);
        assert_eq!(
            config.collector.log_file,
            PathBuf::from("/var/log/smartdns/audit.log")
        );
        assert_eq!(config.collector.batch_size, 1000);
        assert_eq!(config.collector.flush_interval, Duration::from_secs(5));
        assert_eq!(config.collector.checkpoint_interval, Duration::from_secs(30));
        assert_eq!(config.collector.poll_interval, Duration::from_millis(500));
        assert_eq!(config.collector.state_dir, default_state_dir());
        assert_eq!(config.clickhouse.host, "ch.local");
        assert_eq!(config.clickhouse.port, 8123);
        assert_eq!(config.clickhouse.database, "dns_logs");
        assert_eq!(config.clickhouse.username, "default");
        assert_eq!(config.clickhouse.retention_days, 30);
        assert_eq!(config.logging.retention_days, 7);
        assert_eq!(config.control_addr.to_string(), DEFAULT_CONTROL_ADDR);
        assert_eq!(config.metrics_port, DEFAULT_METRICS_PORT);
    }

    #[test]
    fn config_requires_node_id() {
        let err = load(&[("CLICKHOUSE_HOST", "ch.local")]).unwrap_err();
        assert!(err.to_string().contains("DNSLOG_NODE_ID"));
    }

    #[test]
    fn config_requires_clickhouse_host() {
        let err = load(&[("DNSLOG_NODE_ID", "1")]).unwrap_err();
        assert!(err.to_string().contains("CLICKHOUSE_HOST"));
    }

    #[test]
    fn config_blank_required_value_is_missing() {
        let err = load(&[("DNSLOG_NODE_ID", "  "), ("CLICKHOUSE_HOST", "ch")]).unwrap_err();
        assert!(err.to_string().contains("required"));
    }

    #[test]
    fn config_rejects_malformed_numbers() {
        let err = load(&[("DNSLOG_NODE_ID", "node-a"), ("CLICKHOUSE_HOST", "ch")]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let mut vars = REQUIRED.to_vec();
        vars.push(("DNSLOG_BATCH_SIZE", "lots"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn config_rejects_zero_batch_size() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DNSLOG_BATCH_SIZE", "0"));
        assert!(load(&vars).is_err());
    }

    #[test]
    fn config_custom_values() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("DNSLOG_LOG_FILE", "/tmp/query.log"),
            ("DNSLOG_BATCH_SIZE", "50"),
            ("DNSLOG_FLUSH_INTERVAL_SECS", "2"),
            ("DNSLOG_CHECKPOINT_INTERVAL_SECS", "10"),
            ("DNSLOG_POLL_INTERVAL_MS", "100"),
            ("DNSLOG_STATE_DIR", "/tmp/state"),
            ("CLICKHOUSE_PORT", "18123"),
            ("CLICKHOUSE_DATABASE", "dns"),
            ("CLICKHOUSE_USER", "writer"),
            ("CLICKHOUSE_PASSWORD", "secret"),
            ("DNSLOG_CONTROL_ADDR", "0.0.0.0:9000"),
            ("DNSLOG_METRICS_PORT", "0"),
        ]);
        let config = load(&vars).unwrap();

        assert_eq!(config.collector.log_file, PathBuf::from("/tmp/query.log"));
        assert_eq!(config.collector.batch_size, 50);
        assert_eq!(config.collector.flush_interval, Duration::from_secs(2));
        assert_eq!(config.collector.checkpoint_interval, Duration::from_secs(10));
        assert_eq!(config.collector.poll_interval, Duration::from_millis(100));
        assert_eq!(config.clickhouse.url(), "http://ch.local:18123");
        assert_eq!(config.clickhouse.database, "dns");
        assert_eq!(config.clickhouse.username, "writer");
        assert_eq!(config.clickhouse.password, "secret");
        assert_eq!(config.control_addr.port(), 9000);
        assert_eq!(config.metrics_port, 0);
    }

    #[test]
    fn config_retention_is_clamped() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DNSLOG_RETENTION_DAYS", "7"));
        let config = load(&vars).unwrap();
        assert_eq!(config.clickhouse.retention_days, 30);
        assert_eq!(config.warnings.len(), 1);
        assert!(config.warnings[0].contains("DNSLOG_RETENTION_DAYS=7"));

        let mut vars = REQUIRED.to_vec();
        vars.push(("DNSLOG_RETENTION_DAYS", "365"));
        assert_eq!(load(&vars).unwrap().clickhouse.retention_days, 90);

        let mut vars = REQUIRED.to_vec();
        vars.push(("DNSLOG_RETENTION_DAYS", "60"));
        let config = load(&vars).unwrap();
        assert_eq!(config.clickhouse.retention_days, 60);
        assert!(config.warnings.is_empty());
    }

    #[test]
    fn config_password_is_not_serialized() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("CLICKHOUSE_PASSWORD", "hunter2"));
        let config = load(&vars).unwrap();

        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("hunter2"));
    }

    /// Serializes tests that touch the process environment.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn config_from_process_env() {
        let _guard = ENV_MUTEX.lock().unwrap();

        // SAFETY: Serialized by mutex; only this test touches these vars.
        unsafe {
            std::env::set_var("DNSLOG_NODE_ID", "42");
            std::env::set_var("CLICKHOUSE_HOST", "env-host");
        }

        let config = Config::from_env();

        // SAFETY: Restoring original env state.
        unsafe {
            std::env::remove_var("DNSLOG_NODE_ID");
            std::env::remove_var("CLICKHOUSE_HOST");
        }

        let config = config.unwrap();
        assert_eq!(config.node_id(), 42);
        assert_eq!(config.clickhouse.host, "env-host");
    }
}
