//! Tracing setup and the agent's own local log files.
//!
//! Output goes to stdout and to daily-rotated files under the configured
//! directory. Files past retention are pruned at startup and once a day.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::Result;

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,dnslog_ingest=debug";

/// Upper bound for `/logs?lines=N`.
pub const MAX_TAIL_LINES: usize = 1000;

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Local log file settings.
#[derive(Debug, Clone, Serialize)]
pub struct LoggingConfig {
    /// Directory for rotated log files.
    pub directory: PathBuf,

    /// Days to keep rotated files.
    pub retention_days: u64,

    /// File name prefix; the appender adds a `.YYYY-MM-DD` suffix.
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("./logs"),
            retention_days: 7,
            file_prefix: "dnslog-ingest.log".to_string(),
        }
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer when dropped and must be kept
/// alive for the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<WorkerGuard> {
    fs::create_dir_all(&config.directory)?;

    let appender = tracing_appender::rolling::daily(&config.directory, &config.file_prefix);
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

/// Delete log files under `dir` older than `retention_days`.
///
/// Only files whose name starts with `prefix` are considered. Returns the
/// number of files removed.
pub fn prune_local_logs(dir: &Path, prefix: &str, retention_days: u64) -> Result<usize> {
    let max_age = Duration::from_secs(retention_days.saturating_mul(SECONDS_PER_DAY));
    let now = SystemTime::now();
    let mut removed = 0;

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !is_log_file(&path, prefix) {
            continue;
        }

        let modified = entry.metadata()?.modified()?;
        let age = now.duration_since(modified).unwrap_or_default();
        if age > max_age {
            match fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    tracing::debug!(path = %path.display(), "Removed expired log file");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove log file")
                }
            }
        }
    }

    Ok(removed)
}

/// Prune once now, then once a day until the task is dropped.
pub async fn run_log_pruner(config: LoggingConfig) {
    let mut interval = tokio::time::interval(Duration::from_secs(SECONDS_PER_DAY));
    loop {
        interval.tick().await;
        match prune_local_logs(&config.directory, &config.file_prefix, config.retention_days) {
            Ok(0) => {}
            Ok(n) => tracing::info!(removed = n, "Pruned local log files"),
            Err(e) => tracing::warn!(error = %e, "Local log pruning failed"),
        }
    }
}

/// Most recently modified log file under `dir`, if any.
pub fn newest_log_file(dir: &Path, prefix: &str) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if !is_log_file(&path, prefix) {
            continue;
        }
        let modified = entry.metadata()?.modified()?;
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Last `lines` lines of the newest log file (at most [`MAX_TAIL_LINES`]).
pub fn tail_local_log(config: &LoggingConfig, lines: usize) -> Result<Vec<String>> {
    let Some(path) = newest_log_file(&config.directory, &config.file_prefix)? else {
        return Ok(Vec::new());
    };
    tail_file(&path, lines.min(MAX_TAIL_LINES))
}

fn tail_file(path: &Path, lines: usize) -> Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut tail = VecDeque::with_capacity(lines);

    for line in reader.lines() {
        let line = line?;
        if tail.len() == lines {
            tail.pop_front();
        }
        if lines > 0 {
            tail.push_back(line);
        }
    }

    Ok(tail.into())
}

fn is_log_file(path: &Path, prefix: &str) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(prefix))
}
