//! Log tailer and collector.
//!
//! The [`Collector`] is the single authority over what has been read from the
//! query log and what still has to reach the sink. It runs three cooperative
//! loops on one task:
//!
//! - the poll loop, which reads new complete lines, parses them and appends
//!   records to the [`BatchBuffer`] (flushing inline when it fills up)
//! - the flush timer, which ships whatever is buffered
//! - the checkpoint timer, which persists the committed offset when it moved
//!
//! # Offsets
//!
//! The read offset advances past every scanned line. The committed offset is
//! what gets persisted: the minimum of the read offset, the start of the
//! oldest buffered record and the start of the batch currently being
//! inserted. After a crash the tailer re-reads anything that was read but not
//! yet delivered. A batch whose insert fails is dropped and releases its pin.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dnslog_core::metrics as m;
use dnslog_core::{QueryLogRecord, parse_line};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::buffer::BatchBuffer;
use crate::checkpoint::{
    Checkpoint, CheckpointStore, FileSnapshot, StartReason, resolve_start_offset,
};
use crate::config::default_state_dir;
use crate::pipeline::RecordSink;
use crate::{Error, Result};

/// Configuration for the collector.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorConfig {
    /// Node identity stamped on every record
    pub node_id: u32,

    /// Query log to tail
    pub log_file: PathBuf,

    /// Buffer capacity that triggers an inline flush
    pub batch_size: usize,

    /// Flush timer period
    pub flush_interval: Duration,

    /// Checkpoint timer period
    pub checkpoint_interval: Duration,

    /// Sleep between polls when the file has not grown
    pub poll_interval: Duration,

    /// Sleep after a failed read pass
    pub error_backoff: Duration,

    /// Directory holding the checkpoint file
    pub state_dir: PathBuf,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            log_file: PathBuf::from("/var/log/smartdns/audit.log"),
            batch_size: 1000,
            flush_interval: Duration::from_secs(5),
            checkpoint_interval: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(5),
            state_dir: default_state_dir(),
        }
    }
}

/// Point-in-time view of collector counters and offsets.
#[derive(Debug, Clone, Serialize)]
pub struct CollectorStats {
    pub lines_processed: u64,
    pub records_buffered: u64,
    pub records_sent: u64,
    pub batches_sent: u64,
    pub lines_skipped: u64,
    pub errors: u64,
    pub records_dropped: u64,
    pub last_sent_at: Option<DateTime<Utc>>,
    pub read_offset: u64,
    pub committed_offset: u64,
    pub buffer_size: usize,
    pub file_path: PathBuf,
    pub running: bool,
}

#[derive(Debug, Default)]
struct Counters {
    lines_processed: AtomicU64,
    records_buffered: AtomicU64,
    records_sent: AtomicU64,
    batches_sent: AtomicU64,
    lines_skipped: AtomicU64,
    errors: AtomicU64,
    records_dropped: AtomicU64,
}

/// Offsets shared by the poll loop and the timers.
#[derive(Debug, Default)]
struct TailState {
    read_offset: u64,
    /// Start offset of the batch being inserted.
    in_flight: Option<u64>,
    /// Bumped on every rotation reset.
    generation: u64,
    /// Last observed size and mtime of the log file.
    file: Option<FileSnapshot>,
    last_persisted: Option<u64>,
    last_sent_at: Option<DateTime<Utc>>,
}

enum PollOutcome {
    /// New lines were scanned.
    Read,
    /// File has not grown.
    Idle,
    /// File shrank; offset reset to 0.
    Rotated,
}

/// Tails one query log into one sink.
pub struct Collector {
    config: CollectorConfig,
    sink: Arc<dyn RecordSink>,
    checkpoints: CheckpointStore,
    buffer: BatchBuffer,
    state: Mutex<TailState>,
    /// Serializes sink inserts and checkpoint writes.
    write_gate: tokio::sync::Mutex<()>,
    counters: Counters,
    /// Held for the whole of `run`, including startup and shutdown.
    active: AtomicBool,
    /// Set once the start offset is resolved, cleared after shutdown.
    running: AtomicBool,
}

impl Collector {
    /// Create a collector. Opens (and if needed creates) the state directory.
    pub fn new(config: CollectorConfig, sink: Arc<dyn RecordSink>) -> Result<Self> {
        let checkpoints = CheckpointStore::open(&config.state_dir, config.node_id)?;
        let buffer = BatchBuffer::new(config.batch_size);

        Ok(Self {
            config,
            sink,
            checkpoints,
            buffer,
            state: Mutex::new(TailState::default()),
            write_gate: tokio::sync::Mutex::new(()),
            counters: Counters::default(),
            active: AtomicBool::new(false),
            running: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Records currently waiting in the buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the collector is tailing (start offset resolved, not yet shut down).
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> CollectorStats {
        let c = &self.counters;
        let (read_offset, committed_offset, last_sent_at) = {
            let st = self.state.lock();
            (st.read_offset, self.committed_offset(&st), st.last_sent_at)
        };

        CollectorStats {
            lines_processed: c.lines_processed.load(Ordering::Relaxed),
            records_buffered: c.records_buffered.load(Ordering::Relaxed),
            records_sent: c.records_sent.load(Ordering::Relaxed),
            batches_sent: c.batches_sent.load(Ordering::Relaxed),
            lines_skipped: c.lines_skipped.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            records_dropped: c.records_dropped.load(Ordering::Relaxed),
            last_sent_at,
            read_offset,
            committed_offset,
            buffer_size: self.buffer.len(),
            file_path: self.config.log_file.clone(),
            running: self.is_running(),
        }
    }

    /// Run until `cancel` fires, then flush and persist the checkpoint.
    ///
    /// Fails only if this collector is already running.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        self.initialize().await;
        self.running.store(true, Ordering::SeqCst);
        metrics::gauge!(m::COLLECTOR_RUNNING).set(1.0);

        tokio::join!(
            self.poll_loop(&cancel),
            self.flush_timer(&cancel),
            self.checkpoint_timer(&cancel),
        );

        tracing::info!("Collector stopping, draining buffer");
        // Failures are logged and counted by flush
        let _ = self.flush().await;
        if let Err(e) = self.persist_checkpoint().await {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Failed to persist final checkpoint");
        }

        self.running.store(false, Ordering::SeqCst);
        metrics::gauge!(m::COLLECTOR_RUNNING).set(0.0);

        let stats = self.stats();
        tracing::info!(
            lines = stats.lines_processed,
            sent = stats.records_sent,
            offset = stats.committed_offset,
            "Collector stopped"
        );
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Ship everything currently buffered as one batch.
    ///
    /// Returns the number of records delivered. On failure the batch is
    /// dropped and counted.
    pub async fn flush(&self) -> Result<usize> {
        let _gate = self.write_gate.lock().await;
        self.flush_locked().await
    }

    /// Persist the committed offset if it changed since the last write.
    ///
    /// Returns whether a checkpoint was written.
    pub async fn persist_checkpoint(&self) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        self.persist_locked().await
    }

    // =========================================================================
    // Startup
    // =========================================================================

    async fn initialize(&self) {
        let path = &self.config.log_file;

        let checkpoint = match self.checkpoints.load() {
            Ok(cp) => cp,
            Err(e) => {
                tracing::warn!(
                    path = %self.checkpoints.path().display(),
                    error = %e,
                    "Ignoring unreadable checkpoint"
                );
                None
            }
        };

        let snapshot = tokio::fs::metadata(path)
            .await
            .ok()
            .map(|meta| FileSnapshot::from_metadata(&meta));
        let start = resolve_start_offset(checkpoint.as_ref(), path, snapshot);

        match start.reason {
            StartReason::Resumed => {
                tracing::info!(path = %path.display(), offset = start.offset, "Resuming from checkpoint")
            }
            StartReason::NoCheckpoint | StartReason::PathChanged => tracing::info!(
                path = %path.display(),
                offset = start.offset,
                reason = ?start.reason,
                "Starting at end of file"
            ),
            StartReason::Truncated | StartReason::Recreated => tracing::warn!(
                path = %path.display(),
                reason = ?start.reason,
                "Log file changed since checkpoint, starting from beginning"
            ),
            StartReason::FileMissing => {
                tracing::warn!(path = %path.display(), "Log file not found, waiting for it")
            }
        }

        let mut st = self.state.lock();
        st.read_offset = start.offset;
        st.in_flight = None;
        st.file = snapshot;
        st.last_persisted = checkpoint
            .filter(|cp| start.reason == StartReason::Resumed && cp.last_position == start.offset)
            .map(|cp| cp.last_position);
        metrics::gauge!(m::READ_OFFSET).set(start.offset as f64);
    }

    // =========================================================================
    // Poll loop
    // =========================================================================

    async fn poll_loop(&self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let delay = match self.poll_once(cancel).await {
                Ok(PollOutcome::Read) => {
                    tokio::task::yield_now().await;
                    continue;
                }
                Ok(PollOutcome::Idle | PollOutcome::Rotated) => self.config.poll_interval,
                Err(e) => {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!(m::READ_ERRORS).increment(1);
                    tracing::warn!(
                        path = %self.config.log_file.display(),
                        error = %e,
                        backoff = ?self.config.error_backoff,
                        "Read pass failed"
                    );
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn poll_once(&self, cancel: &CancellationToken) -> Result<PollOutcome> {
        let path = &self.config.log_file;

        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(e) => {
                if e.kind() == ErrorKind::NotFound {
                    let stale = {
                        let st = self.state.lock();
                        st.read_offset > 0 || st.file.is_some()
                    };
                    if stale {
                        // Rotated away; the replacement is read from the start
                        self.reset_for_rotation(None);
                    }
                }
                return Err(e.into());
            }
        };

        let snapshot = FileSnapshot::from_metadata(&file.metadata().await?);
        let (offset, generation) = {
            let mut st = self.state.lock();
            if snapshot.size >= st.read_offset {
                st.file = Some(snapshot);
            }
            (st.read_offset, st.generation)
        };

        if snapshot.size < offset {
            tracing::info!(
                path = %path.display(),
                previous_offset = offset,
                current_size = snapshot.size,
                "Log file truncated or rotated, reading from start"
            );
            self.reset_for_rotation(Some(snapshot));
            return Ok(PollOutcome::Rotated);
        }
        if snapshot.size == offset {
            return Ok(PollOutcome::Idle);
        }

        file.seek(SeekFrom::Start(offset)).await?;
        let mut reader = BufReader::new(file);

        let mut position = offset;
        let scanned = self
            .scan_lines(&mut reader, &mut position, generation, cancel)
            .await;
        self.advance_read_offset(position, generation);
        scanned?;

        Ok(if position > offset {
            PollOutcome::Read
        } else {
            PollOutcome::Idle
        })
    }

    /// Read complete lines from `reader`, advancing `position` past each.
    ///
    /// A trailing fragment without a newline is left for the next pass.
    async fn scan_lines<R>(
        &self,
        reader: &mut R,
        position: &mut u64,
        generation: u64,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut buf = Vec::with_capacity(512);

        while !cancel.is_cancelled() {
            buf.clear();
            let n = reader.read_until(b'\n', &mut buf).await?;
            if n == 0 || buf.last() != Some(&b'\n') {
                break;
            }

            let line_start = *position;
            *position += n as u64;

            let line = String::from_utf8_lossy(&buf);
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            self.counters.lines_processed.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(m::LINES_PROCESSED).increment(1);

            let Some(record) = parse_line(line, self.config.node_id) else {
                self.counters.lines_skipped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::LINES_SKIPPED).increment(1);
                continue;
            };

            if self.append(record, line_start) {
                // Offset so far covers the lines now in the batch
                self.advance_read_offset(*position, generation);
                // Failures are logged and counted by flush
                let _ = self.flush().await;
            }
        }

        Ok(())
    }

    /// Buffer a record. Returns `true` when the buffer is full.
    fn append(&self, record: QueryLogRecord, line_start: u64) -> bool {
        let full = self.buffer.append(record, line_start);
        self.counters.records_buffered.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(m::RECORDS_BUFFERED).increment(1);
        metrics::gauge!(m::BUFFER_SIZE).set(self.buffer.len() as f64);
        full
    }

    fn advance_read_offset(&self, position: u64, generation: u64) {
        let mut st = self.state.lock();
        if st.generation == generation && position > st.read_offset {
            st.read_offset = position;
            metrics::gauge!(m::READ_OFFSET).set(position as f64);
        }
    }

    fn reset_for_rotation(&self, snapshot: Option<FileSnapshot>) {
        let mut st = self.state.lock();
        st.read_offset = 0;
        st.in_flight = None;
        st.generation += 1;
        st.file = snapshot;
        self.buffer.release_offset();

        metrics::counter!(m::ROTATIONS).increment(1);
        metrics::gauge!(m::READ_OFFSET).set(0.0);
    }

    // =========================================================================
    // Timers
    // =========================================================================

    async fn flush_timer(&self, cancel: &CancellationToken) {
        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if !self.buffer.is_empty() {
                        let _ = self.flush().await;
                    }
                }
            }
        }
    }

    async fn checkpoint_timer(&self, cancel: &CancellationToken) {
        let mut interval = tokio::time::interval(self.config.checkpoint_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.persist_checkpoint().await {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(error = %e, "Periodic checkpoint failed");
                    }
                }
            }
        }
    }

    // =========================================================================
    // Flush and checkpoint (write gate held)
    // =========================================================================

    async fn flush_locked(&self) -> Result<usize> {
        let (records, generation) = {
            let mut st = self.state.lock();
            let drained = self.buffer.drain_all();
            if drained.records.is_empty() {
                return Ok(0);
            }
            st.in_flight = drained.start_offset;
            (drained.records, st.generation)
        };
        metrics::gauge!(m::BUFFER_SIZE).set(self.buffer.len() as f64);

        let count = records.len();
        let started = Instant::now();
        let result = self.sink.insert_batch(&records).await;
        metrics::histogram!(m::FLUSH_DURATION).record(started.elapsed().as_secs_f64());

        {
            let mut st = self.state.lock();
            if st.generation == generation {
                st.in_flight = None;
            }
            if result.is_ok() {
                st.last_sent_at = Some(Utc::now());
            }
        }

        match result {
            Ok(()) => {
                self.counters.records_sent.fetch_add(count as u64, Ordering::Relaxed);
                self.counters.batches_sent.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(m::RECORDS_SENT).increment(count as u64);
                metrics::counter!(m::BATCHES_SENT).increment(1);
                tracing::debug!(records = count, elapsed = ?started.elapsed(), "Batch sent");

                if let Err(e) = self.persist_locked().await {
                    self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(error = %e, "Checkpoint after flush failed");
                }
                Ok(count)
            }
            Err(e) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.counters.records_dropped.fetch_add(count as u64, Ordering::Relaxed);
                metrics::counter!(m::FLUSH_ERRORS).increment(1);
                metrics::counter!(m::RECORDS_DROPPED).increment(count as u64);
                tracing::error!(records = count, error = %e, "Batch insert failed, batch dropped");
                Err(e)
            }
        }
    }

    async fn persist_locked(&self) -> Result<bool> {
        let (checkpoint, committed) = {
            let st = self.state.lock();
            let committed = self.committed_offset(&st);
            if st.last_persisted == Some(committed) {
                return Ok(false);
            }
            // A missing file is recorded as empty so a replacement starts at 0
            let file = st.file.unwrap_or_else(FileSnapshot::absent);
            let checkpoint = Checkpoint {
                file_path: self.config.log_file.clone(),
                last_position: committed,
                last_mod_time: file.modified,
                file_size: file.size,
                updated_at: Utc::now(),
            };
            (checkpoint, committed)
        };

        let store = self.checkpoints.clone();
        tokio::task::spawn_blocking(move || store.save(&checkpoint))
            .await
            .map_err(|e| Error::Checkpoint(e.to_string()))??;

        self.state.lock().last_persisted = Some(committed);
        tracing::debug!(offset = committed, "Checkpoint saved");
        Ok(true)
    }

    fn committed_offset(&self, st: &TailState) -> u64 {
        [Some(st.read_offset), self.buffer.start_offset(), st.in_flight]
            .into_iter()
            .flatten()
            .min()
            .unwrap_or(st.read_offset)
    }

    /// Path of the checkpoint file.
    pub fn checkpoint_path(&self) -> &Path {
        self.checkpoints.path()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io::Write;
    use tempfile::TempDir;

    /// Sink that keeps batches in memory.
    #[derive(Default)]
    pub(crate) struct MemorySink {
        pub batches: Mutex<Vec<Vec<QueryLogRecord>>>,
        pub fail: AtomicBool,
    }

    impl MemorySink {
        pub fn records(&self) -> Vec<QueryLogRecord> {
            self.batches.lock().iter().flatten().cloned().collect()
        }
    }

    #[async_trait]
    impl RecordSink for MemorySink {
        async fn insert_batch(&self, records: &[QueryLogRecord]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::SinkClosed);
            }
            if !records.is_empty() {
                self.batches.lock().push(records.to_vec());
            }
            Ok(())
        }

        async fn health_check(&self) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::SinkClosed);
            }
            Ok(())
        }
    }

    pub(crate) fn line(domain: &str) -> String {
        format!(
            "[2025-11-21 05:33:18,910] 10.1.102.201 query {domain}, type 1, time 63ms, speed: 29.4ms, result 172.67.149.148\n"
        )
    }

    pub(crate) fn append(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    pub(crate) fn test_config(dir: &TempDir) -> CollectorConfig {
        CollectorConfig {
            node_id: 1,
            log_file: dir.path().join("audit.log"),
            batch_size: 100,
            flush_interval: Duration::from_secs(3600),
            checkpoint_interval: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(10),
            error_backoff: Duration::from_millis(10),
            state_dir: dir.path().join("state"),
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    struct Running {
        collector: Arc<Collector>,
        sink: Arc<MemorySink>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    impl Running {
        async fn stop(self) -> (Arc<Collector>, Arc<MemorySink>) {
            self.cancel.cancel();
            self.handle.await.unwrap().unwrap();
            (self.collector, self.sink)
        }
    }

    async fn start(config: CollectorConfig) -> Running {
        let sink = Arc::new(MemorySink::default());
        let collector = Arc::new(Collector::new(config, sink.clone()).unwrap());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let collector = collector.clone();
            let cancel = cancel.clone();
            async move { collector.run(cancel).await }
        });
        wait_for(|| collector.is_running()).await;
        Running {
            collector,
            sink,
            cancel,
            handle,
        }
    }

    #[tokio::test]
    async fn test_skips_backlog_and_reads_appended_lines() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        append(&config.log_file, &line("old.example"));

        let run = start(config.clone()).await;
        append(&config.log_file, &format!("{}{}", line("a.com"), line("b.com")));
        wait_for(|| run.collector.stats().lines_processed == 2).await;

        let (_, sink) = run.stop().await;
        let domains: Vec<_> = sink.records().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec!["a.com", "b.com"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_read_from_start() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let run = start(config.clone()).await;
        wait_for(|| run.collector.stats().errors > 0).await;
        append(&config.log_file, &line("first.com"));
        wait_for(|| run.collector.stats().lines_processed == 1).await;

        assert!(run.collector.is_running());
        let (_, sink) = run.stop().await;
        assert_eq!(sink.records()[0].domain, "first.com");
    }

    #[tokio::test]
    async fn test_non_matching_lines_counted_not_buffered() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        append(
            &config.log_file,
            &format!("garbage line\n\n{}", line("ok.com")),
        );
        wait_for(|| run.collector.stats().lines_processed == 2).await;

        let stats = run.collector.stats();
        assert_eq!(stats.lines_skipped, 1);
        assert_eq!(stats.records_buffered, 1);
        assert_eq!(run.collector.buffer_size(), 1);
        run.stop().await;
    }

    #[tokio::test]
    async fn test_committed_offset_pinned_until_flush() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        let text = format!("{}{}", line("a.com"), line("b.com"));
        append(&config.log_file, &text);
        wait_for(|| run.collector.stats().read_offset == text.len() as u64).await;

        let stats = run.collector.stats();
        assert_eq!(stats.committed_offset, 0);
        assert_eq!(stats.buffer_size, 2);

        assert_eq!(run.collector.flush().await.unwrap(), 2);
        let stats = run.collector.stats();
        assert_eq!(stats.committed_offset, text.len() as u64);
        assert_eq!(stats.records_sent, 2);
        assert_eq!(stats.batches_sent, 1);
        assert!(stats.last_sent_at.is_some());

        let store = CheckpointStore::open(&config.state_dir, config.node_id).unwrap();
        let saved = store.load().unwrap().unwrap();
        assert_eq!(saved.last_position, text.len() as u64);
        assert_eq!(saved.file_path, config.log_file);
        run.stop().await;
    }

    #[tokio::test]
    async fn test_inline_flush_at_capacity() {
        let dir = TempDir::new().unwrap();
        let config = CollectorConfig {
            batch_size: 2,
            ..test_config(&dir)
        };
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        append(
            &config.log_file,
            &format!("{}{}{}", line("a.com"), line("b.com"), line("c.com")),
        );
        wait_for(|| run.collector.stats().lines_processed == 3).await;
        wait_for(|| run.sink.batches.lock().len() == 1).await;

        assert_eq!(run.sink.batches.lock()[0].len(), 2);
        assert_eq!(run.collector.buffer_size(), 1);
        run.stop().await;
    }

    #[tokio::test]
    async fn test_failed_batch_is_dropped_and_releases_pin() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        let text = format!("{}{}", line("a.com"), line("b.com"));
        append(&config.log_file, &text);
        wait_for(|| run.collector.stats().read_offset == text.len() as u64).await;

        run.sink.fail.store(true, Ordering::SeqCst);
        assert!(run.collector.flush().await.is_err());

        let stats = run.collector.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.records_dropped, 2);
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.committed_offset, text.len() as u64);
        run.stop().await;
    }

    #[tokio::test]
    async fn test_truncation_resets_to_start() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        let noise = "noise\n";
        append(
            &config.log_file,
            &format!("{noise}{}{}", line("a.com"), line("b.com")),
        );
        wait_for(|| run.collector.stats().lines_processed == 3).await;
        assert_eq!(run.collector.stats().committed_offset, noise.len() as u64);

        // The old file's pin is released; the new file pins its own first record
        let skipped = "unparsed line after rotation\n";
        let replacement = format!("{skipped}{}", line("after.com"));
        std::fs::write(&config.log_file, &replacement).unwrap();
        wait_for(|| run.collector.stats().lines_processed == 5).await;

        let stats = run.collector.stats();
        assert_eq!(stats.read_offset, replacement.len() as u64);
        assert_eq!(stats.committed_offset, skipped.len() as u64);
        assert_eq!(stats.buffer_size, 3);

        let (_, sink) = run.stop().await;
        let domains: Vec<_> = sink.records().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec!["a.com", "b.com", "after.com"]);
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        let full = line("slow.com");
        let (head, tail) = full.split_at(full.len() - 1);
        append(&config.log_file, head);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(run.collector.stats().lines_processed, 0);
        assert_eq!(run.collector.stats().read_offset, 0);

        append(&config.log_file, tail);
        wait_for(|| run.collector.stats().lines_processed == 1).await;
        assert_eq!(run.collector.stats().read_offset, full.len() as u64);
        run.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_persists() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        let text = format!("{}{}", line("a.com"), line("b.com"));
        append(&config.log_file, &text);
        wait_for(|| run.collector.stats().lines_processed == 2).await;

        let (collector, sink) = run.stop().await;
        assert_eq!(sink.records().len(), 2);
        assert!(!collector.is_running());

        let store = CheckpointStore::open(&config.state_dir, config.node_id).unwrap();
        assert_eq!(store.load().unwrap().unwrap().last_position, text.len() as u64);
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint_after_growth() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let first = format!("{}{}", line("seen-1.com"), line("seen-2.com"));
        append(&config.log_file, &first);
        let meta = std::fs::metadata(&config.log_file).unwrap();
        let snapshot = FileSnapshot::from_metadata(&meta);

        let store = CheckpointStore::open(&config.state_dir, config.node_id).unwrap();
        store
            .save(&Checkpoint {
                file_path: config.log_file.clone(),
                last_position: first.len() as u64,
                last_mod_time: snapshot.modified,
                file_size: snapshot.size,
                updated_at: Utc::now(),
            })
            .unwrap();

        let second = format!("{}{}{}", line("new-1.com"), line("new-2.com"), line("new-3.com"));
        append(&config.log_file, &second);

        let run = start(config.clone()).await;
        wait_for(|| run.collector.stats().lines_processed == 3).await;
        assert_eq!(
            run.collector.stats().read_offset,
            (first.len() + second.len()) as u64
        );

        let (_, sink) = run.stop().await;
        let domains: Vec<_> = sink.records().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec!["new-1.com", "new-2.com", "new-3.com"]);
    }

    #[tokio::test]
    async fn test_flush_timer_ships_buffer() {
        let dir = TempDir::new().unwrap();
        let config = CollectorConfig {
            flush_interval: Duration::from_millis(50),
            ..test_config(&dir)
        };
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        let text = format!("{}{}", line("a.com"), line("b.com"));
        append(&config.log_file, &text);
        wait_for(|| run.sink.records().len() == 2).await;

        let stats = run.collector.stats();
        assert_eq!(stats.records_sent, 2);
        assert_eq!(stats.buffer_size, 0);
        assert_eq!(stats.committed_offset, text.len() as u64);
        run.stop().await;
    }

    #[tokio::test]
    async fn test_checkpoint_timer_writes_only_when_offset_moves() {
        let dir = TempDir::new().unwrap();
        let config = CollectorConfig {
            checkpoint_interval: Duration::from_millis(50),
            ..test_config(&dir)
        };
        std::fs::write(&config.log_file, "").unwrap();
        let store = CheckpointStore::open(&config.state_dir, config.node_id).unwrap();

        let run = start(config.clone()).await;
        let text = "unparsed one\nunparsed two\n";
        append(&config.log_file, text);
        wait_for(|| {
            store
                .load()
                .ok()
                .flatten()
                .is_some_and(|cp| cp.last_position == text.len() as u64)
        })
        .await;

        assert!(!run.collector.persist_checkpoint().await.unwrap());
        run.stop().await;
    }

    #[tokio::test]
    async fn test_read_errors_back_off() {
        let dir = TempDir::new().unwrap();
        let config = CollectorConfig {
            error_backoff: Duration::from_secs(1),
            ..test_config(&dir)
        };

        let run = start(config).await;
        wait_for(|| run.collector.stats().errors == 1).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // poll_interval is 10ms; only the backoff keeps this at one
        assert_eq!(run.collector.stats().errors, 1);
        assert!(run.collector.is_running());
        run.stop().await;
    }

    #[tokio::test]
    async fn test_unreadable_path_counts_errors_and_recovers() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);

        let run = start(config.clone()).await;
        std::fs::create_dir(&config.log_file).unwrap();
        std::fs::write(config.log_file.join("entry"), "x").unwrap();
        let before = run.collector.stats().errors;
        wait_for(|| run.collector.stats().errors >= before + 2).await;
        assert_eq!(run.collector.stats().lines_processed, 0);

        std::fs::remove_dir_all(&config.log_file).unwrap();
        append(&config.log_file, &line("back.com"));
        wait_for(|| run.collector.stats().lines_processed == 1).await;

        let (_, sink) = run.stop().await;
        assert_eq!(sink.records()[0].domain, "back.com");
    }

    #[tokio::test]
    async fn test_deleted_file_checkpoint_restarts_replacement_at_zero() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        std::fs::write(&config.log_file, "").unwrap();

        let run = start(config.clone()).await;
        append(&config.log_file, &line("old.com"));
        wait_for(|| run.collector.stats().lines_processed == 1).await;
        run.collector.flush().await.unwrap();

        std::fs::remove_file(&config.log_file).unwrap();
        wait_for(|| {
            let stats = run.collector.stats();
            stats.errors > 0 && stats.read_offset == 0
        })
        .await;
        run.stop().await;

        let store = CheckpointStore::open(&config.state_dir, config.node_id).unwrap();
        assert_eq!(store.load().unwrap().unwrap().last_position, 0);

        // Replacement grows past the old size before the agent comes back
        let replacement = format!("{}{}{}", line("new-1.com"), line("new-2.com"), line("new-3.com"));
        append(&config.log_file, &replacement);

        let run = start(config).await;
        wait_for(|| run.collector.stats().lines_processed == 3).await;
        let (_, sink) = run.stop().await;
        let domains: Vec<_> = sink.records().into_iter().map(|r| r.domain).collect();
        assert_eq!(domains, vec!["new-1.com", "new-2.com", "new-3.com"]);
    }

    #[tokio::test]
    async fn test_second_run_rejected_while_running() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let run = start(config).await;

        let err = run
            .collector
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
        run.stop().await;
    }
}
