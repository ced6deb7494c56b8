//! Start/stop/restart lifecycle around a [`Collector`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, CollectorStats};
use crate::pipeline::RecordSink;
use crate::{Error, Result};

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

/// Owns the collector task and the sink it writes to.
pub struct AgentController {
    collector: Arc<Collector>,
    sink: Arc<dyn RecordSink>,
    task: Mutex<Option<RunningTask>>,
}

impl AgentController {
    pub fn new(collector: Arc<Collector>, sink: Arc<dyn RecordSink>) -> Self {
        Self {
            collector,
            sink,
            task: Mutex::new(None),
        }
    }

    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    pub fn stats(&self) -> CollectorStats {
        self.collector.stats()
    }

    /// Whether a collector task is alive.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Spawn the collector. Fails with [`Error::AlreadyRunning`] if it is up.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let collector = Arc::clone(&self.collector);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { collector.run(token).await });

        tracing::info!(
            path = %self.collector.config().log_file.display(),
            "Collector started"
        );
        *task = Some(RunningTask { cancel, handle });
        Ok(())
    }

    /// Cancel the collector and wait for its orderly shutdown.
    ///
    /// Fails with [`Error::NotRunning`] if there is nothing to stop.
    pub async fn stop(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        let Some(running) = task.take() else {
            return Err(Error::NotRunning);
        };

        running.cancel.cancel();
        match running.handle.await {
            Ok(result) => result?,
            Err(e) => tracing::error!(error = %e, "Collector task aborted"),
        }
        Ok(())
    }

    /// Stop if running, then start.
    pub async fn restart(&self) -> Result<()> {
        match self.stop().await {
            Ok(()) | Err(Error::NotRunning) => {}
            Err(e) => return Err(e),
        }
        self.start().await
    }

    /// Sink reachability.
    pub async fn sink_health(&self) -> Result<()> {
        self.sink.health_check().await
    }
}
