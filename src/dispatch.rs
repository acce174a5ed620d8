//! Task dispatch and per-task execution
//!
//! The dispatcher drains the bounded intake queue and fans out one tokio
//! task per request; per-worker serialisation happens at pool acquisition,
//! not here. Each task acquires a worker, runs preprocess + invoke under
//! exponential backoff, reinitialises the worker in place on transport
//! failures, and delivers exactly one response on its single-shot channel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineResult};
use crate::imgproc::{self, ImageProcError, ThresholdMode};
use crate::pool::{ProcessorPool, Worker};
use crate::retry::{Backoff, BackoffPolicy};
use crate::stats::ServerStats;

/// One OCR request travelling from the HTTP front to a task handler.
///
/// Exactly one of `image_path` / `image_data` is set; the HTTP front
/// validates that before admission.
pub struct OcrTask {
    pub image_path: Option<PathBuf>,
    pub image_data: Option<Vec<u8>>,
    pub response: oneshot::Sender<OcrOutcome>,
}

/// In-band response body: recognition payload or an application-level
/// error string, never both.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OcrOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OcrOutcome {
    pub fn data(data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Failures inside one OCR attempt.
#[derive(Error, Debug)]
enum TaskError {
    #[error("failed to read image file: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Image(#[from] ImageProcError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("operation cancelled")]
    Cancelled,
}

/// Reads the intake queue and runs task handlers.
pub struct Dispatcher {
    pool: Arc<ProcessorPool>,
    stats: Arc<ServerStats>,
    threshold_mode: ThresholdMode,
    threshold_value: u8,
    backoff: BackoffPolicy,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ProcessorPool>,
        stats: Arc<ServerStats>,
        threshold_mode: ThresholdMode,
        threshold_value: u8,
        cancel: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            pool,
            stats,
            threshold_mode,
            threshold_value,
            backoff: BackoffPolicy::default(),
            cancel,
            tracker,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Dispatcher loop: one spawned handler per received task, until the
    /// root token cancels or the queue closes.
    pub async fn run(self: Arc<Self>, mut queue: mpsc::Receiver<OcrTask>) {
        info!("task dispatcher started");
        loop {
            tokio::select! {
                received = queue.recv() => match received {
                    Some(task) => {
                        let dispatcher = Arc::clone(&self);
                        self.tracker.spawn(async move { dispatcher.process(task).await });
                    }
                    None => break,
                },
                _ = self.cancel.cancelled() => break,
            }
        }
        info!("task dispatcher shutting down");
    }

    /// Handle one task end to end.
    pub async fn process(&self, task: OcrTask) {
        let started = Instant::now();

        let worker = match self.pool.acquire(&self.cancel).await {
            Some(worker) => worker,
            None => {
                info!("no processor available, server is shutting down");
                let _ = task.response.send(OcrOutcome::error("server shutting down"));
                self.stats.record(started.elapsed(), false);
                return;
            }
        };

        debug!(worker = worker.id(), "processing OCR task");
        let outcome = match self.perform_with_retry(&worker, &task).await {
            Ok(result) if result.is_success() => OcrOutcome::data(result.data),
            Ok(result) => {
                info!(code = result.code, msg = %result.msg, "OCR returned failure code");
                OcrOutcome::error(format!("ocr failed: {}", result.msg))
            }
            Err(e) => {
                warn!(worker = worker.id(), error = %e, "OCR task failed");
                OcrOutcome::error(format!("ocr failed: {}", e))
            }
        };

        let success = outcome.error.is_none();
        // The response channel is buffered; the handler never blocks here,
        // so the worker can be released immediately after.
        let _ = task.response.send(outcome);
        self.pool.release(&worker).await;
        self.stats.record(started.elapsed(), success);
    }

    /// Preprocess + invoke under backoff. The whole attempt repeats on
    /// failure: path inputs are re-read and re-binarized every round.
    async fn perform_with_retry(
        &self,
        worker: &Arc<Worker>,
        task: &OcrTask,
    ) -> Result<EngineResult, TaskError> {
        let mut backoff = Backoff::new(self.backoff.clone());
        loop {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let error = match self.attempt(worker, task).await {
                Ok(result) => return Ok(result),
                Err(e) => e,
            };

            match backoff.next_delay() {
                Some(delay) => {
                    debug!(
                        worker = worker.id(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "OCR attempt failed, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
                    }
                }
                None => return Err(error),
            }
        }
    }

    async fn attempt(&self, worker: &Arc<Worker>, task: &OcrTask) -> Result<EngineResult, TaskError> {
        let raw = if let Some(path) = &task.image_path {
            tokio::fs::read(path).await?
        } else if let Some(data) = &task.image_data {
            data.clone()
        } else {
            return Err(TaskError::Image(ImageProcError::UnsupportedFormat));
        };
        let processed = imgproc::binarize(&raw, self.threshold_mode, self.threshold_value)?;

        match worker.invoke(&processed).await {
            Ok(result) => Ok(result),
            Err(e) => {
                warn!(worker = worker.id(), error = %e, "OCR invocation failed, reinitializing worker");
                match self.pool.reinitialize(worker).await {
                    Ok(()) => info!(worker = worker.id(), "worker reinitialized"),
                    Err(init_err) => {
                        warn!(worker = worker.id(), error = %init_err, "failed to reinitialize worker")
                    }
                }
                Err(TaskError::Engine(e))
            }
        }
    }
}
