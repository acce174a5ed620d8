//! Application state shared across request handlers

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::dispatch::OcrTask;
use crate::stats::ServerStats;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    stats: Arc<ServerStats>,
    task_tx: mpsc::Sender<OcrTask>,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        stats: Arc<ServerStats>,
        task_tx: mpsc::Sender<OcrTask>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                stats,
                task_tx,
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn stats(&self) -> &ServerStats {
        &self.inner.stats
    }

    pub fn task_sender(&self) -> &mpsc::Sender<OcrTask> {
        &self.inner.task_tx
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }
}
