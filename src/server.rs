//! Server lifecycle
//!
//! Wires the pool, dispatcher, monitor and HTTP front together, and owns
//! the shutdown sequence: a signal cancels the root token, the listener
//! stops accepting, in-flight task handlers get a bounded drain window,
//! and every worker is closed unconditionally at the end.

use std::future::IntoFuture;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::{host_cpu_count, Config};
use crate::dispatch::Dispatcher;
use crate::engine::{EngineError, EngineFactory};
use crate::monitor::Monitor;
use crate::pool::{PoolConfig, ProcessorPool};
use crate::routes;
use crate::state::AppState;
use crate::stats::ServerStats;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("http server error: {0}")]
    Serve(#[from] std::io::Error),
}

pub struct Server {
    config: Config,
    pool: Arc<ProcessorPool>,
    stats: Arc<ServerStats>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: Config, factory: Arc<dyn EngineFactory>) -> Self {
        let pool = Arc::new(ProcessorPool::new(PoolConfig::from(&config), factory));
        Self {
            config,
            pool,
            stats: Arc::new(ServerStats::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Create the resident worker set. Fatal when the minimum cannot be
    /// brought up; pre-warm failures are logged inside the pool.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        info!("initializing OCR processors");
        self.pool.initialize().await
    }

    /// Root token; cancelling it starts a graceful shutdown.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pool(&self) -> &Arc<ProcessorPool> {
        &self.pool
    }

    pub fn stats(&self) -> &Arc<ServerStats> {
        &self.stats
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.bind_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|source| {
            error!(addr = %addr, error = %source, "failed to bind HTTP listener");
            ServerError::Bind { addr, source }
        })?;

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("received shutdown signal, starting graceful shutdown");
            cancel.cancel();
        });

        self.serve(listener).await
    }

    /// Serve on an already-bound listener. Split from [`run`] so tests can
    /// drive the full lifecycle on an ephemeral port.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let (task_tx, task_rx) = mpsc::channel(self.config.queue_size.max(1));
        let state = AppState::new(
            self.config.clone(),
            Arc::clone(&self.stats),
            task_tx,
            self.cancel.clone(),
        );
        let app = routes::router(state);

        let tracker = TaskTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.stats),
            self.config.threshold_mode(),
            self.config.threshold_value,
            self.cancel.clone(),
            tracker.clone(),
        ));
        tokio::spawn(dispatcher.run(task_rx));

        let monitor = Monitor::new(
            Arc::clone(&self.pool),
            host_cpu_count(),
            self.cancel.clone(),
        );
        tokio::spawn(monitor.run());

        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "OCR server listening");
        }

        let shutdown = self.cancel.clone();
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .into_future();

        // The graceful path waits for open connections; past the deadline
        // the listener is abandoned with whatever is still open.
        let deadline = self.cancel.clone();
        let shutdown_timeout = self.config.shutdown_timeout();
        tokio::select! {
            served = serve => served?,
            _ = async {
                deadline.cancelled().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                warn!("shutdown deadline exceeded, abandoning open connections");
            }
        }

        self.drain(tracker).await;
        Ok(())
    }

    /// Wait out in-flight task handlers, then close every worker.
    async fn drain(&self, tracker: TaskTracker) {
        tracker.close();
        let timeout = self.config.shutdown_timeout();
        match tokio::time::timeout(timeout, tracker.wait()).await {
            Ok(()) => info!("all task handlers exited"),
            Err(_) => warn!(
                timeout_secs = timeout.as_secs(),
                "timed out waiting for task handlers, closing workers anyway"
            ),
        }
        self.pool.drain_and_close().await;
        info!("server stopped");
    }
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
