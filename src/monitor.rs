//! Pool monitor
//!
//! One long-lived task that keeps the pool healthy: every tick it demotes
//! and trims cold workers, tops the warm spares back up, and probes every
//! subprocess, in that order.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::pool::ProcessorPool;

const MONITOR_PERIOD: Duration = Duration::from_secs(30);

pub struct Monitor {
    pool: Arc<ProcessorPool>,
    host_cpus: usize,
    cancel: CancellationToken,
}

impl Monitor {
    pub fn new(pool: Arc<ProcessorPool>, host_cpus: usize, cancel: CancellationToken) -> Self {
        Self {
            pool,
            host_cpus,
            cancel,
        }
    }

    pub async fn run(self) {
        info!("processor monitor started");
        let mut ticker = tokio::time::interval(MONITOR_PERIOD);
        // The first tick of an interval completes immediately; the pool was
        // just initialized, so skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.run_checks().await,
                _ = self.cancel.cancelled() => {
                    info!("processor monitor shutting down");
                    return;
                }
            }
        }
    }

    /// One monitor tick: scale down, pre-warm, health check.
    pub async fn run_checks(&self) {
        debug!("running periodic processor checks");
        self.pool.scale_down(self.host_cpus).await;
        self.pool.prewarm().await;
        self.pool.health_check().await;
    }
}
