//! Worker pool
//!
//! Two ordered lists of worker handles share one async pool lock: `active`
//! holds workers owned by a task or reserved as the minimum resident set,
//! `idle` holds warm spares. Acquisition prefers the most recently parked
//! idle worker, creates lazily up to the ceiling, and otherwise waits on a
//! [`Notify`] that release and every pool-size reduction signal.
//!
//! The pool lock is an async mutex so the health check may deliberately
//! hold it across probe I/O: probes are infrequent and small, and holding
//! the lock serialises the monitor against acquire/release.
//!
//! The lock is never held during task-side subprocess I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::engine::{EngineError, EngineFactory};

pub mod worker;

pub use worker::Worker;

/// Probe payload for health checks. A liveness poke, not a real image: a
/// healthy worker answers it (with a failure code), a wedged one does not.
const HEALTH_PROBE: &[u8] = b"Hello World";

/// Sizing and demotion policy, extracted from [`Config`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_processors: usize,
    pub max_processors: usize,
    pub warm_up_count: usize,
    pub degrade_threshold: i64,
    pub idle_timeout: Duration,
}

impl From<&Config> for PoolConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            min_processors: cfg.min_processors,
            max_processors: cfg.max_processors,
            warm_up_count: cfg.warm_up_count,
            degrade_threshold: cfg.degrade_threshold,
            idle_timeout: cfg.idle_timeout(),
        }
    }
}

#[derive(Default)]
struct PoolInner {
    active: Vec<Arc<Worker>>,
    idle: Vec<Arc<Worker>>,
}

pub struct ProcessorPool {
    inner: Mutex<PoolInner>,
    available: Notify,
    factory: Arc<dyn EngineFactory>,
    cfg: PoolConfig,
    next_id: AtomicU64,
}

impl ProcessorPool {
    pub fn new(cfg: PoolConfig, factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            available: Notify::new(),
            factory,
            cfg,
            next_id: AtomicU64::new(0),
        }
    }

    async fn create_worker(&self) -> Result<Arc<Worker>, EngineError> {
        let engine = self.factory.create().await?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Worker::new(id, engine)))
    }

    /// Create the minimum resident set plus the warm spares.
    ///
    /// Failure to create any of the first `min_processors` workers is fatal;
    /// pre-warm failures are logged and skipped.
    pub async fn initialize(&self) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().await;

        for i in 0..self.cfg.min_processors {
            let worker = self.create_worker().await.map_err(|e| {
                error!(index = i, error = %e, "failed to initialize processor");
                e
            })?;
            debug!(worker = worker.id(), "processor initialized");
            inner.active.push(worker);
        }

        for i in 0..self.cfg.warm_up_count {
            match self.create_worker().await {
                Ok(worker) => {
                    debug!(worker = worker.id(), "pre-warmed processor created");
                    inner.idle.push(worker);
                }
                Err(e) => warn!(index = i, error = %e, "failed to pre-warm processor"),
            }
        }

        info!(
            active = inner.active.len(),
            idle = inner.idle.len(),
            "processor pool initialized"
        );
        Ok(())
    }

    /// Acquire a worker for exclusive task use.
    ///
    /// Pops the most recently parked idle worker (warm first), else creates
    /// one while below the ceiling, else waits until release or shutdown.
    /// Returns `None` only when `cancel` fires, which tasks report as the
    /// server shutting down.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Option<Arc<Worker>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }

            // Register interest before releasing the lock so a release
            // landing in between still wakes this waiter.
            let notified = self.available.notified();

            {
                let mut inner = self.inner.lock().await;

                if let Some(worker) = inner.idle.pop() {
                    worker.set_in_use(true);
                    inner.active.push(Arc::clone(&worker));
                    return Some(worker);
                }

                if inner.active.len() < self.cfg.max_processors {
                    match self.create_worker().await {
                        Ok(worker) => {
                            worker.set_in_use(true);
                            inner.active.push(Arc::clone(&worker));
                            debug!(
                                worker = worker.id(),
                                active = inner.active.len(),
                                "created processor on demand"
                            );
                            return Some(worker);
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to create processor on demand");
                        }
                    }
                }
            }

            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Return a worker after task use. Demotes it to the idle list while
    /// the active set is above the floor, and wakes one waiter either way.
    pub async fn release(&self, worker: &Arc<Worker>) {
        {
            let mut inner = self.inner.lock().await;
            worker.set_in_use(false);
            worker.touch();

            if inner.active.len() > self.cfg.min_processors {
                if let Some(pos) = inner.active.iter().position(|w| Arc::ptr_eq(w, worker)) {
                    let demoted = inner.active.remove(pos);
                    inner.idle.push(demoted);
                }
            }
        }
        self.available.notify_one();
    }

    /// Replace the subprocess behind `worker` while keeping the handle.
    ///
    /// On creation failure the dead engine stays in place; the next attempt
    /// or health tick tries again.
    pub async fn reinitialize(&self, worker: &Worker) -> Result<(), EngineError> {
        let mut engine = worker.engine_lock().await;
        engine.shutdown().await;
        let replacement = self.factory.create().await?;
        *engine = replacement;
        Ok(())
    }

    /// Demote cold active workers and close surplus idle ones.
    ///
    /// A worker is demotable when its in-flight count is at most the
    /// degrade threshold and it has idled past the timeout; demotion never
    /// drops the active set below the floor. The idle list is then trimmed
    /// to `host_cpus - |active|`.
    pub async fn scale_down(&self, host_cpus: usize) {
        let mut reduced = false;
        {
            let mut inner = self.inner.lock().await;

            let mut i = inner.active.len();
            while i > self.cfg.min_processors {
                i -= 1;
                let worker = &inner.active[i];
                if worker.usage() <= self.cfg.degrade_threshold
                    && worker.idle_for() > self.cfg.idle_timeout
                {
                    let demoted = inner.active.remove(i);
                    demoted.set_in_use(false);
                    info!(
                        worker = demoted.id(),
                        active = inner.active.len(),
                        idle = inner.idle.len() + 1,
                        "processor demoted to idle pool"
                    );
                    inner.idle.push(demoted);
                    reduced = true;
                }
            }

            let max_idle = host_cpus.saturating_sub(inner.active.len());
            while inner.idle.len() > max_idle {
                let Some(surplus) = inner.idle.pop() else { break };
                surplus.close().await;
                reduced = true;
                info!(
                    worker = surplus.id(),
                    idle = inner.idle.len(),
                    "closed surplus idle processor"
                );
            }
        }
        if reduced {
            self.available.notify_waiters();
        }
    }

    /// Top the idle list back up to the warm-up target.
    pub async fn prewarm(&self) {
        let mut inner = self.inner.lock().await;
        let target = self.cfg.warm_up_count.saturating_sub(inner.idle.len());
        for _ in 0..target {
            match self.create_worker().await {
                Ok(worker) => {
                    debug!(
                        worker = worker.id(),
                        idle = inner.idle.len() + 1,
                        "pre-warmed processor created"
                    );
                    inner.idle.push(worker);
                }
                Err(e) => error!(error = %e, "failed to pre-warm processor"),
            }
        }
    }

    /// Probe every worker and reinitialise the ones that fail.
    ///
    /// Holds the pool lock for the whole walk on purpose: the monitor is
    /// serialised against acquire/release at the cost of a brief dispatch
    /// pause, bounded by the tiny probe payload.
    pub async fn health_check(&self) {
        let inner = self.inner.lock().await;
        debug!(
            active = inner.active.len(),
            idle = inner.idle.len(),
            "running processor health check"
        );

        for worker in inner.active.iter().chain(inner.idle.iter()) {
            let mut engine = worker.engine_lock().await;
            match engine.ocr(HEALTH_PROBE).await {
                Ok(_) => debug!(worker = worker.id(), "processor passed health check"),
                Err(e) => {
                    warn!(worker = worker.id(), error = %e, "processor failed health check");
                    engine.shutdown().await;
                    match self.factory.create().await {
                        Ok(replacement) => {
                            *engine = replacement;
                            info!(worker = worker.id(), "processor reinitialized");
                        }
                        Err(err) => {
                            // Leave the entry as-is; the next tick retries.
                            error!(worker = worker.id(), error = %err, "failed to reinitialize processor");
                        }
                    }
                }
            }
        }
    }

    /// Close every worker and clear both lists. Used at shutdown, after the
    /// task drain deadline has passed.
    pub async fn drain_and_close(&self) {
        {
            let mut inner = self.inner.lock().await;
            info!(
                active = inner.active.len(),
                idle = inner.idle.len(),
                "closing all processors"
            );
            for worker in inner.active.drain(..) {
                worker.close().await;
            }
            for worker in inner.idle.drain(..) {
                worker.close().await;
            }
        }
        self.available.notify_waiters();
    }

    /// Current `(active, idle)` list sizes.
    pub async fn counts(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.active.len(), inner.idle.len())
    }

    /// True when every idle worker is marked free. Exposed for tests that
    /// verify the pool invariants under load.
    pub async fn idle_invariant_holds(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.idle.iter().all(|w| !w.in_use())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::MockFactory;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::time::Duration;

    fn pool_config(min: usize, max: usize, warm_up: usize) -> PoolConfig {
        PoolConfig {
            min_processors: min,
            max_processors: max,
            warm_up_count: warm_up,
            degrade_threshold: 0,
            idle_timeout: Duration::from_millis(50),
        }
    }

    fn make_pool(cfg: PoolConfig) -> (Arc<ProcessorPool>, Arc<crate::engine::testing::MockBehavior>) {
        let factory = MockFactory::new();
        let behavior = Arc::clone(&factory.behavior);
        (Arc::new(ProcessorPool::new(cfg, Arc::new(factory))), behavior)
    }

    #[tokio::test]
    async fn cold_start_creates_min_active_and_warm_idle() {
        let (pool, behavior) = make_pool(pool_config(2, 4, 1));
        pool.initialize().await.unwrap();

        assert_eq!(pool.counts().await, (2, 1));
        assert_eq!(behavior.created.load(AtomicOrdering::SeqCst), 3);
        assert!(pool.idle_invariant_holds().await);
    }

    #[tokio::test]
    async fn initialize_fails_when_min_cannot_be_created() {
        let (pool, behavior) = make_pool(pool_config(2, 4, 0));
        behavior.create_failures.store(1, AtomicOrdering::SeqCst);
        assert!(pool.initialize().await.is_err());
    }

    #[tokio::test]
    async fn initialize_tolerates_prewarm_failures() {
        // No resident minimum, so the scripted failure hits a pre-warm
        // creation: it is logged and skipped, not fatal.
        let (pool, behavior) = make_pool(pool_config(0, 4, 2));
        behavior.create_failures.store(1, AtomicOrdering::SeqCst);
        pool.initialize().await.unwrap();
        assert_eq!(pool.counts().await, (0, 1));
    }

    #[tokio::test]
    async fn acquire_prefers_warm_workers_lifo() {
        let (pool, behavior) = make_pool(pool_config(0, 4, 2));
        pool.initialize().await.unwrap();
        assert_eq!(pool.counts().await, (0, 2));

        let created_before = behavior.created.load(AtomicOrdering::SeqCst);
        let cancel = CancellationToken::new();
        let worker = pool.acquire(&cancel).await.unwrap();

        // Served from the idle list, no new engine spawned.
        assert_eq!(behavior.created.load(AtomicOrdering::SeqCst), created_before);
        assert!(worker.in_use());
        // The most recently parked spare (highest id) comes back first.
        assert_eq!(worker.id(), 1);
        assert_eq!(pool.counts().await, (1, 1));
    }

    #[tokio::test]
    async fn acquire_scales_up_to_the_ceiling_then_waits() {
        let (pool, _) = make_pool(pool_config(0, 2, 0));
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let first = pool.acquire(&cancel).await.unwrap();
        let second = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.counts().await, (2, 0));

        // The pool is saturated: a third acquire must block until a release.
        let pool2 = Arc::clone(&pool);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&cancel2).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished(), "acquire should wait at the ceiling");

        pool.release(&first).await;
        let third = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken by release")
            .unwrap()
            .unwrap();
        assert!(third.in_use());

        pool.release(&second).await;
        pool.release(&third).await;
    }

    #[tokio::test]
    async fn saturation_burst_reaches_max_and_uses_fresh_workers() {
        let (pool, behavior) = make_pool(pool_config(2, 4, 0));
        behavior.delay_ms.store(200, AtomicOrdering::SeqCst);
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let worker = pool.acquire(&cancel).await.unwrap();
                let result = worker.invoke(b"burst").await;
                pool.release(&worker).await;
                (worker.id(), result)
            }));
        }

        // The active set must hit the ceiling while the burst is in flight.
        let mut peak = 0;
        for _ in 0..100 {
            let (active, _) = pool.counts().await;
            peak = peak.max(active);
            if peak == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(peak, 4, "burst never saturated the pool");

        let mut served_by_new = false;
        for task in tasks {
            let (worker_id, result) = task.await.unwrap();
            assert!(result.is_ok());
            // Ids 0 and 1 are the resident minimum; anything above was
            // created on demand for the burst.
            served_by_new |= worker_id >= 2;
        }
        assert!(served_by_new, "burst should be served by a fresh worker");
        assert_eq!(behavior.created.load(AtomicOrdering::SeqCst), 4);
    }

    #[tokio::test]
    async fn cancelled_acquire_returns_none() {
        let (pool, _) = make_pool(pool_config(0, 1, 0));
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let held = pool.acquire(&cancel).await.unwrap();

        let pool2 = Arc::clone(&pool);
        let cancel2 = cancel.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&cancel2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("woken by cancellation")
            .unwrap();
        assert!(result.is_none());

        drop(held);
    }

    #[tokio::test]
    async fn release_above_the_floor_demotes_to_idle() {
        let (pool, _) = make_pool(pool_config(1, 4, 0));
        pool.initialize().await.unwrap();
        assert_eq!(pool.counts().await, (1, 0));

        // Both acquires create fresh workers; the resident minimum is
        // reserved, not dispensed.
        let cancel = CancellationToken::new();
        let first = pool.acquire(&cancel).await.unwrap();
        let second = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.counts().await, (3, 0));

        pool.release(&second).await;
        assert_eq!(pool.counts().await, (2, 1));
        assert!(!second.in_use());
        assert!(pool.idle_invariant_holds().await);

        pool.release(&first).await;
        assert_eq!(pool.counts().await, (1, 2));
    }

    #[tokio::test]
    async fn scale_down_demotes_cold_workers_and_trims_idle() {
        let (pool, behavior) = make_pool(pool_config(2, 6, 0));
        pool.initialize().await.unwrap();

        // Drive five concurrent acquisitions to grow the active set.
        let cancel = CancellationToken::new();
        let mut workers = Vec::new();
        for _ in 0..5 {
            workers.push(pool.acquire(&cancel).await.unwrap());
        }
        assert_eq!(pool.counts().await.0, 5);
        for worker in &workers {
            pool.release(worker).await;
        }
        // Releases above the floor already demoted three workers.
        assert_eq!(pool.counts().await, (2, 3));

        // Everything now idles past the timeout; a scale-down with no idle
        // budget demotes nothing further and closes all spares.
        tokio::time::sleep(Duration::from_millis(80)).await;
        pool.scale_down(2).await;

        assert_eq!(pool.counts().await, (2, 0));
        assert_eq!(behavior.closed.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn scale_down_respects_idle_budget() {
        let (pool, behavior) = make_pool(pool_config(1, 6, 3));
        pool.initialize().await.unwrap();
        assert_eq!(pool.counts().await, (1, 3));

        tokio::time::sleep(Duration::from_millis(80)).await;
        // Budget: 3 host CPUs minus 1 active leaves room for 2 idle.
        pool.scale_down(3).await;
        assert_eq!(pool.counts().await, (1, 2));
        assert_eq!(behavior.closed.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scale_down_never_drops_below_the_floor() {
        let (pool, _) = make_pool(pool_config(2, 4, 0));
        pool.initialize().await.unwrap();

        // Grow the active set, then let everything go cold.
        let cancel = CancellationToken::new();
        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.counts().await.0, 4);
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Generous idle budget: demotion stops exactly at the floor.
        pool.scale_down(16).await;
        assert_eq!(pool.counts().await, (2, 2));

        drop(a);
        drop(b);
    }

    #[tokio::test]
    async fn prewarm_tops_idle_back_up_and_tolerates_failures() {
        let (pool, behavior) = make_pool(pool_config(1, 4, 2));
        pool.initialize().await.unwrap();
        assert_eq!(pool.counts().await, (1, 2));

        // Empty the idle list.
        let cancel = CancellationToken::new();
        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        assert_eq!(pool.counts().await.1, 0);

        // One of the two replacement creations fails; prewarm keeps going.
        behavior.create_failures.store(1, AtomicOrdering::SeqCst);
        pool.prewarm().await;
        assert_eq!(pool.counts().await.1, 1);

        pool.release(&a).await;
        pool.release(&b).await;
    }

    #[tokio::test]
    async fn health_check_reinitialises_failed_workers_in_place() {
        let (pool, behavior) = make_pool(pool_config(2, 4, 1));
        pool.initialize().await.unwrap();
        let created_before = behavior.created.load(AtomicOrdering::SeqCst);

        // All three probes fail at the transport level.
        behavior.transport_failures.store(3, AtomicOrdering::SeqCst);
        pool.health_check().await;

        // Each failed worker was shut down and replaced behind its handle;
        // the lists themselves did not change.
        assert_eq!(behavior.closed.load(AtomicOrdering::SeqCst), 3);
        assert_eq!(
            behavior.created.load(AtomicOrdering::SeqCst),
            created_before + 3
        );
        assert_eq!(pool.counts().await, (2, 1));

        // The replacements answer probes again.
        pool.health_check().await;
        assert_eq!(behavior.closed.load(AtomicOrdering::SeqCst), 3);
    }

    #[tokio::test]
    async fn health_check_leaves_worker_in_place_when_reinit_fails() {
        let (pool, behavior) = make_pool(pool_config(1, 4, 0));
        pool.initialize().await.unwrap();

        behavior.transport_failures.store(1, AtomicOrdering::SeqCst);
        behavior.create_failures.store(1, AtomicOrdering::SeqCst);
        pool.health_check().await;

        // Worker stayed in the list despite the failed replacement.
        assert_eq!(pool.counts().await, (1, 0));
    }

    #[tokio::test]
    async fn reinitialize_swaps_the_engine_behind_the_handle() {
        let (pool, behavior) = make_pool(pool_config(1, 4, 0));
        pool.initialize().await.unwrap();

        let cancel = CancellationToken::new();
        let worker = pool.acquire(&cancel).await.unwrap();
        let created_before = behavior.created.load(AtomicOrdering::SeqCst);

        pool.reinitialize(&worker).await.unwrap();
        assert_eq!(behavior.closed.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(
            behavior.created.load(AtomicOrdering::SeqCst),
            created_before + 1
        );

        // The same handle keeps working against the fresh engine.
        assert!(worker.invoke(b"img").await.unwrap().is_success());
        pool.release(&worker).await;
    }

    #[tokio::test]
    async fn drain_closes_everything_and_clears_both_lists() {
        let (pool, behavior) = make_pool(pool_config(2, 4, 2));
        pool.initialize().await.unwrap();

        pool.drain_and_close().await;
        assert_eq!(pool.counts().await, (0, 0));
        assert_eq!(behavior.closed.load(AtomicOrdering::SeqCst), 4);
    }
}
