//! Worker handle
//!
//! One live OCR subprocess plus its usage metadata. The handle is shared as
//! `Arc<Worker>`; the engine sits behind an async mutex that doubles as the
//! exclusive I/O lock and as the swap cell for in-place reinitialisation:
//! replacing the boxed engine under the lock leaves every `Arc` holder
//! looking at a live worker.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, MutexGuard};

use crate::engine::{EngineError, EngineResult, OcrEngine};

pub struct Worker {
    id: u64,
    engine: Mutex<Box<dyn OcrEngine>>,
    usage: AtomicI64,
    last_used: parking_lot::Mutex<Instant>,
    in_use: AtomicBool,
}

impl Worker {
    pub fn new(id: u64, engine: Box<dyn OcrEngine>) -> Self {
        Self {
            id,
            engine: Mutex::new(engine),
            usage: AtomicI64::new(0),
            last_used: parking_lot::Mutex::new(Instant::now()),
            in_use: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Run one recognition. Serialised by the engine lock; the in-flight
    /// counter brackets the wait for the lock as well as the call itself.
    pub async fn invoke(&self, image: &[u8]) -> Result<EngineResult, EngineError> {
        self.usage.fetch_add(1, Ordering::SeqCst);
        let result = {
            let mut engine = self.engine.lock().await;
            engine.ocr(image).await
        };
        self.touch();
        self.usage.fetch_sub(1, Ordering::SeqCst);
        result
    }

    /// Terminate the subprocess behind the handle.
    pub async fn close(&self) {
        self.engine.lock().await.shutdown().await;
    }

    /// Exclusive access to the engine cell, for health probes and
    /// in-place reinitialisation.
    pub(crate) async fn engine_lock(&self) -> MutexGuard<'_, Box<dyn OcrEngine>> {
        self.engine.lock().await
    }

    pub fn usage(&self) -> i64 {
        self.usage.load(Ordering::SeqCst)
    }

    /// Stamp the handle as just used.
    pub fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }

    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::SeqCst)
    }

    /// Only the pool flips this, and only under the pool lock.
    pub(crate) fn set_in_use(&self, value: bool) {
        self.in_use.store(value, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("usage", &self.usage())
            .field("in_use", &self.in_use())
            .finish()
    }
}
