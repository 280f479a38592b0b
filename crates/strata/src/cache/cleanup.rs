use core::time::Duration;
use parking_lot::{Condvar, Mutex};
use portable_atomic::{AtomicU32, Ordering};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::error::{BackendError, Result};

/// Wakes the cleanup worker early once enough reads were forced past the
/// cache, and tells it to stop.
#[derive(Debug)]
pub(crate) struct CleanupSignal {
    penalties: AtomicU32,
    threshold: u32,
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl CleanupSignal {
    pub(crate) fn new(threshold: u32) -> Self {
        Self {
            penalties: AtomicU32::new(0),
            threshold,
            stopped: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn penalize(&self) {
        if self.penalties.fetch_add(1, Ordering::AcqRel) + 1 == self.threshold {
            let _guard = self.stopped.lock();
            self.cond.notify_one();
        }
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.cond.notify_all();
    }

    /// Blocks until the interval elapses or the penalty threshold is
    /// reached. Returns `false` once stopped.
    fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped && self.penalties.load(Ordering::Acquire) < self.threshold {
            self.cond.wait_for(&mut stopped, interval);
        }
        self.penalties.store(0, Ordering::Release);
        !*stopped
    }
}

/// Background thread running periodic cleanup passes.
#[derive(Debug)]
pub(crate) struct CleanupWorker {
    signal: Arc<CleanupSignal>,
    handle: JoinHandle<()>,
}

impl CleanupWorker {
    pub(crate) fn spawn<F>(signal: Arc<CleanupSignal>, interval: Duration, mut pass: F) -> Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let waiter = Arc::clone(&signal);
        let handle = thread::Builder::new()
            .name("strata-cache-cleanup".into())
            .spawn(move || {
                while waiter.wait(interval) {
                    pass();
                }
                #[cfg(feature = "tracing")]
                tracing::debug!("Cache cleanup worker stopped");
            })
            .map_err(|e| BackendError::with_source("failed to spawn cache cleanup worker", e))?;
        Ok(Self { signal, handle })
    }

    pub(crate) fn stop(self) {
        self.signal.stop();
        if self.handle.join().is_err() {
            #[cfg(feature = "tracing")]
            tracing::error!("Cache cleanup worker panicked");
        }
    }
}
