use portable_atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events an [`ExpirationCache`] reports to its [`CacheMetrics`] sink.
///
/// [`ExpirationCache`]: crate::ExpirationCache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheAction {
    /// A slice was requested, whether or not it was served from the cache.
    Retrieval,
    /// A requested slice had to be read from the backing store.
    Miss,
    /// A key was invalidated by a write.
    Invalidation,
    /// A cached slice was dropped to stay within the byte budget.
    Eviction,
}

/// Receives cache activity counts.
pub trait CacheMetrics: Send + Sync {
    fn record(&self, action: CacheAction, count: u64);
}

impl<M: CacheMetrics + ?Sized> CacheMetrics for Arc<M> {
    fn record(&self, action: CacheAction, count: u64) {
        (**self).record(action, count);
    }
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl CacheMetrics for NoopMetrics {
    fn record(&self, _action: CacheAction, _count: u64) {}
}

/// Lock-free counters for every [`CacheAction`].
///
/// Share one instance between the cache and the reader by wrapping it in an
/// [`Arc`].
#[derive(Debug, Default)]
pub struct CounterMetrics {
    retrievals: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time copy of a [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
    pub retrievals: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub evictions: u64,
}

impl CacheMetricsSnapshot {
    /// Fraction of retrievals served from the cache, `0.0` when idle.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        if self.retrievals == 0 {
            return 0.0;
        }
        self.retrievals.saturating_sub(self.misses) as f64 / self.retrievals as f64
    }
}

impl CounterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    const fn counter(&self, action: CacheAction) -> &AtomicU64 {
        match action {
            CacheAction::Retrieval => &self.retrievals,
            CacheAction::Miss => &self.misses,
            CacheAction::Invalidation => &self.invalidations,
            CacheAction::Eviction => &self.evictions,
        }
    }

    pub fn get(&self, action: CacheAction) -> u64 {
        self.counter(action).load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            retrievals: self.get(CacheAction::Retrieval),
            misses: self.get(CacheAction::Miss),
            invalidations: self.get(CacheAction::Invalidation),
            evictions: self.get(CacheAction::Eviction),
        }
    }

    /// Zeroes every counter and returns the values they held.
    pub fn reset(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            retrievals: self.retrievals.swap(0, Ordering::Relaxed),
            misses: self.misses.swap(0, Ordering::Relaxed),
            invalidations: self.invalidations.swap(0, Ordering::Relaxed),
            evictions: self.evictions.swap(0, Ordering::Relaxed),
        }
    }
}

impl CacheMetrics for CounterMetrics {
    fn record(&self, action: CacheAction, count: u64) {
        self.counter(action).fetch_add(count, Ordering::Relaxed);
    }
}
