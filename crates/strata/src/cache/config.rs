use core::time::Duration;

use crate::error::{Error, Result};

/// Pending-invalidation reads (and sampled invalidations) that wake the
/// cleanup worker ahead of its interval.
pub const PENALTY_THRESHOLD: u32 = 5;

/// Tunables for an [`ExpirationCache`].
///
/// [`ExpirationCache`]: crate::ExpirationCache
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ExpirationCacheConfig {
    /// How long a fetched slice may be served from the cache.
    #[cfg_attr(feature = "serde", serde(with = "crate::id::millis"))]
    pub expiration: Duration,
    /// After a key is invalidated, reads of it bypass the cache for this long
    /// and their results are not cached.
    #[cfg_attr(feature = "serde", serde(with = "crate::id::millis"))]
    pub grace_wait: Duration,
    /// Total weight budget, split evenly across shards.
    pub max_bytes: u64,
    /// Number of independently locked shards.
    pub shards: usize,
    /// Upper bound between two cleanup passes.
    #[cfg_attr(feature = "serde", serde(with = "crate::id::millis"))]
    pub cleanup_interval: Duration,
    pub penalty_threshold: u32,
}

impl Default for ExpirationCacheConfig {
    fn default() -> Self {
        Self {
            expiration: Duration::from_millis(10_000),
            grace_wait: Duration::from_millis(50),
            max_bytes: 64 * 1024 * 1024,
            shards: num_cpus::get().next_power_of_two(),
            cleanup_interval: Duration::from_secs(1),
            penalty_threshold: PENALTY_THRESHOLD,
        }
    }
}

impl ExpirationCacheConfig {
    #[must_use]
    pub const fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }

    #[must_use]
    pub const fn with_grace_wait(mut self, grace_wait: Duration) -> Self {
        self.grace_wait = grace_wait;
        self
    }

    #[must_use]
    pub const fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    #[must_use]
    pub const fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }

    #[must_use]
    pub const fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_penalty_threshold(mut self, threshold: u32) -> Self {
        self.penalty_threshold = threshold;
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.expiration.is_zero() {
            return Err(Error::config("expiration must be positive"));
        }
        if self.shards == 0 {
            return Err(Error::config("shards must be positive"));
        }
        if self.max_bytes < self.shards as u64 {
            return Err(Error::config(format!(
                "max_bytes ({}) must be at least the shard count ({})",
                self.max_bytes, self.shards
            )));
        }
        if self.cleanup_interval.is_zero() {
            return Err(Error::config("cleanup_interval must be positive"));
        }
        if self.penalty_threshold == 0 {
            return Err(Error::config("penalty_threshold must be positive"));
        }
        Ok(())
    }

    pub(crate) fn shard_budget(&self) -> u64 {
        self.max_bytes / self.shards as u64
    }
}
