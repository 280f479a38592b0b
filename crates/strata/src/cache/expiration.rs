use bytes::Bytes;
use parking_lot::Mutex;
use portable_atomic::{AtomicBool, Ordering};
use std::{
    collections::{HashMap, HashSet},
    hash::{BuildHasher, RandomState},
    sync::Arc,
};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    cache::{
        CacheAction, CacheMetrics, ExpirationCacheConfig, NoopMetrics,
        cleanup::{CleanupSignal, CleanupWorker},
        shard::{Lookup, Purged, Shard},
    },
    error::Result,
    store::{Entry, EntryList, KeyColumnValueStore, KeySliceQuery, SliceQuery},
    time::{TimeSource, as_millis},
};

/// Invalidations count toward waking the cleanup worker with probability
/// `1 / INVALIDATE_PENALTY_ODDS`.
const INVALIDATE_PENALTY_ODDS: u32 = 1_000;

#[cfg(feature = "cache-padded")]
type ShardCell = crossbeam_utils::CachePadded<Mutex<Shard>>;
#[cfg(not(feature = "cache-padded"))]
type ShardCell = Mutex<Shard>;

fn shard_cell(shard: Shard) -> ShardCell {
    #[cfg(feature = "cache-padded")]
    return crossbeam_utils::CachePadded::new(Mutex::new(shard));
    #[cfg(not(feature = "cache-padded"))]
    Mutex::new(shard)
}

/// State shared between the cache and its cleanup worker.
struct CacheCore<T, M> {
    shards: Box<[ShardCell]>,
    hasher: RandomState,
    time: T,
    metrics: M,
    signal: Arc<CleanupSignal>,
    expiration: u64,
    grace: u64,
}

impl<T: TimeSource, M: CacheMetrics> CacheCore<T, M> {
    fn shard(&self, key: &Bytes) -> &ShardCell {
        #[allow(clippy::cast_possible_truncation)]
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    fn lookup(&self, query: &KeySliceQuery, now: u64) -> Lookup {
        let lookup = self
            .shard(query.key())
            .lock()
            .lookup(query, now, self.expiration, self.grace);
        if matches!(lookup, Lookup::Bypass) {
            self.signal.penalize();
        }
        lookup
    }

    fn offer(&self, query: KeySliceQuery, entries: EntryList, valid_since: u64, epoch: u64) {
        let inserted = self
            .shard(query.key())
            .lock()
            .insert(query, entries, valid_since, epoch);
        if inserted.evicted > 0 {
            self.metrics.record(CacheAction::Eviction, inserted.evicted);
        }
    }

    fn cleanup_pass(&self) -> Purged {
        let now = self.time.current_millis();
        let mut total = Purged::default();
        for shard in self.shards.iter() {
            let purged = shard.lock().purge(now, self.expiration, self.grace);
            total.stale += purged.stale;
            total.flags += purged.flags;
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Cache cleanup removed {} stale slices and {} elapsed invalidations",
            total.stale,
            total.flags
        );
        total
    }
}

/// A time-expiring, byte-bounded read cache in front of a
/// [`KeyColumnValueStore`].
///
/// - A cached slice is served for `expiration` after it was fetched.
/// - Writes go through [`Self::mutate_entries`], which writes to the store and
///   then invalidates the key, even if the write failed.
/// - For `grace_wait` after an invalidation, reads of that key go straight to
///   the store and their results are not cached.
/// - Each shard evicts least recently used slices once its share of
///   `max_bytes` is used up.
///
/// A background worker periodically closes elapsed grace windows and purges
/// stale slices; reads do the same lazily for the keys they touch.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use strata::{
///     Entry, ExpirationCache, ExpirationCacheConfig, InMemoryStore, KeyColumnValueStore,
///     KeySliceQuery, MonotonicClock, SliceQuery,
/// };
///
/// let cache = ExpirationCache::new(
///     InMemoryStore::new("edges"),
///     MonotonicClock::default(),
///     ExpirationCacheConfig::default(),
/// )?;
/// let tx = cache.store().begin_transaction()?;
/// let key = Bytes::from_static(b"v1");
///
/// cache.mutate_entries(&key, &[Entry::new("name", "marko")], &[], &tx)?;
/// let row = cache.get_slice(&KeySliceQuery::new(key, SliceQuery::all()), &tx)?;
/// assert_eq!(row.len(), 1);
/// cache.close();
/// # Ok::<(), strata::Error>(())
/// ```
pub struct ExpirationCache<S, T, M = NoopMetrics>
where
    S: KeyColumnValueStore,
    T: TimeSource + 'static,
    M: CacheMetrics + 'static,
{
    store: S,
    core: Arc<CacheCore<T, M>>,
    cleanup: Mutex<Option<CleanupWorker>>,
    closed: AtomicBool,
}

impl<S, T> ExpirationCache<S, T, NoopMetrics>
where
    S: KeyColumnValueStore,
    T: TimeSource + 'static,
{
    /// Creates a cache that records no metrics.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate, or a
    /// backend error if the cleanup worker cannot be started.
    ///
    /// [`Error::InvalidConfig`]: crate::Error::InvalidConfig
    pub fn new(store: S, time: T, config: ExpirationCacheConfig) -> Result<Self> {
        Self::with_metrics(store, time, NoopMetrics, config)
    }
}

impl<S, T, M> ExpirationCache<S, T, M>
where
    S: KeyColumnValueStore,
    T: TimeSource + 'static,
    M: CacheMetrics + 'static,
{
    /// # Errors
    ///
    /// Same as [`ExpirationCache::new`].
    pub fn with_metrics(store: S, time: T, metrics: M, config: ExpirationCacheConfig) -> Result<Self> {
        config.validate()?;
        let budget = config.shard_budget();
        let shards: Box<[ShardCell]> = (0..config.shards)
            .map(|_| shard_cell(Shard::new(budget)))
            .collect();
        let signal = Arc::new(CleanupSignal::new(config.penalty_threshold));
        let core = Arc::new(CacheCore {
            shards,
            hasher: RandomState::new(),
            time,
            metrics,
            signal: Arc::clone(&signal),
            expiration: as_millis(config.expiration),
            grace: as_millis(config.grace_wait),
        });

        let worker_core = Arc::clone(&core);
        let worker = CleanupWorker::spawn(signal, config.cleanup_interval, move || {
            worker_core.cleanup_pass();
        })?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Opened expiration cache over store '{}' ({} shards, {} bytes)",
            store.name(),
            config.shards,
            config.max_bytes
        );

        Ok(Self {
            store,
            core,
            cleanup: Mutex::new(Some(worker)),
            closed: AtomicBool::new(false),
        })
    }

    /// The backing store that misses and writes go to.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// The sink receiving hit, miss and eviction counts.
    pub fn metrics(&self) -> &M {
        &self.core.metrics
    }

    /// Returns the slice from the cache if it is fresh and the key is not
    /// within a grace window, otherwise reads it from the store.
    ///
    /// # Errors
    ///
    /// Propagates store failures. A failed read is never cached and leaves
    /// cached slices untouched.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(key = ?query.key())))]
    pub fn get_slice(&self, query: &KeySliceQuery, tx: &S::Tx) -> Result<EntryList> {
        self.core.metrics.record(CacheAction::Retrieval, 1);
        if self.is_closed() {
            self.core.metrics.record(CacheAction::Miss, 1);
            return self.store.get_slice(query, tx);
        }

        let now = self.core.time.current_millis();
        match self.core.lookup(query, now) {
            Lookup::Hit(entries) => Ok(entries),
            Lookup::Bypass => {
                self.core.metrics.record(CacheAction::Miss, 1);
                self.store.get_slice(query, tx)
            }
            Lookup::Miss { epoch } => {
                self.core.metrics.record(CacheAction::Miss, 1);
                let entries = self.store.get_slice(query, tx)?;
                self.core.offer(query.clone(), entries.clone(), now, epoch);
                Ok(entries)
            }
        }
    }

    /// [`Self::get_slice`] for many keys at once. Misses are read from the
    /// store in a single call when it supports multi-key queries.
    ///
    /// Duplicate keys are read once.
    ///
    /// # Errors
    ///
    /// Propagates store failures; nothing from a failed batch is cached.
    pub fn get_multi_slice(
        &self,
        keys: &[Bytes],
        slice: &SliceQuery,
        tx: &S::Tx,
    ) -> Result<HashMap<Bytes, EntryList>> {
        self.core.metrics.record(CacheAction::Retrieval, keys.len() as u64);
        let now = self.core.time.current_millis();
        let mut results = HashMap::with_capacity(keys.len());
        let mut seen = HashSet::with_capacity(keys.len());
        let mut misses: Vec<(Bytes, Option<u64>)> = Vec::new();

        for key in keys {
            if !seen.insert(key) {
                continue;
            }
            if self.is_closed() {
                misses.push((key.clone(), None));
                continue;
            }
            let query = KeySliceQuery::new(key.clone(), slice.clone());
            match self.core.lookup(&query, now) {
                Lookup::Hit(entries) => {
                    results.insert(key.clone(), entries);
                }
                Lookup::Bypass => misses.push((key.clone(), None)),
                Lookup::Miss { epoch } => misses.push((key.clone(), Some(epoch))),
            }
        }
        if misses.is_empty() {
            return Ok(results);
        }

        self.core.metrics.record(CacheAction::Miss, misses.len() as u64);
        let mut fetched = if self.store.features().multi_query {
            let miss_keys: Vec<Bytes> = misses.iter().map(|(key, _)| key.clone()).collect();
            self.store.get_multi_slice(&miss_keys, slice, tx)?
        } else {
            misses
                .iter()
                .map(|(key, _)| {
                    let query = KeySliceQuery::new(key.clone(), slice.clone());
                    Ok((key.clone(), self.store.get_slice(&query, tx)?))
                })
                .collect::<Result<HashMap<_, _>>>()?
        };

        for (key, epoch) in misses {
            let entries = fetched.remove(&key).unwrap_or_default();
            if let Some(epoch) = epoch {
                let query = KeySliceQuery::new(key.clone(), slice.clone());
                self.core.offer(query, entries.clone(), now, epoch);
            }
            results.insert(key, entries);
        }
        Ok(results)
    }

    /// Writes through to the store, then invalidates `key` whether or not the
    /// write succeeded.
    ///
    /// # Errors
    ///
    /// Propagates the store's write failure.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip_all, fields(key = ?key)))]
    pub fn mutate_entries(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &S::Tx,
    ) -> Result<()> {
        let written = self.store.mutate(key, additions, deletions, tx);
        self.invalidate(key);
        written
    }

    /// Drops every cached slice of `key` and starts its grace window.
    pub fn invalidate(&self, key: &Bytes) {
        let now = self.core.time.current_millis();
        let _dropped = self.core.shard(key).lock().invalidate(key, now);
        self.core.metrics.record(CacheAction::Invalidation, 1);
        if rand::random_ratio(1, INVALIDATE_PENALTY_ODDS) {
            self.core.signal.penalize();
        }
        #[cfg(feature = "tracing")]
        tracing::trace!("Invalidated key {key:?}, dropped {_dropped} cached slices");
    }

    /// Drops every cached slice. Keys still within their grace window stay
    /// uncacheable until it elapses.
    pub fn clear_cache(&self) {
        self.force_clear_expired();
        for shard in self.core.shards.iter() {
            shard.lock().clear();
        }
    }

    /// Runs one cleanup pass now: closes elapsed grace windows and purges
    /// stale slices.
    pub fn force_clear_expired(&self) {
        self.core.cleanup_pass();
    }

    /// Stops the cleanup worker and empties the cache. Later reads and writes
    /// go straight to the store. Calling `close` again is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(worker) = self.cleanup.lock().take() {
            worker.stop();
        }
        for shard in self.core.shards.iter() {
            shard.lock().clear();
        }
        #[cfg(feature = "tracing")]
        tracing::debug!("Closed expiration cache over store '{}'", self.store.name());
    }

    /// Whether [`Self::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of cached slices.
    pub fn len(&self) -> usize {
        self.core.shards.iter().map(|shard| shard.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total weight of cached slices, in bytes.
    pub fn weighted_size(&self) -> u64 {
        self.core.shards.iter().map(|shard| shard.lock().weight()).sum()
    }
}

impl<S, T, M> Drop for ExpirationCache<S, T, M>
where
    S: KeyColumnValueStore,
    T: TimeSource + 'static,
    M: CacheMetrics + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}
