use bytes::Bytes;
use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{collections::HashMap, sync::Arc, thread::scope, time::Instant};

use crate::{
    BackendError, CacheAction, CounterMetrics, Entry, EntryList, ExpirationCache,
    ExpirationCacheConfig, InMemoryStore, InMemoryTransaction, KeyColumnValueStore,
    KeySliceQuery, ManualClock, MonotonicClock, Result, SliceQuery, StoreFeatures,
};

/// Counts reads reaching the store and can be told to fail.
struct CountingStore {
    inner: InMemoryStore,
    single_reads: AtomicUsize,
    multi_reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl CountingStore {
    fn new(inner: InMemoryStore) -> Self {
        Self {
            inner,
            single_reads: AtomicUsize::new(0),
            multi_reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    fn single_reads(&self) -> usize {
        self.single_reads.load(Ordering::SeqCst)
    }

    fn multi_reads(&self) -> usize {
        self.multi_reads.load(Ordering::SeqCst)
    }
}

impl KeyColumnValueStore for CountingStore {
    type Tx = InMemoryTransaction;

    fn name(&self) -> &str {
        "counting"
    }

    fn features(&self) -> StoreFeatures {
        self.inner.features()
    }

    fn begin_transaction(&self) -> Result<Self::Tx> {
        self.inner.begin_transaction()
    }

    fn get_slice(&self, query: &KeySliceQuery, tx: &Self::Tx) -> Result<EntryList> {
        self.single_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::new("read failed").into());
        }
        self.inner.get_slice(query, tx)
    }

    fn get_multi_slice(
        &self,
        keys: &[Bytes],
        slice: &SliceQuery,
        tx: &Self::Tx,
    ) -> Result<HashMap<Bytes, EntryList>> {
        self.multi_reads.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(BackendError::new("read failed").into());
        }
        self.inner.get_multi_slice(keys, slice, tx)
    }

    fn mutate(
        &self,
        key: &Bytes,
        additions: &[Entry],
        deletions: &[Bytes],
        tx: &Self::Tx,
    ) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(BackendError::new("write failed").into());
        }
        self.inner.mutate(key, additions, deletions, tx)
    }
}

fn key(i: usize) -> Bytes {
    Bytes::from(format!("key-{i}"))
}

fn column(j: usize) -> Bytes {
    Bytes::from(format!("c{j}"))
}

fn row_query(i: usize) -> KeySliceQuery {
    KeySliceQuery::new(key(i), SliceQuery::all())
}

/// `keys` rows of `columns` columns each.
fn seeded_store(keys: usize, columns: usize) -> InMemoryStore {
    let store = InMemoryStore::new("seed");
    let tx = store.begin_transaction().unwrap();
    for i in 0..keys {
        let entries: Vec<Entry> = (0..columns).map(|j| Entry::new(column(j), "v")).collect();
        store.mutate(&key(i), &entries, &[], &tx).unwrap();
    }
    store
}

fn config(expiration_ms: u64, grace_ms: u64) -> ExpirationCacheConfig {
    ExpirationCacheConfig::default()
        .with_expiration(Duration::from_millis(expiration_ms))
        .with_grace_wait(Duration::from_millis(grace_ms))
        .with_shards(4)
}

type TestCache = ExpirationCache<Arc<CountingStore>, ManualClock>;

fn cache_over(
    inner: InMemoryStore,
    config: ExpirationCacheConfig,
) -> (TestCache, Arc<CountingStore>, ManualClock, InMemoryTransaction) {
    let store = Arc::new(CountingStore::new(inner));
    let clock = ManualClock::new(1_000);
    let cache = ExpirationCache::new(Arc::clone(&store), clock.clone(), config).unwrap();
    let tx = store.begin_transaction().unwrap();
    (cache, store, clock, tx)
}

#[test]
fn slices_are_served_until_they_expire() {
    let (cache, store, clock, tx) = cache_over(seeded_store(1, 3), config(200, 0));

    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 3);
    assert_eq!(store.single_reads(), 1);

    clock.advance(100);
    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 3);
    assert_eq!(store.single_reads(), 1);

    clock.advance(150);
    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 3);
    assert_eq!(store.single_reads(), 2);
}

#[test]
fn direct_store_writes_surface_after_expiration() {
    let (cache, store, clock, tx) = cache_over(seeded_store(100, 6), config(1_000, 0));

    for i in 0..100 {
        cache.get_slice(&row_query(i), &tx).unwrap();
    }
    assert_eq!(cache.get_slice(&row_query(81), &tx).unwrap().len(), 6);

    // Bypass the cache: it cannot know about this write.
    store.inner.mutate(&key(81), &[], &[column(0)], &tx).unwrap();
    assert_eq!(cache.get_slice(&row_query(81), &tx).unwrap().len(), 6);

    clock.advance(1_000);
    assert_eq!(cache.get_slice(&row_query(81), &tx).unwrap().len(), 5);
}

#[test]
fn writes_through_the_cache_are_visible_immediately() {
    let (cache, _store, _clock, tx) = cache_over(seeded_store(1, 2), config(60_000, 50));

    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 2);
    cache
        .mutate_entries(&key(0), &[Entry::new("c9", "new")], &[], &tx)
        .unwrap();

    let row = cache.get_slice(&row_query(0), &tx).unwrap();
    assert_eq!(row.len(), 3);
    assert_eq!(row[2].value(), &Bytes::from_static(b"new"));
}

#[test]
fn grace_window_bypasses_the_cache_then_recaches() {
    let (cache, store, clock, tx) = cache_over(seeded_store(1, 2), config(60_000, 1_000));

    cache.get_slice(&row_query(0), &tx).unwrap();
    cache
        .mutate_entries(&key(0), &[], &[column(0)], &tx)
        .unwrap();
    let before = store.single_reads();

    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 1);
    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 1);
    assert_eq!(store.single_reads(), before + 2);
    assert!(cache.is_empty());

    clock.advance(1_000);
    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 1);
    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 1);
    assert_eq!(store.single_reads(), before + 3);
}

#[test]
fn failed_reads_are_not_cached_and_leave_entries_alone() {
    let (cache, store, _clock, tx) = cache_over(seeded_store(2, 1), config(60_000, 0));

    cache.get_slice(&row_query(0), &tx).unwrap();
    store.fail_reads.store(true, Ordering::SeqCst);

    let err = cache.get_slice(&row_query(1), &tx).unwrap_err();
    assert!(!err.is_exhausted());
    assert_eq!(err.to_string(), "backend unavailable: read failed");
    // Row 0 is still cached.
    assert_eq!(cache.get_slice(&row_query(0), &tx).unwrap().len(), 1);
    assert_eq!(cache.len(), 1);

    store.fail_reads.store(false, Ordering::SeqCst);
    let reads = store.single_reads();
    assert_eq!(cache.get_slice(&row_query(1), &tx).unwrap().len(), 1);
    assert_eq!(store.single_reads(), reads + 1);
}

#[test]
fn failed_writes_still_invalidate() {
    let (cache, store, _clock, tx) = cache_over(seeded_store(1, 1), config(60_000, 0));

    cache.get_slice(&row_query(0), &tx).unwrap();
    store.fail_writes.store(true, Ordering::SeqCst);
    assert!(
        cache
            .mutate_entries(&key(0), &[Entry::new("x", "y")], &[], &tx)
            .is_err()
    );
    assert!(cache.is_empty());

    let reads = store.single_reads();
    cache.get_slice(&row_query(0), &tx).unwrap();
    assert_eq!(store.single_reads(), reads + 1);
}

#[test]
fn multi_key_misses_are_batched_into_one_store_call() {
    let (cache, store, _clock, tx) = cache_over(seeded_store(10, 2), config(60_000, 0));
    for i in 0..3 {
        cache.get_slice(&row_query(i), &tx).unwrap();
    }
    let keys: Vec<Bytes> = (0..10).map(key).collect();

    let result = cache.get_multi_slice(&keys, &SliceQuery::all(), &tx).unwrap();
    assert_eq!(result.len(), 10);
    assert!(result.values().all(|row| row.len() == 2));
    assert_eq!(store.multi_reads(), 1);
    assert_eq!(store.single_reads(), 3);
    assert_eq!(cache.len(), 10);

    // Everything is cached now.
    cache.get_multi_slice(&keys, &SliceQuery::all(), &tx).unwrap();
    assert_eq!(store.multi_reads(), 1);
}

#[test]
fn multi_key_misses_fall_back_to_single_reads() {
    let inner = seeded_store(5, 1).with_multi_query(false);
    let (cache, store, _clock, tx) = cache_over(inner, config(60_000, 0));
    let mut keys: Vec<Bytes> = (0..5).map(key).collect();
    keys.push(key(0));

    let result = cache.get_multi_slice(&keys, &SliceQuery::all(), &tx).unwrap();
    assert_eq!(result.len(), 5);
    assert_eq!(store.multi_reads(), 0);
    assert_eq!(store.single_reads(), 5);
}

#[test]
fn failed_batch_caches_nothing() {
    let (cache, store, _clock, tx) = cache_over(seeded_store(3, 1), config(60_000, 0));
    store.fail_reads.store(true, Ordering::SeqCst);
    let keys: Vec<Bytes> = (0..3).map(key).collect();

    assert!(cache.get_multi_slice(&keys, &SliceQuery::all(), &tx).is_err());
    assert!(cache.is_empty());
}

#[test]
fn byte_budget_evicts_least_recently_used() {
    let metrics = Arc::new(CounterMetrics::new());
    let store = Arc::new(CountingStore::new(seeded_store(50, 4)));
    let config = config(60_000, 0).with_shards(1).with_max_bytes(2_048);
    let cache =
        ExpirationCache::with_metrics(Arc::clone(&store), ManualClock::new(0), Arc::clone(&metrics), config)
            .unwrap();
    let tx = store.begin_transaction().unwrap();

    for i in 0..50 {
        cache.get_slice(&row_query(i), &tx).unwrap();
    }
    assert!(cache.weighted_size() <= 2_048);
    assert!(cache.len() < 50);
    assert_eq!(
        metrics.get(CacheAction::Eviction),
        50 - cache.len() as u64
    );
    assert!(Arc::ptr_eq(cache.metrics(), &metrics));

    // The most recent row survived, the first one did not.
    let reads = store.single_reads();
    cache.get_slice(&row_query(49), &tx).unwrap();
    assert_eq!(store.single_reads(), reads);
    cache.get_slice(&row_query(0), &tx).unwrap();
    assert_eq!(store.single_reads(), reads + 1);
}

#[test]
fn metrics_count_retrievals_misses_and_invalidations() {
    let metrics = Arc::new(CounterMetrics::new());
    let store = Arc::new(CountingStore::new(seeded_store(3, 1)));
    let cache = ExpirationCache::with_metrics(
        Arc::clone(&store),
        ManualClock::new(0),
        Arc::clone(&metrics),
        config(60_000, 0),
    )
    .unwrap();
    let tx = store.begin_transaction().unwrap();

    cache.get_slice(&row_query(0), &tx).unwrap();
    cache.get_slice(&row_query(0), &tx).unwrap();
    let keys: Vec<Bytes> = (0..3).map(key).collect();
    cache.get_multi_slice(&keys, &SliceQuery::all(), &tx).unwrap();
    cache.mutate_entries(&key(1), &[], &[], &tx).unwrap();

    let snapshot = metrics.reset();
    assert_eq!(snapshot.retrievals, 5);
    assert_eq!(snapshot.misses, 3);
    assert_eq!(snapshot.invalidations, 1);
    assert_eq!(metrics.snapshot().retrievals, 0);
}

#[test]
fn clear_cache_keeps_grace_windows() {
    let (cache, store, clock, tx) = cache_over(seeded_store(2, 1), config(60_000, 500));
    cache.get_slice(&row_query(0), &tx).unwrap();
    cache.get_slice(&row_query(1), &tx).unwrap();
    cache.invalidate(&key(1));

    cache.clear_cache();
    assert!(cache.is_empty());
    assert_eq!(cache.weighted_size(), 0);

    let reads = store.single_reads();
    cache.get_slice(&row_query(1), &tx).unwrap();
    cache.get_slice(&row_query(1), &tx).unwrap();
    assert_eq!(store.single_reads(), reads + 2);

    clock.advance(500);
    cache.get_slice(&row_query(1), &tx).unwrap();
    cache.get_slice(&row_query(1), &tx).unwrap();
    assert_eq!(store.single_reads(), reads + 3);
}

#[test]
fn force_clear_expired_purges_stale_slices() {
    let (cache, _store, clock, tx) = cache_over(seeded_store(4, 1), config(100, 0));
    for i in 0..2 {
        cache.get_slice(&row_query(i), &tx).unwrap();
    }
    clock.advance(60);
    for i in 2..4 {
        cache.get_slice(&row_query(i), &tx).unwrap();
    }
    clock.advance(50);

    cache.force_clear_expired();
    assert_eq!(cache.len(), 2);
}

#[test]
fn penalties_trigger_a_background_cleanup() {
    let store = Arc::new(CountingStore::new(seeded_store(2, 1)));
    let clock = ManualClock::new(0);
    let config = config(100, 10_000)
        .with_penalty_threshold(2)
        .with_cleanup_interval(Duration::from_secs(3_600));
    let cache = ExpirationCache::new(Arc::clone(&store), clock.clone(), config).unwrap();
    let tx = store.begin_transaction().unwrap();

    cache.get_slice(&row_query(0), &tx).unwrap();
    clock.advance(200);
    assert_eq!(cache.len(), 1);

    // Two reads forced past the cache by a pending invalidation.
    cache.invalidate(&key(1));
    cache.get_slice(&row_query(1), &tx).unwrap();
    cache.get_slice(&row_query(1), &tx).unwrap();

    let start = Instant::now();
    while !cache.is_empty() {
        assert!(start.elapsed() < Duration::from_secs(5), "cleanup never ran");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn concurrent_writers_never_leave_stale_slices_behind() {
    const KEYS: usize = 16;
    let store = Arc::new(CountingStore::new(seeded_store(KEYS, 1)));
    let cache = ExpirationCache::new(
        Arc::clone(&store),
        MonotonicClock::default(),
        config(60_000, 0),
    )
    .unwrap();

    scope(|s| {
        for w in 0..4 {
            let cache = &cache;
            s.spawn(move || {
                let tx = cache.store().begin_transaction().unwrap();
                for round in 0..200 {
                    let i = (w * 4 + round) % KEYS;
                    let value = format!("{w}-{round}");
                    cache
                        .mutate_entries(&key(i), &[Entry::new(column(0), value)], &[], &tx)
                        .unwrap();
                }
            });
        }
        for _ in 0..4 {
            let cache = &cache;
            s.spawn(move || {
                let tx = cache.store().begin_transaction().unwrap();
                for round in 0..2_000 {
                    cache.get_slice(&row_query(round % KEYS), &tx).unwrap();
                }
            });
        }
    });

    let tx = store.begin_transaction().unwrap();
    for i in 0..KEYS {
        let cached = cache.get_slice(&row_query(i), &tx).unwrap();
        let stored = store.inner.get_slice(&row_query(i), &tx).unwrap();
        assert_eq!(cached, stored, "row {i} is stale");
    }
}

#[test]
fn closed_cache_passes_reads_through() {
    let (cache, store, _clock, tx) = cache_over(seeded_store(1, 1), config(60_000, 0));
    cache.get_slice(&row_query(0), &tx).unwrap();
    cache.close();
    cache.close();
    assert!(cache.is_closed());
    assert!(cache.is_empty());

    let reads = store.single_reads();
    cache.get_slice(&row_query(0), &tx).unwrap();
    cache.get_slice(&row_query(0), &tx).unwrap();
    assert_eq!(store.single_reads(), reads + 2);
    assert!(cache.is_empty());
}
