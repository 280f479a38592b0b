use bytes::Bytes;
use portable_atomic::{AtomicU64, Ordering};
use rand::Rng;
use std::sync::Arc;
use strata::{
    CounterMetrics, Entry, Error, ExpirationCache, FixedBlockSizer, IdPoolAsyncTokioExt,
    InMemoryIdAuthority, InMemoryStore, KeyColumnValueStore, KeySliceQuery, MonotonicClock,
    PartitionedIdPools, SliceQuery, StoreTransaction,
};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::config::LoadgenConfig;

pub type Pools = PartitionedIdPools<InMemoryIdAuthority<FixedBlockSizer>, MonotonicClock>;
pub type Cache = ExpirationCache<InMemoryStore, MonotonicClock, Arc<CounterMetrics>>;

/// Totals gathered by every worker.
#[derive(Debug, Default)]
pub struct Counters {
    pub ids: AtomicU64,
    pub id_errors: AtomicU64,
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub cache_errors: AtomicU64,
}

pub fn row_key(i: usize) -> Bytes {
    Bytes::from(format!("row-{i:08}"))
}

fn column(j: usize) -> Bytes {
    Bytes::from(format!("c{j:04}"))
}

/// Fills every row of the store with `columns` columns.
pub fn seed(store: &InMemoryStore, config: &LoadgenConfig) -> strata::Result<()> {
    let tx = store.begin_transaction()?;
    for i in 0..config.keys {
        let additions: Vec<Entry> = (0..config.columns)
            .map(|j| Entry::new(column(j), format!("v{i}-{j}-0")))
            .collect();
        store.mutate(&row_key(i), &additions, &[], &tx)?;
    }
    tx.commit()
}

/// Spawns `config.id_workers` tasks pulling ids until `stop` fires. Worker
/// `n` stays on partition `n % partitions` and checks that every id it
/// receives is larger than the previous one.
pub fn spawn_id_workers(
    set: &mut JoinSet<anyhow::Result<()>>,
    pools: &Arc<Pools>,
    counters: &Arc<Counters>,
    config: &LoadgenConfig,
    stop: &CancellationToken,
) {
    for worker in 0..config.id_workers {
        #[allow(clippy::cast_possible_truncation)]
        let partition = (worker % config.partitions as usize) as u32;
        let pools = Arc::clone(pools);
        let counters = Arc::clone(counters);
        let stop = stop.clone();

        set.spawn(async move {
            let pool = pools.pool(partition)?;
            let mut last = 0;
            while !stop.is_cancelled() {
                match pool.next_id_async().await {
                    Ok(id) => {
                        anyhow::ensure!(
                            id > last,
                            "partition({partition}) issued {id} after {last}"
                        );
                        last = id;
                        counters.ids.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(Error::PoolClosed { .. }) => break,
                    Err(e) if e.is_exhausted() => return Err(e.into()),
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Id worker {worker} failed: {_e}");
                        counters.id_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            Ok(())
        });
    }
}

/// Spawns `config.cache_workers` blocking workers issuing a random mix of
/// reads and writes until `stop` fires. Each worker owns a disjoint set of
/// rows to write, so a read straight after its write must return it.
pub fn spawn_cache_workers(
    set: &mut JoinSet<anyhow::Result<()>>,
    cache: &Arc<Cache>,
    counters: &Arc<Counters>,
    config: &LoadgenConfig,
    stop: &CancellationToken,
) {
    for worker in 0..config.cache_workers {
        let cache = Arc::clone(cache);
        let counters = Arc::clone(counters);
        let stop = stop.clone();
        let keys = config.keys;
        let workers = config.cache_workers;
        let columns = config.columns;
        let write_ratio = config.write_ratio;

        set.spawn_blocking(move || {
            let mut rng = rand::rng();
            let tx = cache.store().begin_transaction()?;
            let mut version = 0u64;

            // Worker `w` is the only writer of rows `w`, `w + workers`, ...
            let owned = keys.saturating_sub(worker).div_ceil(workers);

            while !stop.is_cancelled() {
                if owned > 0 && rng.random_bool(write_ratio) {
                    version += 1;
                    let key = row_key(worker + workers * rng.random_range(0..owned));
                    let col = column(rng.random_range(0..columns));
                    let value = Bytes::from(format!("w{worker}-{version}"));
                    let written = cache.mutate_entries(
                        &key,
                        &[Entry::new(col.clone(), value.clone())],
                        &[],
                        &tx,
                    );
                    if let Err(_e) = written {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Cache worker {worker} write failed: {_e}");
                        counters.cache_errors.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    counters.writes.fetch_add(1, Ordering::Relaxed);

                    let slice = SliceQuery::new(col.clone(), successor(&col));
                    let row = cache.get_slice(&KeySliceQuery::new(key, slice), &tx)?;
                    counters.reads.fetch_add(1, Ordering::Relaxed);
                    anyhow::ensure!(
                        row.first().is_some_and(|e| e.value() == &value),
                        "worker {worker} did not read back version {version}"
                    );
                } else {
                    let key = row_key(rng.random_range(0..keys));
                    let query = KeySliceQuery::new(key, SliceQuery::all());
                    match cache.get_slice(&query, &tx) {
                        Ok(row) => {
                            anyhow::ensure!(
                                row.len() == columns,
                                "row {:?} returned {} of {columns} columns",
                                query.key(),
                                row.len()
                            );
                            counters.reads.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(_e) => {
                            #[cfg(feature = "tracing")]
                            tracing::warn!("Cache worker {worker} read failed: {_e}");
                            counters.cache_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        });
    }
}

/// Keeps the first failure among joined workers, whether the worker
/// returned an error or panicked.
pub fn record_outcome(
    joined: Result<anyhow::Result<()>, JoinError>,
    first_err: &mut Option<anyhow::Error>,
) {
    if let Err(e) = joined.map_err(anyhow::Error::from).and_then(|r| r) {
        #[cfg(feature = "tracing")]
        tracing::error!("Worker failed: {e:#}");
        first_err.get_or_insert(e);
    }
}

/// Smallest column sorting after `col`, so `[col, successor(col))` holds
/// only `col`.
fn successor(col: &Bytes) -> Bytes {
    let mut next = col.to_vec();
    next.push(0);
    Bytes::from(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::time::Duration;
    use strata::{ExpirationCacheConfig, IdPoolConfig};

    fn config() -> LoadgenConfig {
        LoadgenConfig {
            partitions: 2,
            block_size: 100,
            id_workers: 4,
            cache_workers: 2,
            keys: 16,
            columns: 4,
            write_ratio: 0.2,
            duration: Duration::from_millis(200),
            json_logs: false,
            pool: IdPoolConfig::default().with_renew_id_count(10),
            cache: ExpirationCacheConfig::default()
                .with_shards(2)
                .with_grace_wait(Duration::from_millis(1)),
        }
    }

    #[test]
    fn seeds_every_row() {
        let config = config();
        let store = InMemoryStore::new("seed");
        seed(&store, &config).unwrap();
        assert_eq!(store.len(), 16);

        let tx = store.begin_transaction().unwrap();
        let row = store
            .get_slice(&KeySliceQuery::new(row_key(3), SliceQuery::all()), &tx)
            .unwrap();
        assert_eq!(row.len(), 4);
    }

    #[test]
    fn successor_bounds_a_single_column() {
        let col = column(7);
        let slice = SliceQuery::new(col.clone(), successor(&col));
        assert!(slice.contains(&col));
        assert!(!slice.contains(&column(8)));
    }

    #[tokio::test]
    async fn keeps_the_first_worker_failure() {
        let mut set: JoinSet<anyhow::Result<()>> = JoinSet::new();
        set.spawn(async { Err(anyhow::anyhow!("id 7 issued after 9")) });
        let mut first_err = None;
        record_outcome(set.join_next().await.unwrap(), &mut first_err);
        record_outcome(Ok(Ok(())), &mut first_err);

        set.spawn(async { panic!("worker crashed") });
        record_outcome(set.join_next().await.unwrap(), &mut first_err);

        let err = first_err.expect("a failure was recorded");
        assert_eq!(err.to_string(), "id 7 issued after 9");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_run_clean_until_stopped() {
        let config = config();
        let clock = MonotonicClock::default();
        let authority = Arc::new(InMemoryIdAuthority::new(
            FixedBlockSizer::new(config.block_size).unwrap(),
        ));
        let pools = Arc::new(Pools::new(authority, clock.clone(), config.pool.clone()).unwrap());

        let store = InMemoryStore::new("load");
        seed(&store, &config).unwrap();
        let metrics = Arc::new(CounterMetrics::new());
        let cache = Arc::new(
            Cache::with_metrics(store, clock, Arc::clone(&metrics), config.cache.clone()).unwrap(),
        );

        let counters = Arc::new(Counters::default());
        let stop = CancellationToken::new();
        let mut set = JoinSet::new();
        spawn_id_workers(&mut set, &pools, &counters, &config, &stop);
        spawn_cache_workers(&mut set, &cache, &counters, &config, &stop);

        tokio::time::sleep(config.duration).await;
        stop.cancel();
        while let Some(joined) = set.join_next().await {
            joined.unwrap().unwrap();
        }
        pools.close().unwrap();
        cache.close();

        assert!(counters.ids.load(Ordering::Relaxed) > 0);
        assert!(counters.reads.load(Ordering::Relaxed) > 0);
        assert_eq!(counters.id_errors.load(Ordering::Relaxed), 0);
        assert_eq!(counters.cache_errors.load(Ordering::Relaxed), 0);
        assert!(metrics.snapshot().retrievals >= counters.reads.load(Ordering::Relaxed));
    }
}
