use core::{future::Future, time::Duration};

use crate::{
    error::Result,
    futures::{IdPoolAsyncExt, SleepProvider},
    id::{IdAuthority, IdPool},
    time::TimeSource,
};

/// Waits out the pool's suggested back-off on a Tokio timer. Use this one
/// unless there is a reason not to.
pub struct TokioSleep;
impl SleepProvider for TokioSleep {
    async fn sleep_for(dur: Duration) {
        tokio::time::sleep(dur).await;
    }
}

/// Ignores the suggested back-off and just yields to the Tokio scheduler.
/// Waiting for a block turns into a busy poll, so only pick this when
/// renewals are known to be fast.
pub struct TokioYield;
impl SleepProvider for TokioYield {
    async fn sleep_for(_dur: Duration) {
        tokio::task::yield_now().await;
    }
}

/// Convenience extension using [`TokioSleep`], so callers can write
/// `pool.next_id_async().await` without naming a sleep provider.
pub trait IdPoolAsyncTokioExt {
    /// Returns a future that resolves to the next id of the pool.
    ///
    /// # Errors
    ///
    /// Same as [`IdPool::next_id`].
    fn next_id_async(&self) -> impl Future<Output = Result<u64>>;
}

impl<A, T> IdPoolAsyncTokioExt for IdPool<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource,
{
    fn next_id_async(&self) -> impl Future<Output = Result<u64>> {
        <Self as IdPoolAsyncExt>::try_next_id_async::<TokioSleep>(self)
    }
}

#[cfg(test)]
mod tests {
    use futures::future::try_join_all;
    use std::{collections::HashSet, sync::Arc, time::Instant};

    use super::*;
    use crate::{
        BackendError, FixedBlockSizer, IdBlock, IdPoolConfig, InMemoryIdAuthority,
        MonotonicClock,
    };

    const TASKS: usize = 8;
    const IDS_PER_TASK: usize = 4096;

    fn pool(block_size: u64) -> Arc<IdPool<InMemoryIdAuthority<FixedBlockSizer>, MonotonicClock>> {
        let authority = Arc::new(InMemoryIdAuthority::new(FixedBlockSizer::new(block_size).unwrap()));
        let config = IdPoolConfig::default()
            .with_renew_id_count(8)
            .with_poll_interval(Duration::from_millis(1));
        Arc::new(IdPool::new(0, authority, MonotonicClock::default(), config).unwrap())
    }

    async fn unique_ids<S: SleepProvider + 'static>() -> Result<()> {
        let pool = pool(64);
        let tasks: Vec<tokio::task::JoinHandle<Result<Vec<u64>>>> = (0..TASKS)
            .map(|_| {
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    let mut ids = Vec::with_capacity(IDS_PER_TASK);
                    for _ in 0..IDS_PER_TASK {
                        ids.push(pool.try_next_id_async::<S>().await?);
                    }
                    Ok(ids)
                })
            })
            .collect();

        let mut seen = HashSet::with_capacity(TASKS * IDS_PER_TASK);
        for ids in try_join_all(tasks).await.unwrap() {
            for id in ids? {
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), TASKS * IDS_PER_TASK);
        pool.close()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn generates_many_unique_ids_sleep() -> Result<()> {
        unique_ids::<TokioSleep>().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn generates_many_unique_ids_yield() -> Result<()> {
        unique_ids::<TokioYield>().await
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn convenience_ext_uses_tokio_sleep() -> Result<()> {
        let pool = pool(16);
        let a = pool.next_id_async().await?;
        let b = IdPoolAsyncTokioExt::next_id_async(&*pool).await?;
        assert!(a < b);
        pool.close()
    }

    struct Unreachable;

    impl IdAuthority for Unreachable {
        fn fetch_block(&self, _partition: u32, _timeout: Duration) -> Result<IdBlock> {
            Err(BackendError::new("unreachable").into())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn gives_up_after_max_wait() {
        let config = IdPoolConfig::default()
            .with_max_wait(Duration::from_millis(80))
            .with_poll_interval(Duration::from_millis(5));
        let pool = IdPool::new(1, Arc::new(Unreachable), MonotonicClock::default(), config).unwrap();

        let start = Instant::now();
        let err = pool.next_id_async().await.unwrap_err();
        assert!(err.is_exhausted());
        assert!(start.elapsed() >= Duration::from_millis(70));
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
