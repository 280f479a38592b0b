use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{Error, Result},
    id::{IdAuthority, IdPool, IdPoolConfig},
    time::TimeSource,
};

/// One [`IdPool`] per partition, created on first use.
///
/// Pools share the authority and the clock but nothing else: a slow renewal
/// in one partition never holds up callers of another.
pub struct PartitionedIdPools<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource + Clone,
{
    authority: Arc<A>,
    time: T,
    config: IdPoolConfig,
    pools: RwLock<HashMap<u32, Arc<IdPool<A, T>>>>,
    closed: RwLock<bool>,
}

impl<A, T> PartitionedIdPools<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource + Clone,
{
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(authority: Arc<A>, time: T, config: IdPoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            authority,
            time,
            config,
            pools: RwLock::new(HashMap::new()),
            closed: RwLock::new(false),
        })
    }

    /// Returns the pool for `partition`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] once [`Self::close`] has been called.
    pub fn pool(&self, partition: u32) -> Result<Arc<IdPool<A, T>>> {
        let closed = self.closed.read();
        if *closed {
            return Err(Error::PoolClosed { partition });
        }
        if let Some(pool) = self.pools.read().get(&partition) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&partition) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(IdPool::new(
            partition,
            Arc::clone(&self.authority),
            self.time.clone(),
            self.config.clone(),
        )?);
        pools.insert(partition, Arc::clone(&pool));
        Ok(pool)
    }

    /// Takes the next id from `partition`'s pool.
    ///
    /// # Errors
    ///
    /// See [`IdPool::next_id`].
    pub fn next_id(&self, partition: u32) -> Result<u64> {
        self.pool(partition)?.next_id()
    }

    /// Partitions with a live pool, in ascending order.
    pub fn partitions(&self) -> Vec<u32> {
        let mut partitions: Vec<u32> = self.pools.read().keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Closes every pool. All pools are closed even if some fail; the first
    /// failure is returned.
    ///
    /// # Errors
    ///
    /// Returns the first [`Error::CloseTimeout`] encountered.
    pub fn close(&self) -> Result<()> {
        // Holding the write lock keeps `pool()` from handing out new pools.
        let mut closed = self.closed.write();
        *closed = true;
        let pools: Vec<_> = self.pools.write().drain().collect();

        let mut first_err = None;
        for (_partition, pool) in pools {
            if let Err(e) = pool.close() {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to close id pool for partition({_partition}): {e}");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
