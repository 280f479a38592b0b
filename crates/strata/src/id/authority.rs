use core::time::Duration;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{Error, Result},
    id::{BlockSizer, IdBlock},
};

/// Durably hands out disjoint id blocks per partition.
///
/// Implementations typically sit on a consensus or locking protocol against
/// the storage backend. Errors are reported as:
/// - [`Error::IdPoolExhausted`] when the partition's id space is used up (the
///   pool stops retrying),
/// - [`Error::Backend`] for transient failures (the pool retries with a
///   growing backoff until its wait budget is spent).
///
/// A pool never runs two fetches at once, and its `close()` waits for the
/// running one, so implementations should return within `timeout`.
pub trait IdAuthority: Send + Sync {
    /// Reserves the next block for `partition`, giving up after `timeout`.
    fn fetch_block(&self, partition: u32, timeout: Duration) -> Result<IdBlock>;
}

impl<A: IdAuthority + ?Sized> IdAuthority for Arc<A> {
    fn fetch_block(&self, partition: u32, timeout: Duration) -> Result<IdBlock> {
        (**self).fetch_block(partition, timeout)
    }
}

/// A process-local authority: every partition owns the id space
/// `[first_id, upper_bound)` and blocks are carved off it in order.
///
/// Useful for tests, single-process deployments and load generation.
pub struct InMemoryIdAuthority<B> {
    sizer: B,
    first_id: u64,
    upper_bound: u64,
    next: Mutex<HashMap<u32, u64>>,
}

impl<B: BlockSizer> InMemoryIdAuthority<B> {
    pub fn new(sizer: B) -> Self {
        Self {
            sizer,
            first_id: 1,
            upper_bound: u64::MAX,
            next: Mutex::new(HashMap::new()),
        }
    }

    /// Sets the first id handed out in every partition. Defaults to `1`.
    #[must_use]
    pub fn with_first_id(mut self, first_id: u64) -> Self {
        self.first_id = first_id;
        self
    }

    /// Caps every partition's id space at `upper_bound` (exclusive).
    #[must_use]
    pub fn with_upper_bound(mut self, upper_bound: u64) -> Self {
        self.upper_bound = upper_bound;
        self
    }
}

impl<B: BlockSizer> IdAuthority for InMemoryIdAuthority<B> {
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self, _timeout)))]
    fn fetch_block(&self, partition: u32, _timeout: Duration) -> Result<IdBlock> {
        let size = self.sizer.block_size(partition);
        if size == 0 {
            return Err(Error::invariant(format!(
                "block sizer returned zero for partition({partition})"
            )));
        }

        let mut next = self.next.lock();
        let start = *next.entry(partition).or_insert(self.first_id);
        if start >= self.upper_bound {
            return Err(Error::IdPoolExhausted {
                partition,
                reason: format!("authority reached upper bound {}", self.upper_bound),
                cause: None,
            });
        }

        let end = start.saturating_add(size).min(self.upper_bound);
        let block = IdBlock::new(start, end)?;
        next.insert(partition, end);
        Ok(block)
    }
}
