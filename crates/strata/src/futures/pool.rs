use core::{future::Future, time::Duration};

use super::SleepProvider;
use crate::{
    error::Result,
    id::{IdAuthority, IdPool, IdPoll},
    time::TimeSource,
};

/// Extension trait for taking ids from an [`IdPool`] without blocking a
/// thread.
///
/// While the next block is being fetched the future sleeps through the given
/// [`SleepProvider`] instead of parking the caller, and gives up after the
/// pool's `max_wait` just like [`IdPool::next_id`].
pub trait IdPoolAsyncExt {
    /// Returns a future that resolves to the next id of the pool.
    ///
    /// # Errors
    ///
    /// Same as [`IdPool::next_id`].
    fn try_next_id_async<S>(&self) -> impl Future<Output = Result<u64>>
    where
        S: SleepProvider;
}

impl<A, T> IdPoolAsyncExt for IdPool<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource,
{
    fn try_next_id_async<S>(&self) -> impl Future<Output = Result<u64>>
    where
        S: SleepProvider,
    {
        async {
            let mut deadline = None;
            loop {
                let yield_for = match self.try_poll_id()? {
                    IdPoll::Ready { id } => return Ok(id),
                    IdPoll::Pending { yield_for } => yield_for,
                };
                let limit = self.check_deadline(&mut deadline)?;
                let left = limit.saturating_sub(self.time.current_millis());
                S::sleep_for(yield_for.min(Duration::from_millis(left))).await;
            }
        }
    }
}
