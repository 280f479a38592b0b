use core::time::Duration;
use parking_lot::Mutex;
use std::sync::Arc;

#[cfg(feature = "tracing")]
use tracing::instrument;

use crate::{
    error::{BackendError, Error, Result},
    id::{
        IdAuthority, IdBlock, IdPoolConfig,
        renewal::{RenewalOutcome, RenewalTask},
    },
    time::{TimeSource, as_millis},
};

/// Upper bound on the pause between retries of a failing renewal, unless
/// `poll_interval` is longer.
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Result of a non-blocking attempt to take an id from an [`IdPool`].
///
/// - [`IdPoll::Ready`] carries the issued id.
/// - [`IdPoll::Pending`] means the current block is used up and the next one
///   has not arrived yet; retry after `yield_for`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdPoll {
    /// An id was issued.
    Ready {
        /// The issued id.
        id: u64,
    },
    /// No id is available yet.
    Pending {
        /// Suggested back-off before polling again.
        yield_for: Duration,
    },
}

/// Counters describing a pool's activity since construction.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdPoolStats {
    /// Blocks rotated in as the current block.
    pub blocks_acquired: u64,
    /// Background fetches spawned (including retries).
    pub renewals_started: u64,
    /// Ids handed out.
    pub ids_issued: u64,
}

#[derive(Debug)]
struct PoolState {
    // Current block cursor: ids in [next_id, max_id) are unissued.
    next_id: u64,
    max_id: u64,
    renew_threshold: u64,
    buffer: Option<IdBlock>,
    // The only fetch allowed in flight. It outlives callers that time out.
    renewal: Option<RenewalTask>,
    last_failure: Option<BackendError>,
    // No new fetch before `retry_at`; `retry_backoff` doubles per failure.
    retry_at: u64,
    retry_backoff: Duration,
    exhausted: Option<Error>,
    closed: bool,
    stats: IdPoolStats,
}

/// A lock-based cursor over blocks of ids reserved for one partition.
///
/// Ids are handed out in strictly increasing order from the current block.
/// Once the renewal threshold of a block is crossed, the next block is
/// fetched from the [`IdAuthority`] in the background so callers rarely
/// wait; at most one fetch is in flight per pool at any time.
///
/// ## Recommended When
/// - Many threads need unique ids from one partition
/// - The authority is remote and each block fetch is expensive
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use strata::{FixedBlockSizer, IdPool, IdPoolConfig, InMemoryIdAuthority, MonotonicClock};
///
/// let authority = Arc::new(InMemoryIdAuthority::new(FixedBlockSizer::new(1_000)?));
/// let pool = IdPool::new(0, authority, MonotonicClock::default(), IdPoolConfig::default())?;
///
/// let a = pool.next_id()?;
/// let b = pool.next_id()?;
/// assert!(a < b);
/// pool.close()?;
/// # Ok::<(), strata::Error>(())
/// ```
pub struct IdPool<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource,
{
    partition: u32,
    #[cfg(feature = "cache-padded")]
    state: crossbeam_utils::CachePadded<Mutex<PoolState>>,
    #[cfg(not(feature = "cache-padded"))]
    state: Mutex<PoolState>,
    authority: Arc<A>,
    pub(crate) time: T,
    config: IdPoolConfig,
}

impl<A, T> IdPool<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource,
{
    /// Creates a pool for `partition`. No block is fetched until the first
    /// id is requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if `config` does not validate.
    pub fn new(partition: u32, authority: Arc<A>, time: T, config: IdPoolConfig) -> Result<Self> {
        config.validate()?;
        let state = PoolState {
            next_id: 0,
            max_id: 0,
            renew_threshold: 0,
            buffer: None,
            renewal: None,
            last_failure: None,
            retry_at: 0,
            retry_backoff: Duration::ZERO,
            exhausted: None,
            closed: false,
            stats: IdPoolStats::default(),
        };
        Ok(Self {
            partition,
            #[cfg(feature = "cache-padded")]
            state: crossbeam_utils::CachePadded::new(Mutex::new(state)),
            #[cfg(not(feature = "cache-padded"))]
            state: Mutex::new(state),
            authority,
            time,
            config,
        })
    }

    /// The partition this pool issues ids for.
    pub const fn partition(&self) -> u32 {
        self.partition
    }

    /// The validated configuration the pool was built with.
    pub const fn config(&self) -> &IdPoolConfig {
        &self.config
    }

    /// A snapshot of the pool's activity counters.
    pub fn stats(&self) -> IdPoolStats {
        self.state.lock().stats
    }

    /// Returns the next id, blocking while a new block is being fetched.
    ///
    /// # Errors
    ///
    /// - [`Error::IdPoolExhausted`] if no block arrived within `max_wait`
    ///   (carrying the last renewal failure as its cause), if the authority
    ///   ran out of ids, or if the id upper bound was reached.
    /// - [`Error::PoolClosed`] after [`Self::close`].
    /// - [`Error::InvariantViolation`] if the authority returned a block that
    ///   would break id ordering.
    #[cfg_attr(feature = "tracing", instrument(level = "trace", skip(self), fields(partition = self.partition)))]
    pub fn next_id(&self) -> Result<u64> {
        let mut deadline = None;
        loop {
            match self.try_poll_id()? {
                IdPoll::Ready { id } => return Ok(id),
                IdPoll::Pending { yield_for } => {
                    let limit = self.check_deadline(&mut deadline)?;
                    let wake = self
                        .time
                        .current_millis()
                        .saturating_add(as_millis(yield_for));
                    self.time.sleep_until(wake.min(limit));
                }
            }
        }
    }

    /// Attempts to take the next id without blocking.
    ///
    /// Starts a background fetch when the renewal threshold is crossed, or
    /// when the current block is used up and nothing is in flight. After a
    /// failed fetch the next one waits out a backoff that doubles per
    /// consecutive failure.
    ///
    /// # Errors
    ///
    /// Same as [`Self::next_id`], except that waiting never times out here.
    pub fn try_poll_id(&self) -> Result<IdPoll> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::PoolClosed {
                partition: self.partition,
            });
        }
        self.collect_renewal(&mut state);

        debug_assert!(state.next_id <= state.max_id);
        if state.next_id == state.max_id {
            match state.buffer.take() {
                Some(block) => self.rotate(&mut state, block)?,
                None => {
                    if let Some(err) = &state.exhausted {
                        return Err(err.clone());
                    }
                    if state.renewal.is_none() {
                        let now = self.time.current_millis();
                        if now < state.retry_at {
                            return Ok(IdPoll::Pending {
                                yield_for: Duration::from_millis(state.retry_at - now),
                            });
                        }
                        self.start_renewal(&mut state)?;
                    }
                    return Ok(IdPoll::Pending {
                        yield_for: self.config.poll_interval,
                    });
                }
            }
        }

        let id = state.next_id;
        if let Some(bound) = self.config.id_upper_bound {
            if id >= bound {
                return Err(Error::IdPoolExhausted {
                    partition: self.partition,
                    reason: format!("reached id upper bound {bound}"),
                    cause: None,
                });
            }
        }
        state.next_id += 1;
        state.stats.ids_issued += 1;

        if id == state.renew_threshold
            && state.buffer.is_none()
            && state.renewal.is_none()
            && state.exhausted.is_none()
        {
            self.start_renewal(&mut state)?;
        }

        #[cfg(feature = "tracing")]
        tracing::trace!("partition({}) returned id {id}", self.partition);
        Ok(IdPoll::Ready { id })
    }

    /// Stops issuing ids, cancels the in-flight renewal and waits up to
    /// `close_timeout` for its fetch to return. That includes a fetch that
    /// callers already gave up on.
    ///
    /// Calling `close` again after it succeeded is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CloseTimeout`] if a renewal is still running when the
    /// timeout elapses.
    pub fn close(&self) -> Result<()> {
        let task = {
            let mut state = self.state.lock();
            state.closed = true;
            state.buffer = None;
            state.renewal.take()
        };

        if let Some(task) = task {
            task.cancel();
            let deadline = self
                .time
                .current_millis()
                .saturating_add(as_millis(self.config.close_timeout));
            while !task.is_finished() {
                let now = self.time.current_millis();
                if now >= deadline {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Id renewal for partition({}) still running after {:?}",
                        self.partition,
                        self.config.close_timeout
                    );
                    // Keep the handle so a later close can wait again.
                    let mut state = self.state.lock();
                    if state.renewal.is_none() {
                        state.renewal = Some(task);
                    }
                    return Err(Error::CloseTimeout {
                        partition: self.partition,
                        waited: self.config.close_timeout,
                    });
                }
                let wake = now.saturating_add(as_millis(self.config.poll_interval));
                self.time.sleep_until(wake.min(deadline));
            }
            let _ = task.join();
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Closed id pool for partition({})", self.partition);
        Ok(())
    }

    /// Tracks the caller's wait deadline and returns it, or gives up once it
    /// has passed.
    pub(crate) fn check_deadline(&self, deadline: &mut Option<u64>) -> Result<u64> {
        let now = self.time.current_millis();
        let limit = *deadline.get_or_insert_with(|| now.saturating_add(as_millis(self.config.max_wait)));
        if now >= limit {
            return Err(self.timed_out());
        }
        Ok(limit)
    }

    /// Builds the error for a caller whose wait ran out. A fetch still in
    /// flight is left running: the next caller waits on it instead of
    /// starting another, and a block it returns late is still used.
    fn timed_out(&self) -> Error {
        let mut state = self.state.lock();
        self.collect_renewal(&mut state);
        if state.renewal.is_some() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Id block allocation for partition({}) timed out after {:?}",
                self.partition,
                self.config.max_wait
            );
        }
        Error::IdPoolExhausted {
            partition: self.partition,
            reason: format!("no id block within {:?}", self.config.max_wait),
            cause: state.last_failure.clone(),
        }
    }

    fn collect_renewal(&self, state: &mut PoolState) {
        if !state.renewal.as_ref().is_some_and(RenewalTask::is_finished) {
            return;
        }
        let Some(task) = state.renewal.take() else {
            return;
        };
        match task.join() {
            RenewalOutcome::Block(block) => {
                state.buffer = Some(block);
                state.last_failure = None;
                state.retry_at = 0;
                state.retry_backoff = Duration::ZERO;
            }
            RenewalOutcome::Exhausted(err) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Id authority exhausted for partition({}): {err}", self.partition);
                state.exhausted = Some(err);
            }
            RenewalOutcome::Failed(err) => {
                let cap = MAX_RETRY_BACKOFF.max(self.config.poll_interval);
                state.retry_backoff = if state.retry_backoff.is_zero() {
                    self.config.poll_interval
                } else {
                    state.retry_backoff.saturating_mul(2).min(cap)
                };
                state.retry_at = self
                    .time
                    .current_millis()
                    .saturating_add(as_millis(state.retry_backoff));
                state.last_failure = Some(err);
            }
        }
    }

    fn rotate(&self, state: &mut PoolState, block: IdBlock) -> Result<()> {
        if block.start() < state.max_id {
            return Err(Error::invariant(format!(
                "block {block} for partition({}) starts below the previous block end {}",
                self.partition, state.max_id
            )));
        }
        state.next_id = block.start();
        state.max_id = block.end();
        state.renew_threshold = block.start() + self.config.renew_offset(block.len());
        state.stats.blocks_acquired += 1;
        debug_assert!(state.renew_threshold >= state.next_id && state.renew_threshold < state.max_id);

        #[cfg(feature = "tracing")]
        tracing::debug!("Id partition({}) acquired block {block}", self.partition);
        Ok(())
    }

    fn start_renewal(&self, state: &mut PoolState) -> Result<()> {
        debug_assert!(state.renewal.is_none());
        let task = RenewalTask::spawn(Arc::clone(&self.authority), self.partition, self.config.max_wait)?;
        state.renewal = Some(task);
        state.stats.renewals_started += 1;
        Ok(())
    }
}

impl<A, T> Drop for IdPool<A, T>
where
    A: IdAuthority + ?Sized + 'static,
    T: TimeSource,
{
    fn drop(&mut self) {
        if let Some(task) = &self.state.lock().renewal {
            task.cancel();
        }
    }
}
