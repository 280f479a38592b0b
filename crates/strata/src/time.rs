use core::time::Duration;
use portable_atomic::{AtomicBool, AtomicU64, Ordering};
use std::{
    sync::{Arc, Weak},
    thread,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// A source of millisecond timestamps that can also put the caller to sleep.
///
/// Both the id pool (renewal wait and back-off) and the expiring cache
/// (freshness and grace windows) read time exclusively through this trait,
/// so tests can substitute a [`ManualClock`].
///
/// # Example
///
/// ```
/// use strata::TimeSource;
///
/// struct FixedTime;
/// impl TimeSource for FixedTime {
///     fn current_millis(&self) -> u64 {
///         1234
///     }
/// }
///
/// assert_eq!(FixedTime.current_millis(), 1234);
/// ```
pub trait TimeSource: Send + Sync {
    /// Returns the current time in milliseconds since the configured origin.
    fn current_millis(&self) -> u64;

    /// Blocks the calling thread until [`Self::current_millis`] reaches
    /// `millis`. Returns immediately if that time has already passed.
    fn sleep_until(&self, millis: u64) {
        loop {
            let now = self.current_millis();
            if now >= millis {
                return;
            }
            thread::sleep(Duration::from_millis(millis - now));
        }
    }
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn current_millis(&self) -> u64 {
        (**self).current_millis()
    }

    fn sleep_until(&self, millis: u64) {
        (**self).sleep_until(millis);
    }
}

/// Milliseconds elapsed since `origin`, refreshed by a ticker thread.
#[derive(Debug)]
struct Ticker {
    origin: Instant,
    elapsed: AtomicU64,
    // False when the ticker thread could not be started; readers then fall
    // back to `origin.elapsed()`.
    live: AtomicBool,
}

impl Ticker {
    fn elapsed_millis(&self) -> u64 {
        if self.live.load(Ordering::Acquire) {
            self.elapsed.load(Ordering::Relaxed)
        } else {
            as_millis(self.origin.elapsed())
        }
    }

    /// Runs until every [`MonotonicClock`] sharing this ticker is dropped.
    fn run(ticker: &Weak<Self>) {
        let mut next = 0u64;
        while let Some(ticker) = ticker.upgrade() {
            let due = ticker.origin + Duration::from_millis(next);
            if let Some(wait) = due.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            }
            let elapsed = as_millis(ticker.origin.elapsed());
            ticker.elapsed.store(elapsed, Ordering::Relaxed);
            next = elapsed + 1;
        }
    }
}

/// A monotonic [`TimeSource`]: milliseconds since a fixed epoch, advanced by
/// [`Instant`] rather than the wall clock, so NTP steps never move it
/// backwards.
///
/// The wall clock is read once, at construction, to place the origin. After
/// that a shared background thread refreshes an atomic counter every
/// millisecond and reading the clock is a single load. Clones share the
/// ticker; the thread exits after the last clone is dropped.
#[derive(Clone, Debug)]
pub struct MonotonicClock {
    ticker: Arc<Ticker>,
    offset_millis: u64,
}

impl Default for MonotonicClock {
    /// A clock counting from the Unix epoch.
    fn default() -> Self {
        Self::with_epoch(Duration::ZERO)
    }
}

impl MonotonicClock {
    /// A clock counting from `epoch`, given as a [`Duration`] since
    /// 1970-01-01 UTC. If the system clock reads earlier than `epoch`, the
    /// clock starts at zero.
    pub fn with_epoch(epoch: Duration) -> Self {
        let origin = Instant::now();
        let since_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let ticker = Arc::new(Ticker {
            origin,
            elapsed: AtomicU64::new(0),
            live: AtomicBool::new(true),
        });

        let weak = Arc::downgrade(&ticker);
        if let Err(_e) = thread::Builder::new()
            .name("strata-clock".into())
            .spawn(move || Ticker::run(&weak))
        {
            #[cfg(feature = "tracing")]
            tracing::warn!("Clock ticker unavailable, reading Instant directly: {_e}");
            ticker.live.store(false, Ordering::Release);
        }

        Self {
            ticker,
            offset_millis: as_millis(since_unix.saturating_sub(epoch)),
        }
    }
}

impl TimeSource for MonotonicClock {
    fn current_millis(&self) -> u64 {
        self.offset_millis + self.ticker.elapsed_millis()
    }
}

#[allow(clippy::cast_possible_truncation)]
pub(crate) const fn as_millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// A clock that only moves when told to.
///
/// [`TimeSource::sleep_until`] jumps the clock forward to the requested time
/// and yields the thread, so code that waits on time makes progress without
/// real sleeping. Clones share the same underlying time.
#[derive(Clone, Debug, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    /// Moves the clock forward by `millis`.
    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::AcqRel);
    }

    /// Sets the clock to `millis` unless it is already later.
    pub fn set(&self, millis: u64) {
        self.now.fetch_max(millis, Ordering::AcqRel);
    }
}

impl TimeSource for ManualClock {
    fn current_millis(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }

    fn sleep_until(&self, millis: u64) {
        self.set(millis);
        thread::yield_now();
    }
}
