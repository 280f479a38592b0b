use core::{future::Future, time::Duration};

/// Abstracts over how to sleep for a given [`Duration`] in async contexts.
///
/// This lets the async id pool extension stay generic over runtimes like
/// `Tokio` or `Smol`.
pub trait SleepProvider {
    /// The returned future must be `Send` so callers can be spawned onto
    /// multi-threaded executors.
    fn sleep_for(dur: Duration) -> impl Future<Output = ()> + Send;
}
