use core::time::Duration;
use smol::Timer;

use crate::futures::SleepProvider;

/// Waits out the pool's suggested back-off on a Smol timer. Use this one
/// unless there is a reason not to.
pub struct SmolSleep;
impl SleepProvider for SmolSleep {
    async fn sleep_for(dur: Duration) {
        Timer::after(dur).await;
    }
}

/// Ignores the suggested back-off and just yields to the Smol scheduler.
pub struct SmolYield;
impl SleepProvider for SmolYield {
    async fn sleep_for(_dur: Duration) {
        smol::future::yield_now().await;
    }
}
