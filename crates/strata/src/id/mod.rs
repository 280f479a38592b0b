mod authority;
mod block;
mod config;
mod partitioned;
mod pool;
mod renewal;

pub use authority::*;
pub use block::*;
pub use config::*;
pub use partitioned::*;
pub use pool::{IdPool, IdPoll, IdPoolStats};
#[cfg(feature = "serde")]
pub(crate) use config::millis;
