mod cleanup;
mod config;
mod expiration;
mod metrics;
mod shard;
#[cfg(test)]
mod tests;

pub use config::*;
pub use expiration::*;
pub use metrics::*;
