//! Storage-engine primitives for a graph database backend.
//!
//! - [`IdPool`]: hands out unique, strictly increasing ids per partition from
//!   blocks reserved through an [`IdAuthority`], renewing the next block in
//!   the background before the current one runs out.
//! - [`ExpirationCache`]: a byte-bounded, time-expiring read cache in front of
//!   a [`KeyColumnValueStore`] that invalidates keys on write and refuses to
//!   re-cache them for a short grace window.
//!
//! Both read time through a [`TimeSource`], so tests can drive them with a
//! [`ManualClock`].

mod cache;
mod error;
#[cfg(feature = "futures")]
mod futures;
mod id;
mod store;
mod time;

pub use crate::cache::*;
pub use crate::error::*;
#[cfg(feature = "futures")]
pub use crate::futures::*;
pub use crate::id::*;
pub use crate::store::*;
pub use crate::time::*;
