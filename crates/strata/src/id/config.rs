use core::time::Duration;

use crate::error::{Error, Result};

/// Minimum number of ids left in the current block when renewal starts.
pub const RENEW_ID_COUNT: u64 = 100;

/// Tunables for an [`IdPool`].
///
/// # Example
///
/// ```
/// use core::time::Duration;
/// use strata::IdPoolConfig;
///
/// let config = IdPoolConfig::default()
///     .with_renew_id_count(5)
///     .with_max_wait(Duration::from_millis(500));
/// assert!(config.validate().is_ok());
/// ```
///
/// [`IdPool`]: crate::IdPool
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IdPoolConfig {
    /// Renewal starts once at most this many ids remain in the block.
    pub renew_id_count: u64,
    /// Renewal starts once at most this fraction of the block remains,
    /// whichever of the two leaves more headroom. `0.0` disables it.
    pub renew_buffer_fraction: f64,
    /// How long a caller waits for a new block before failing.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub max_wait: Duration,
    /// Back-off between checks while waiting for a block.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub poll_interval: Duration,
    /// How long `close()` waits for in-flight renewals.
    #[cfg_attr(feature = "serde", serde(with = "millis"))]
    pub close_timeout: Duration,
    /// Ids at or above this value are never issued.
    pub id_upper_bound: Option<u64>,
}

impl Default for IdPoolConfig {
    fn default() -> Self {
        Self {
            renew_id_count: RENEW_ID_COUNT,
            renew_buffer_fraction: 0.3,
            max_wait: Duration::from_secs(120),
            poll_interval: Duration::from_millis(10),
            close_timeout: Duration::from_secs(5),
            id_upper_bound: None,
        }
    }
}

impl IdPoolConfig {
    #[must_use]
    pub const fn with_renew_id_count(mut self, count: u64) -> Self {
        self.renew_id_count = count;
        self
    }

    #[must_use]
    pub const fn with_renew_buffer_fraction(mut self, fraction: f64) -> Self {
        self.renew_buffer_fraction = fraction;
        self
    }

    #[must_use]
    pub const fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_id_upper_bound(mut self, bound: u64) -> Self {
        self.id_upper_bound = Some(bound);
        self
    }

    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.renew_id_count == 0 {
            return Err(Error::config("renew_id_count must be positive"));
        }
        if !(0.0..=1.0).contains(&self.renew_buffer_fraction) {
            return Err(Error::config(format!(
                "renew_buffer_fraction must be within [0, 1], got {}",
                self.renew_buffer_fraction
            )));
        }
        if self.max_wait.is_zero() {
            return Err(Error::config("max_wait must be positive"));
        }
        if self.poll_interval.is_zero() || self.poll_interval > self.max_wait {
            return Err(Error::config("poll_interval must be within (0, max_wait]"));
        }
        if self.id_upper_bound == Some(0) {
            return Err(Error::config("id_upper_bound must be positive"));
        }
        Ok(())
    }

    /// Number of ids of a block of `len` ids that may be handed out before
    /// renewal starts.
    pub(crate) fn renew_offset(&self, len: u64) -> u64 {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let by_fraction = (len as f64 * self.renew_buffer_fraction).round() as u64;
        len.saturating_sub(self.renew_id_count.max(by_fraction))
    }
}

#[cfg(feature = "serde")]
pub(crate) mod millis {
    use core::time::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        #[allow(clippy::cast_possible_truncation)]
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
