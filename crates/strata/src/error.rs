use core::{fmt, time::Duration};
use std::sync::Arc;

/// A result type defaulting to the crate-wide [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// All errors that `strata` can produce.
///
/// Callers are expected to match on the variant: [`Error::IdPoolExhausted`]
/// means "no id could be issued in time" and is distinct from
/// [`Error::Backend`], which means "storage is unavailable right now".
#[derive(Clone, thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The id authority could not supply a new block within the configured
    /// wait, or the pool reached its id upper bound.
    ///
    /// `cause` carries the last renewal failure observed while waiting, if
    /// any.
    #[error("id pool exhausted for partition({partition}): {reason}")]
    IdPoolExhausted {
        partition: u32,
        reason: String,
        #[source]
        cause: Option<BackendError>,
    },

    /// A backing store or id authority call failed. Transient; callers retry
    /// at a higher level with their own policy.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// An internal invariant was broken (empty block, inverted range, ...).
    #[error("invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// The pool has been closed and no longer issues ids.
    #[error("id pool for partition({partition}) is closed")]
    PoolClosed { partition: u32 },

    /// `close()` gave up waiting for an in-flight renewal.
    #[error("id pool for partition({partition}) could not stop its renewal task within {waited:?}")]
    CloseTimeout { partition: u32, waited: Duration },

    /// A configuration value is out of range.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Returns `true` for [`Error::IdPoolExhausted`].
    pub const fn is_exhausted(&self) -> bool {
        matches!(self, Self::IdPoolExhausted { .. })
    }

    pub(crate) fn invariant(reason: impl Into<String>) -> Self {
        Self::InvariantViolation {
            reason: reason.into(),
        }
    }

    pub(crate) fn config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// A failure reported by an external collaborator: the backing store or the
/// id authority.
///
/// The underlying error is reference counted so that a failure observed by a
/// background renewal can be stored and later reported to every waiter.
#[derive(Clone)]
pub struct BackendError {
    message: String,
    source: Option<Arc<dyn core::error::Error + Send + Sync + 'static>>,
}

impl BackendError {
    /// Creates an error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates an error that wraps an underlying cause.
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: core::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendError")
            .field("message", &self.message)
            .field("source", &self.source.as_ref().map(ToString::to_string))
            .finish()
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backend unavailable: {}", self.message)
    }
}

impl core::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn core::error::Error + 'static))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::error::Error as _;

    #[test]
    fn exhausted_error_exposes_cause() {
        let cause = BackendError::with_source(
            "authority unreachable",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
        );
        let err = Error::IdPoolExhausted {
            partition: 3,
            reason: "no block within 50ms".into(),
            cause: Some(cause),
        };

        assert!(err.is_exhausted());
        assert_eq!(
            err.to_string(),
            "id pool exhausted for partition(3): no block within 50ms"
        );
        let source = err.source().expect("cause is attached");
        assert_eq!(source.to_string(), "backend unavailable: authority unreachable");
        assert_eq!(
            source.source().map(ToString::to_string).as_deref(),
            Some("connect timed out")
        );
    }

    #[test]
    fn backend_error_is_not_exhaustion() {
        let err: Error = BackendError::new("store down").into();
        assert!(!err.is_exhausted());
        assert_eq!(err.to_string(), "backend unavailable: store down");
    }
}
