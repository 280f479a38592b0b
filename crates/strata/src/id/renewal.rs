use core::time::Duration;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{BackendError, Error, Result},
    id::{IdAuthority, IdBlock},
};

/// What a finished renewal produced.
#[derive(Debug)]
pub(crate) enum RenewalOutcome {
    /// A fresh block, ready to become the pool's buffer.
    Block(IdBlock),
    /// The authority has no more ids for this partition. Permanent.
    Exhausted(Error),
    /// A transient failure; retried after a backoff once a block is needed.
    Failed(BackendError),
}

/// Handle to a single in-flight block fetch.
///
/// The fetch runs on its own worker so that callers of `next_id` never
/// block on the authority while ids remain in the current block. The handle
/// can be polled for completion, joined once finished, and cancelled
/// cooperatively; a cancelled fetch discards whatever it retrieves.
#[derive(Debug)]
pub(crate) struct RenewalTask {
    token: CancellationToken,
    handle: JoinHandle<RenewalOutcome>,
}

impl RenewalTask {
    pub(crate) fn spawn<A>(authority: Arc<A>, partition: u32, timeout: Duration) -> Result<Self>
    where
        A: IdAuthority + ?Sized + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();
        let handle = thread::Builder::new()
            .name(format!("strata-id-renew({partition})"))
            .spawn(move || fetch(&*authority, partition, timeout, &child))
            .map_err(|e| BackendError::with_source("failed to spawn id renewal worker", e))?;

        #[cfg(feature = "tracing")]
        tracing::debug!("Started id block renewal for partition({partition})");

        Ok(Self { token, handle })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the worker and returns its outcome. Only blocks if the task
    /// has not finished yet; callers check [`Self::is_finished`] first.
    pub(crate) fn join(self) -> RenewalOutcome {
        self.handle.join().unwrap_or_else(|_| {
            RenewalOutcome::Failed(BackendError::new("id renewal worker panicked"))
        })
    }
}

fn fetch<A>(
    authority: &A,
    partition: u32,
    timeout: Duration,
    token: &CancellationToken,
) -> RenewalOutcome
where
    A: IdAuthority + ?Sized,
{
    if token.is_cancelled() {
        return RenewalOutcome::Failed(BackendError::new(
            "id block retrieval aborted by caller",
        ));
    }

    match authority.fetch_block(partition, timeout) {
        Ok(block) if token.is_cancelled() => {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Discarding block {block} for partition({partition}) retrieved after cancellation"
            );
            #[cfg(not(feature = "tracing"))]
            let _ = block;
            RenewalOutcome::Failed(BackendError::new("id block retrieved after cancellation"))
        }
        Ok(block) => {
            #[cfg(feature = "tracing")]
            tracing::debug!("Retrieved id block {block} for partition({partition})");
            RenewalOutcome::Block(block)
        }
        Err(e @ Error::IdPoolExhausted { .. }) => RenewalOutcome::Exhausted(e),
        Err(Error::Backend(e)) => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Id block renewal for partition({partition}) failed: {e}");
            RenewalOutcome::Failed(e)
        }
        Err(e) => RenewalOutcome::Failed(BackendError::with_source("id authority failed", e)),
    }
}
