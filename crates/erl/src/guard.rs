use std::sync::Arc;
use std::time::Instant;

use error_stack::{report, Result};

use crate::congestion::CongestionManager;
use crate::error::ErlError;
use crate::queue::{Capacity, CapacityQueue};

/// A handle for one outstanding unit of capacity.
///
/// Guards are created only by a successful take from a queue. Dropping a
/// guard returns its token to the originating queue, so holding the guard
/// for the duration of the work is enough to keep accounting correct;
/// [`release`](CapacityGuard::release) is the explicit form for callers
/// that want to observe a refused return.
#[must_use = "dropping a guard releases its capacity immediately"]
pub struct CapacityGuard<C> {
    token: Option<Capacity>,
    queue: CapacityQueue,
    congestion: Option<Arc<dyn CongestionManager<C>>>,
}

impl<C> CapacityGuard<C> {
    pub(crate) fn new(
        token: Capacity,
        queue: CapacityQueue,
        congestion: Option<Arc<dyn CongestionManager<C>>>,
    ) -> Self {
        Self {
            token: Some(token),
            queue,
            congestion,
        }
    }

    /// Return the capacity to the queue it was taken from.
    ///
    /// A refused return is [`ErlError::ReleaseOverflow`]: the originating
    /// queue was already full, which means token accounting is broken
    /// somewhere in the embedding program.
    pub fn release(mut self) -> Result<(), ErlError> {
        let token = self
            .token
            .take()
            .expect("token is present until release or drop");
        if self.queue.try_put(token) {
            Ok(())
        } else {
            Err(report!(ErlError::ReleaseOverflow))
        }
    }

    /// Notify the congestion manager that this capacity has been fully
    /// served, feeding the service-rate estimate. Independent of
    /// [`release`](CapacityGuard::release); call it at most once.
    pub fn served(&self) {
        if let Some(congestion) = &self.congestion {
            congestion.served(Instant::now());
        }
    }
}

impl<C> std::fmt::Debug for CapacityGuard<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapacityGuard")
            .field("released", &self.token.is_none())
            .finish_non_exhaustive()
    }
}

impl<C> Drop for CapacityGuard<C> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            if !self.queue.try_put(token) {
                tracing::error!("capacity released into a full queue, token accounting is broken");
            }
        }
    }
}
