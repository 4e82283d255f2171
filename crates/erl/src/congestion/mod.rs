//! Congestion management for shared-pool admission.
//!
//! The limiter treats its congestion manager as an advisory oracle: it
//! feeds the manager consumption and service events and asks it whether a
//! client should be refused shared capacity. Event delivery is
//! fire-and-forget and queries fail open, so a slow or stopped manager can
//! degrade the estimate but never the request path.

mod red;

pub use red::{RedConfig, RedCongestionManager};

#[cfg(test)]
pub(crate) use red::{overshoot_ratio, prune};

use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Event and policy surface a congestion manager exposes to the limiter.
#[async_trait]
pub trait CongestionManager<C>: Send + Sync {
    /// Spawn the manager's background processing. Idempotent; the manager
    /// runs until `shutdown` is cancelled. Must be called before the
    /// limiter starts gating admissions on [`should_drop`].
    ///
    /// [`should_drop`]: CongestionManager::should_drop
    fn start(&self, shutdown: CancellationToken);

    /// A client consumed capacity at `at`. Fire-and-forget; the event may
    /// be shed under load.
    fn consumed(&self, client: &C, at: Instant);

    /// A unit of capacity finished being served at `at`. Fire-and-forget;
    /// the event may be shed under load.
    fn served(&self, at: Instant);

    /// Whether the client should be refused shared-pool capacity right
    /// now. Fails open: anything preventing an answer means `false`.
    async fn should_drop(&self, client: &C) -> bool;
}

/// A consumption event attributed to one client.
#[derive(Debug)]
struct ConsumedEvent<C> {
    client: C,
    at: Instant,
}

/// A drop query awaiting a synchronous answer.
#[derive(Debug)]
struct DropQuery<C> {
    client: C,
    reply: oneshot::Sender<bool>,
}
