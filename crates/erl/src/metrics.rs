//! Opaque counter sinks for admission outcomes.
//!
//! The limiter reports shared-pool exhaustion and congestion drops through
//! these sinks; wiring them into a metrics pipeline is the embedder's job.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically increasing counter.
pub trait Counter: Send + Sync {
    fn increment(&self);
}

/// Process-local counter backed by an atomic, for embedders and tests that
/// do not bring their own metrics pipeline.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Counter for AtomicCounter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}
