//! Elastic rate limiting with RED congestion management.
//!
//! This crate provides two main components:
//! - [`ElasticRateLimiter`]: admission control over a finite pool of
//!   capacity, split into per-client reservations and a shared pool
//! - [`RedCongestionManager`]: a Random Early Detection policy that drops
//!   noisy neighbors probabilistically when they overshoot the average
//!   service rate
//!
//! Each admitted request receives a [`CapacityGuard`] that returns its
//! capacity on release (or drop). Capacity never refills on a timer; it
//! only comes back when a consumer releases its guard. Custom congestion
//! policies plug in through the [`CongestionManager`] trait.

mod client;
mod congestion;
mod error;
mod guard;
mod limiter;
mod metrics;
mod queue;

#[cfg(test)]
mod fuzz_tests;

pub use client::ErlClient;
pub use congestion::{CongestionManager, RedCongestionManager, RedConfig};
pub use error::ErlError;
pub use guard::CapacityGuard;
pub use limiter::{ElasticRateLimiter, ErlConfig, LimiterSnapshot};
pub use metrics::{AtomicCounter, Counter};
