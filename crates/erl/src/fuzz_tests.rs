//! Fuzz test suite
//!
//! Exercises the RED math and the limiter's capacity accounting under
//! randomized inputs and interleavings.

use std::time::{Duration, Instant};

use proptest::prelude::*;

use crate::client::ErlClient;
use crate::congestion::{overshoot_ratio, prune};
use crate::limiter::{ElasticRateLimiter, ErlConfig};

const MAX_CAPACITY: usize = 6;
const CAPACITY_PER_RESERVATION: usize = 2;

/// Client identity with no disconnect wiring; reservations are closed
/// explicitly by the generated operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FuzzClient(u8);

impl ErlClient for FuzzClient {
    fn on_close(&self, _callback: Box<dyn FnOnce() + Send + 'static>) {}
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prune_matches_filtering_on_ordered_input(
        offsets in proptest::collection::vec(0u64..5_000, 0..50),
        cutoff_offset in 0u64..5_000,
    ) {
        let base = Instant::now();
        let mut offsets = offsets;
        offsets.sort_unstable();
        let mut timestamps: Vec<Instant> = offsets
            .iter()
            .map(|millis| base + Duration::from_millis(*millis))
            .collect();
        let cutoff = base + Duration::from_millis(cutoff_offset);
        let expected: Vec<Instant> = timestamps
            .iter()
            .copied()
            .filter(|at| *at > cutoff)
            .collect();

        let len = prune(&mut timestamps, cutoff);

        prop_assert_eq!(len, expected.len());
        prop_assert_eq!(timestamps, expected);
    }

    #[test]
    fn drop_likelihood_is_monotone_in_arrival_rate(
        low in 0.001f64..100.0,
        delta in 0.0f64..100.0,
        target in 0.001f64..100.0,
        exp in 1.0f64..8.0,
    ) {
        let high = low + delta;
        prop_assert!(
            overshoot_ratio(low, target, exp) <= overshoot_ratio(high, target, exp)
        );
    }

    #[test]
    fn capacity_is_conserved_under_random_traffic(
        ops in proptest::collection::vec(0u8..9, 1..40),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime builds");
        runtime.block_on(async move {
            let erl = ElasticRateLimiter::new(ErlConfig {
                max_capacity: MAX_CAPACITY,
                capacity_per_reservation: CAPACITY_PER_RESERVATION,
            })
            .expect("config is valid");
            let clients = [FuzzClient(0), FuzzClient(1), FuzzClient(2)];
            let mut guards = Vec::new();

            for op in ops {
                let client = clients[usize::from(op % 3)];
                match op / 3 {
                    // A first-time admission can wait on the reservation
                    // fill; bound it so sequences that exhaust the pool
                    // degrade into no-ops instead of hanging the case.
                    0 => {
                        let admission = tokio::time::timeout(
                            Duration::from_millis(20),
                            erl.consume(&client),
                        )
                        .await;
                        if let Ok(Ok(guard)) = admission {
                            guards.push(guard);
                        }
                    }
                    1 => {
                        if let Some(guard) = guards.pop() {
                            guard.release().expect("release accepted");
                        }
                    }
                    _ => erl.close_reservation(&client),
                }

                let snapshot = erl.snapshot();
                assert!(
                    snapshot.reserved_clients * CAPACITY_PER_RESERVATION <= MAX_CAPACITY,
                    "overprovisioned: {} clients reserved",
                    snapshot.reserved_clients
                );
            }

            // Quiesce: every guard home, every reservation drained.
            guards.clear();
            for client in &clients {
                erl.close_reservation(client);
            }
            let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
            while erl.snapshot().shared_available != erl.max_capacity() {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "capacity did not return to the shared pool"
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }
}
