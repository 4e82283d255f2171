//! The elastic rate limiter: a shared capacity pool with per-client
//! reservations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use error_stack::{report, Result, ResultExt};
use tracing::debug;

use crate::client::ErlClient;
use crate::congestion::CongestionManager;
use crate::error::ErlError;
use crate::guard::CapacityGuard;
use crate::metrics::Counter;
use crate::queue::CapacityQueue;

/// Capacity sizing for the limiter.
#[derive(Debug, Clone)]
pub struct ErlConfig {
    /// Total capacity tokens in the system.
    pub max_capacity: usize,
    /// Tokens set aside for each client holding a reservation.
    pub capacity_per_reservation: usize,
}

impl Default for ErlConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100,
            capacity_per_reservation: 10,
        }
    }
}

/// A point-in-time view of the limiter's capacity accounting.
///
/// Not guaranteed to be consistent under concurrent traffic; background
/// transfer tasks may hold tokens in flight between queues.
#[derive(Debug, Clone, Copy)]
pub struct LimiterSnapshot {
    /// Tokens currently available in the shared pool.
    pub shared_available: usize,
    /// Clients currently holding a reservation.
    pub reserved_clients: usize,
}

/// State guarded by the client lock: the reservation map and the
/// congestion toggle are read together on every admission.
struct ClientState<C> {
    reservations: HashMap<C, CapacityQueue>,
    congestion_enabled: bool,
}

/// The part of the limiter shared with reservation-close callbacks.
struct LimiterInner<C> {
    max_capacity: usize,
    capacity_per_reservation: usize,
    shared: CapacityQueue,
    clients: RwLock<ClientState<C>>,
}

/// Holds and distributes capacity through per-client reservations and a
/// shared pool.
///
/// Every admitted request receives a [`CapacityGuard`] which returns the
/// capacity when released. A client is guaranteed its reservation
/// regardless of global load; once the reservation is exhausted it may
/// borrow from the shared pool, subject to the congestion manager's
/// verdict when congestion control is enabled.
pub struct ElasticRateLimiter<C: ErlClient> {
    inner: Arc<LimiterInner<C>>,
    congestion: Option<Arc<dyn CongestionManager<C>>>,
    no_capacity_counter: Option<Arc<dyn Counter>>,
    congestion_counter: Option<Arc<dyn Counter>>,
}

impl<C: ErlClient> std::fmt::Debug for ElasticRateLimiter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticRateLimiter")
            .field("max_capacity", &self.inner.max_capacity)
            .field(
                "capacity_per_reservation",
                &self.inner.capacity_per_reservation,
            )
            .field("shared_available", &self.inner.shared.len())
            .finish_non_exhaustive()
    }
}

impl<C: ErlClient> Clone for ElasticRateLimiter<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            congestion: self.congestion.clone(),
            no_capacity_counter: self.no_capacity_counter.clone(),
            congestion_counter: self.congestion_counter.clone(),
        }
    }
}

impl<C: ErlClient> ElasticRateLimiter<C> {
    /// Build a limiter with a full shared pool and no reservations.
    pub fn new(config: ErlConfig) -> Result<Self, ErlError> {
        if config.max_capacity == 0 {
            return Err(report!(ErlError::invalid_config(
                "max_capacity must be at least 1"
            )));
        }
        if config.capacity_per_reservation == 0 {
            // A zero-token reservation could never serve its first
            // admission: the blocking take would wait forever.
            return Err(report!(ErlError::invalid_config(
                "capacity_per_reservation must be at least 1"
            )));
        }
        if config.capacity_per_reservation > config.max_capacity {
            return Err(report!(ErlError::invalid_config(
                "capacity_per_reservation cannot exceed max_capacity"
            )));
        }
        Ok(Self {
            inner: Arc::new(LimiterInner {
                max_capacity: config.max_capacity,
                capacity_per_reservation: config.capacity_per_reservation,
                shared: CapacityQueue::filled(config.max_capacity),
                clients: RwLock::new(ClientState {
                    reservations: HashMap::new(),
                    congestion_enabled: false,
                }),
            }),
            congestion: None,
            no_capacity_counter: None,
            congestion_counter: None,
        })
    }

    /// Attach a congestion manager consulted at the reservation/shared
    /// boundary. The manager must be started separately.
    pub fn with_congestion_manager(mut self, manager: Arc<dyn CongestionManager<C>>) -> Self {
        self.congestion = Some(manager);
        self
    }

    /// Counter incremented whenever the shared pool is exhausted.
    pub fn with_no_capacity_counter(mut self, counter: Arc<dyn Counter>) -> Self {
        self.no_capacity_counter = Some(counter);
        self
    }

    /// Counter incremented whenever the congestion manager drops a client.
    pub fn with_congestion_counter(mut self, counter: Arc<dyn Counter>) -> Self {
        self.congestion_counter = Some(counter);
        self
    }

    /// Start consulting the congestion manager on shared-pool borrows.
    pub fn enable_congestion_control(&self) {
        self.inner
            .clients
            .write()
            .expect("client lock poisoned")
            .congestion_enabled = true;
    }

    /// Stop consulting the congestion manager.
    pub fn disable_congestion_control(&self) {
        self.inner
            .clients
            .write()
            .expect("client lock poisoned")
            .congestion_enabled = false;
    }

    /// Dispense one unit of capacity to `client`.
    ///
    /// Capacity comes from the client's reservation first, then from the
    /// shared pool. The only suspension point is a first-time client's
    /// wait for its reservation to fill; the future is cancel-safe, so
    /// callers may bound that wait with a timeout.
    pub async fn consume(&self, client: &C) -> Result<CapacityGuard<C>, ErlError> {
        let (reservation, congestion_enabled) = {
            let state = self.inner.clients.read().expect("client lock poisoned");
            (
                state.reservations.get(client).cloned(),
                state.congestion_enabled,
            )
        };

        // First sight of this client: open a reservation and wait for the
        // background fill to hand over a first token, so the initial
        // admission cannot spuriously fail on an still-empty queue.
        let Some(reservation) = reservation else {
            let reservation = self.inner.open_reservation(client.clone())?;
            let inner = Arc::downgrade(&self.inner);
            let closing = client.clone();
            client.on_close(Box::new(move || {
                if let Some(inner) = inner.upgrade() {
                    inner.close_reservation(&closing);
                }
            }));
            let token = reservation.take().await;
            return Ok(CapacityGuard::new(
                token,
                reservation,
                self.congestion.clone(),
            ));
        };

        if let Some(token) = reservation.try_take() {
            if let Some(congestion) = &self.congestion {
                congestion.consumed(client, Instant::now());
            }
            return Ok(CapacityGuard::new(
                token,
                reservation,
                self.congestion.clone(),
            ));
        }

        // The reservation is exhausted; borrowing from the shared pool is
        // gated by the congestion manager when enabled.
        if congestion_enabled {
            if let Some(congestion) = &self.congestion {
                if congestion.should_drop(client).await {
                    if let Some(counter) = &self.congestion_counter {
                        counter.increment();
                    }
                    debug!("congestion manager refused shared-pool capacity");
                    return Err(report!(ErlError::CongestionDrop));
                }
            }
        }

        match self.inner.shared.try_take() {
            Some(token) => {
                if let Some(congestion) = &self.congestion {
                    congestion.consumed(client, Instant::now());
                }
                Ok(CapacityGuard::new(
                    token,
                    self.inner.shared.clone(),
                    self.congestion.clone(),
                ))
            }
            None => {
                if let Some(counter) = &self.no_capacity_counter {
                    counter.increment();
                }
                Err(report!(ErlError::NoCapacity))
            }
        }
    }

    /// A point-in-time view of capacity accounting.
    pub fn snapshot(&self) -> LimiterSnapshot {
        LimiterSnapshot {
            shared_available: self.inner.shared.len(),
            reserved_clients: self
                .inner
                .clients
                .read()
                .expect("client lock poisoned")
                .reservations
                .len(),
        }
    }

    /// Total capacity tokens in the system.
    pub fn max_capacity(&self) -> usize {
        self.inner.max_capacity
    }

    pub(crate) fn close_reservation(&self, client: &C) {
        self.inner.close_reservation(client);
    }

    #[cfg(test)]
    fn reservation_available(&self, client: &C) -> Option<usize> {
        self.inner
            .clients
            .read()
            .expect("client lock poisoned")
            .reservations
            .get(client)
            .map(CapacityQueue::len)
    }
}

impl<C: ErlClient> LimiterInner<C> {
    /// Create a reservation for `client` and start filling it from the
    /// shared pool.
    fn open_reservation(&self, client: C) -> Result<CapacityQueue, ErlError> {
        let reservation = {
            let mut state = self.clients.write().expect("client lock poisoned");
            if state.reservations.contains_key(&client) {
                return Err(report!(ErlError::AlreadyReserved));
            }
            // Guard against overprovisioning: every reservation must be
            // fully fundable from capacity not promised to anyone else.
            let reserved = self.capacity_per_reservation * state.reservations.len();
            let remaining = self.max_capacity.saturating_sub(reserved);
            if self.capacity_per_reservation > remaining {
                return Err(report!(ErlError::NoCapacity).attach_printable(format!(
                    "cannot reserve capacity: {remaining} remaining, {} requested",
                    self.capacity_per_reservation
                )));
            }
            let reservation = CapacityQueue::bounded(self.capacity_per_reservation);
            state.reservations.insert(client, reservation.clone());
            reservation
        };
        debug!(
            capacity = self.capacity_per_reservation,
            "opened client reservation"
        );

        // Move tokens from the shared pool one at a time, off the caller's
        // path. A token in flight between the queues counts as outstanding.
        let shared = self.shared.clone();
        let fill = reservation.clone();
        let count = self.capacity_per_reservation;
        tokio::spawn(async move {
            for _ in 0..count {
                let token = shared.take().await;
                fill.put(token).await;
            }
        });
        Ok(reservation)
    }

    /// Remove `client`'s reservation and drain it back into the shared
    /// pool. No-op for clients without a reservation.
    ///
    /// Guards taken from the closed reservation still reference its queue,
    /// so the drain simply waits for any outstanding capacity to come home
    /// before moving it; the task lives until the last guard returns.
    fn close_reservation(&self, client: &C) {
        let removed = self
            .clients
            .write()
            .expect("client lock poisoned")
            .reservations
            .remove(client);
        let Some(reservation) = removed else {
            return;
        };
        debug!("closing client reservation");

        let shared = self.shared.clone();
        let count = self.capacity_per_reservation;
        tokio::spawn(async move {
            for _ in 0..count {
                let token = reservation.take().await;
                shared.put(token).await;
            }
        });
    }
}
