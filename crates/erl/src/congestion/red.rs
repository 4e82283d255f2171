//! Random Early Detection congestion manager.
//!
//! A single background task owns all rate-tracking state and answers drop
//! queries with a probabilistic comparison of the client's arrival rate
//! against the average per-client service rate. Drop probability grows as
//! the `exp`-th power of the client's overshoot, so well-behaved clients
//! are barely touched while outliers are punished aggressively.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use error_stack::{report, Result};
use rand::Rng;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace};

use super::{CongestionManager, ConsumedEvent, DropQuery};
use crate::error::ErlError;

/// Tuning for the RED congestion manager.
#[derive(Debug, Clone)]
pub struct RedConfig {
    /// Sliding observation window over which arrival and service rates are
    /// computed.
    pub window: Duration,
    /// Recompute the target service rate every N loop iterations. Pruning
    /// every timestamp list is linear in the events observed, so low values
    /// trade loop throughput for estimate freshness.
    pub target_rate_refresh_ticks: usize,
    /// Unfairness exponent applied to the overshoot ratio in drop
    /// decisions. 1 is linearly proportional; higher values punish noisy
    /// neighbors harder.
    pub exp: f64,
    /// Bound on each inbound event/query channel. Events beyond the bound
    /// are shed.
    pub channel_capacity: usize,
}

impl Default for RedConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            target_rate_refresh_ticks: 100,
            exp: 4.0,
            channel_capacity: 100_000,
        }
    }
}

/// State flushed by the run loop on shutdown, kept for inspection.
#[derive(Debug)]
struct RedState<C> {
    target_rate: f64,
    consumed_by_client: HashMap<C, Vec<Instant>>,
    serves: Vec<Instant>,
}

impl<C> RedState<C> {
    fn new() -> Self {
        Self {
            target_rate: 0.0,
            consumed_by_client: HashMap::new(),
            serves: Vec::new(),
        }
    }
}

/// Random Early Detection congestion manager.
///
/// Watches capacity-guard activity, periodically recalculates a target
/// service rate, and gives should-drop suggestions proportional to each
/// client's overshoot above that target.
pub struct RedCongestionManager<C> {
    cfg: RedConfig,
    consumed_tx: Sender<ConsumedEvent<C>>,
    consumed_rx: Receiver<ConsumedEvent<C>>,
    served_tx: Sender<Instant>,
    served_rx: Receiver<Instant>,
    query_tx: Sender<DropQuery<C>>,
    query_rx: Receiver<DropQuery<C>>,
    running: Arc<Mutex<bool>>,
    state: Arc<Mutex<RedState<C>>>,
}

impl<C> std::fmt::Debug for RedCongestionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedCongestionManager")
            .field("cfg", &self.cfg)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl<C> RedCongestionManager<C> {
    /// Create a manager with the given observation window and refresh
    /// cadence, using defaults for the rest.
    pub fn new(window: Duration, target_rate_refresh_ticks: usize) -> Result<Self, ErlError> {
        Self::with_config(RedConfig {
            window,
            target_rate_refresh_ticks,
            ..RedConfig::default()
        })
    }

    pub fn with_config(cfg: RedConfig) -> Result<Self, ErlError> {
        if cfg.window.is_zero() {
            return Err(report!(ErlError::invalid_config(
                "window must be greater than zero"
            )));
        }
        if cfg.target_rate_refresh_ticks == 0 {
            return Err(report!(ErlError::invalid_config(
                "target_rate_refresh_ticks must be at least 1"
            )));
        }
        if cfg.exp <= 0.0 {
            return Err(report!(ErlError::invalid_config(
                "exp must be greater than zero"
            )));
        }
        if cfg.channel_capacity == 0 {
            return Err(report!(ErlError::invalid_config(
                "channel_capacity must be at least 1"
            )));
        }

        let (consumed_tx, consumed_rx) = async_channel::bounded(cfg.channel_capacity);
        let (served_tx, served_rx) = async_channel::bounded(cfg.channel_capacity);
        let (query_tx, query_rx) = async_channel::bounded(cfg.channel_capacity);
        Ok(Self {
            cfg,
            consumed_tx,
            consumed_rx,
            served_tx,
            served_rx,
            query_tx,
            query_rx,
            running: Arc::new(Mutex::new(false)),
            state: Arc::new(Mutex::new(RedState::new())),
        })
    }

    /// Whether the run loop is currently active.
    pub fn is_running(&self) -> bool {
        *self.running.lock().expect("red run lock poisoned")
    }

    /// The last target service rate flushed by the run loop, in services
    /// per second per active client. Meaningful after shutdown.
    pub fn target_rate(&self) -> f64 {
        self.state.lock().expect("red state lock poisoned").target_rate
    }
}

#[async_trait]
impl<C> CongestionManager<C> for RedCongestionManager<C>
where
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn start(&self, shutdown: CancellationToken) {
        let mut running = self.running.lock().expect("red run lock poisoned");
        if *running {
            return;
        }
        *running = true;
        drop(running);

        info!(
            window_secs = self.cfg.window.as_secs_f64(),
            exp = self.cfg.exp,
            "starting RED congestion manager"
        );
        let worker = RedWorker {
            cfg: self.cfg.clone(),
            consumed_rx: self.consumed_rx.clone(),
            served_rx: self.served_rx.clone(),
            query_rx: self.query_rx.clone(),
            running: Arc::clone(&self.running),
            state: Arc::clone(&self.state),
        };
        tokio::spawn(worker.run(shutdown));
    }

    fn consumed(&self, client: &C, at: Instant) {
        if self
            .consumed_tx
            .try_send(ConsumedEvent {
                client: client.clone(),
                at,
            })
            .is_err()
        {
            trace!("consumed event shed, channel full");
        }
    }

    fn served(&self, at: Instant) {
        if self.served_tx.try_send(at).is_err() {
            trace!("served event shed, channel full");
        }
    }

    async fn should_drop(&self, client: &C) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();
        let query = DropQuery {
            client: client.clone(),
            reply: reply_tx,
        };
        // Fail open: a saturated query channel or a reply dropped by a
        // stopping loop both mean "do not drop".
        if self.query_tx.try_send(query).is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }
}

/// The single writer: owns every piece of mutable rate-tracking state for
/// the duration of the loop.
struct RedWorker<C> {
    cfg: RedConfig,
    consumed_rx: Receiver<ConsumedEvent<C>>,
    served_rx: Receiver<Instant>,
    query_rx: Receiver<DropQuery<C>>,
    running: Arc<Mutex<bool>>,
    state: Arc<Mutex<RedState<C>>>,
}

impl<C> RedWorker<C>
where
    C: Clone + Eq + Hash + Send + Sync + 'static,
{
    async fn run(self, shutdown: CancellationToken) {
        let mut tick = 0usize;
        let mut target_rate = 0.0f64;
        let mut consumed_by_client: HashMap<C, Vec<Instant>> = HashMap::new();
        let mut serves: Vec<Instant> = Vec::new();
        let mut exit = false;
        loop {
            tokio::select! {
                event = self.consumed_rx.recv() => match event {
                    Ok(ConsumedEvent { client, at }) => {
                        consumed_by_client.entry(client).or_default().push(at);
                    }
                    Err(_) => exit = true,
                },
                at = self.served_rx.recv() => match at {
                    Ok(at) => serves.push(at),
                    Err(_) => exit = true,
                },
                query = self.query_rx.recv() => match query {
                    Ok(DropQuery { client, reply }) => {
                        if let Some(cutoff) = Instant::now().checked_sub(self.cfg.window) {
                            if let Some(arrivals) = consumed_by_client.get_mut(&client) {
                                prune(arrivals, cutoff);
                            }
                        }
                        let arrivals = consumed_by_client.get(&client).map_or(0, Vec::len);
                        let _ = reply.send(self.decide_drop(target_rate, arrivals));
                    }
                    Err(_) => exit = true,
                },
                _ = shutdown.cancelled() => exit = true,
            }

            tick = (tick + 1) % self.cfg.target_rate_refresh_ticks;
            // Recalculating the service rate requires pruning every
            // timestamp list, so it only happens every N ticks.
            if tick == 0 || exit {
                if let Some(cutoff) = Instant::now().checked_sub(self.cfg.window) {
                    prune(&mut serves, cutoff);
                    consumed_by_client.retain(|_, arrivals| prune(arrivals, cutoff) != 0);
                }
                // Target rate is the average service rate per active client
                // per second.
                target_rate = 0.0;
                if !consumed_by_client.is_empty() {
                    let service_rate = serves.len() as f64 / self.cfg.window.as_secs_f64();
                    target_rate = service_rate / consumed_by_client.len() as f64;
                }
                trace!(
                    target_rate,
                    active_clients = consumed_by_client.len(),
                    "recomputed target service rate"
                );
            }

            if exit {
                let mut state = self.state.lock().expect("red state lock poisoned");
                state.target_rate = target_rate;
                state.consumed_by_client = consumed_by_client;
                state.serves = serves;
                drop(state);
                *self.running.lock().expect("red run lock poisoned") = false;
                info!("RED congestion manager stopped");
                return;
            }
        }
    }

    fn decide_drop(&self, target_rate: f64, arrivals_in_window: usize) -> bool {
        let client_rate = arrivals_in_window as f64 / self.cfg.window.as_secs_f64();
        // Clients that have never been seen in the window are not dropped.
        if client_rate == 0.0 {
            return false;
        }
        // Drop proportionally to the client's overuse above the target
        // rate. A zero target means no services completed in the window;
        // the ratio is infinite and the client is always dropped.
        let draw = rand::rng().random::<f64>();
        overshoot_ratio(client_rate, target_rate, self.cfg.exp) > draw
    }
}

/// The drop-probability numerator: `(client_rate / target_rate)^exp`.
pub(crate) fn overshoot_ratio(client_rate: f64, target_rate: f64, exp: f64) -> f64 {
    client_rate.powf(exp) / target_rate.powf(exp)
}

/// Truncate everything at or before `cutoff` and return the new length.
/// Lists are appended in timestamp order, so the stale prefix is the
/// longest prefix of elements `<= cutoff`.
pub(crate) fn prune(timestamps: &mut Vec<Instant>, cutoff: Instant) -> usize {
    let keep_from = timestamps
        .iter()
        .position(|at| *at > cutoff)
        .unwrap_or(timestamps.len());
    timestamps.drain(..keep_from);
    timestamps.len()
}
