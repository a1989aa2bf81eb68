//! Simulated backend
//!
//! Stands in for a vendor transport when exercising the scheduler: each call
//! waits a fixed latency, then is throttled, fails, or succeeds at random.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use eyre::{Result, eyre};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BackendError;

/// Behavior of the simulated backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Probability a call is answered with 429
    #[serde(rename = "throttle-rate")]
    pub throttle_rate: f64,

    /// Probability a call fails with 500
    #[serde(rename = "failure-rate")]
    pub failure_rate: f64,

    /// Time each call takes in milliseconds
    #[serde(rename = "latency-ms")]
    pub latency_ms: u64,

    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            throttle_rate: 0.2,
            failure_rate: 0.05,
            latency_ms: 50,
            seed: None,
        }
    }
}

impl SimulationConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, rate) in [("throttle-rate", self.throttle_rate), ("failure-rate", self.failure_rate)] {
            if !(0.0..=1.0).contains(&rate) {
                return Err(eyre!("{} must be between 0.0 and 1.0, got {}", name, rate));
            }
        }
        if self.throttle_rate + self.failure_rate > 1.0 {
            return Err(eyre!(
                "throttle-rate + failure-rate must not exceed 1.0, got {}",
                self.throttle_rate + self.failure_rate
            ));
        }
        Ok(())
    }
}

/// Counts a call as in flight until dropped, including when the call is cancelled
struct InFlight<'a> {
    counter: &'a AtomicUsize,
    now: usize,
}

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Self { counter, now }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-process fake of a rate-limited backend
pub struct SimulatedBackend {
    config: SimulationConfig,
    rng: Mutex<StdRng>,
    calls: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl SimulatedBackend {
    pub fn new(config: SimulationConfig) -> Arc<Self> {
        debug!(?config, "SimulatedBackend::new: called");
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Arc::new(Self {
            config,
            rng: Mutex::new(rng),
            calls: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    /// Perform one call; returns the call's sequence number on success
    pub async fn call(&self) -> Result<u64, BackendError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight::enter(&self.in_flight);
        self.peak_in_flight.fetch_max(guard.now, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;

        let roll: f64 = self.rng.lock().random();
        drop(guard);

        if roll < self.config.throttle_rate {
            debug!(n, "SimulatedBackend::call: throttled");
            Err(BackendError::throttled(format!("call {} throttled", n)))
        } else if roll < self.config.throttle_rate + self.config.failure_rate {
            debug!(n, "SimulatedBackend::call: failed");
            Err(BackendError::from_status(500, format!("call {} failed", n)))
        } else {
            Ok(n)
        }
    }

    /// A retryable unit of work that calls this backend
    pub fn work(self: &Arc<Self>) -> impl FnMut() -> BoxFuture<'static, Result<u64, BackendError>> + Send + 'static {
        let backend = Arc::clone(self);
        move || -> BoxFuture<'static, Result<u64, BackendError>> {
            let backend = Arc::clone(&backend);
            Box::pin(async move { backend.call().await })
        }
    }

    /// Calls received so far
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most calls ever in progress at once
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}
