//! Pause gate
//!
//! A process-local on/off switch. Both pipelines consult it before doing
//! work that costs something downstream (polling targets, pushing to the
//! gateway). Transitions are logged at warn and mirrored to a gauge.

use parking_lot::Mutex;
use prometheus::Gauge;
use streams_core::Pausable;
use tracing::warn;

/// Thread-safe pause switch
#[derive(Default)]
pub struct CircuitBreaker {
    paused: Mutex<bool>,
    gauge: Option<Gauge>,
}

impl CircuitBreaker {
    /// Create an unpaused gate without a metric
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror the paused state to `gauge` (1 paused, 0 running)
    pub fn with_gauge(mut self, gauge: Gauge) -> Self {
        gauge.set(0.0);
        self.gauge = Some(gauge);
        self
    }

    /// Apply a transition while holding the lock
    fn set(&self, paused: &mut bool, value: bool) {
        *paused = value;
        if let Some(gauge) = &self.gauge {
            gauge.set(if value { 1.0 } else { 0.0 });
        }
        if value {
            warn!("Pausing via the circuit breaker");
        } else {
            warn!("Resuming via the circuit breaker");
        }
    }
}

impl Pausable for CircuitBreaker {
    fn pause(&self) {
        let mut paused = self.paused.lock();
        self.set(&mut paused, true);
    }

    fn resume(&self) {
        let mut paused = self.paused.lock();
        self.set(&mut paused, false);
    }

    fn flip(&self) {
        let mut paused = self.paused.lock();
        let next = !*paused;
        self.set(&mut paused, next);
    }

    fn paused(&self) -> bool {
        *self.paused.lock()
    }
}
