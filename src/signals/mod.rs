//! Load signals sampled from the metrics endpoint and their throttle curve.

pub mod poller;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Deserialize;

fn default_curve() -> f64 {
    4.0
}

/// One configured load signal.
#[derive(Clone, Debug, Deserialize)]
pub struct SignalSpec {
    /// Instant query forwarded verbatim to the metrics endpoint.
    pub query: String,

    /// Label for per-signal operational counters; unnamed signals emit none.
    #[serde(default)]
    pub name: Option<String>,

    /// Value at which throttling starts.
    pub warn: f64,

    /// Value at which throttling saturates.
    pub emergency: f64,

    /// Steepness of the ramp between `warn` and `emergency`.
    #[serde(default = "default_curve")]
    pub curve: f64,
}

impl SignalSpec {
    /// Throttle response for a sampled value: flat zero up to `warn`,
    /// saturated at `emergency`, exponential ramp between.
    pub fn throttle(&self, value: f64) -> f64 {
        if value <= self.warn {
            return 0.0;
        }
        if value >= self.emergency {
            return 1.0;
        }
        let load_factor = (value - self.warn) / (self.emergency - self.warn);
        1.0 - (-self.curve * load_factor).exp()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.query.is_empty() {
            return Err("signal query must not be empty".to_owned());
        }
        if self.warn < 0.0 {
            return Err(format!("signal warn {} must be non-negative", self.warn));
        }
        if self.emergency <= self.warn {
            return Err(format!(
                "signal emergency {} must exceed warn {}",
                self.emergency, self.warn
            ));
        }
        if self.curve < 0.0 {
            return Err(format!("signal curve {} must be non-negative", self.curve));
        }
        Ok(())
    }
}

/// Shared slot holding one signal's most recent throttle. The poller that owns
/// the signal writes it; the controller scans all slots without holding its
/// admission lock.
#[derive(Debug)]
pub struct SignalState {
    spec: SignalSpec,
    throttle_bits: AtomicU64,
}

impl SignalState {
    pub fn new(spec: SignalSpec) -> Self {
        Self {
            spec,
            throttle_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn spec(&self) -> &SignalSpec {
        &self.spec
    }

    /// The most recent throttle, zero until the first successful sample.
    pub fn throttle(&self) -> f64 {
        f64::from_bits(self.throttle_bits.load(Ordering::Relaxed))
    }

    /// Folds a fresh sample through the curve and publishes the result.
    pub fn record(&self, value: f64) -> f64 {
        let throttle = self.spec.throttle(value);
        self.throttle_bits.store(throttle.to_bits(), Ordering::Relaxed);
        throttle
    }
}
