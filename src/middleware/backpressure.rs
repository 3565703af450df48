//! AIMD congestion control over externally sampled load signals.
//!
//! Admission is gated on a watermark that grows by one on every release and
//! shrinks whenever the signal-derived allowance drops, the same shape TCP
//! uses for its congestion window.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Carrier, Middleware};
use crate::querycost;
use crate::server::metrics::Metrics;
use crate::settings::BackpressureSettings;
use crate::signals::poller::SignalPoller;
use crate::signals::SignalState;

/// State guarded by the admission lock. Critical sections are O(1) and never
/// perform I/O.
#[derive(Debug)]
struct Window {
    watermark: usize,
    active: usize,
    allowance: f64,
}

/// Point-in-time controller state, for health reporting and tests.
#[derive(Clone, Copy, Debug)]
pub struct WindowSnapshot {
    pub watermark: usize,
    pub active: usize,
    pub allowance: f64,
}

pub struct CongestionController {
    min: usize,
    max: usize,
    window: Mutex<Window>,
    signals: Vec<Arc<SignalState>>,
    metrics: Metrics,
}

impl CongestionController {
    pub fn new(settings: &BackpressureSettings, metrics: Metrics) -> Self {
        let signals = settings
            .signals
            .iter()
            .cloned()
            .map(|spec| Arc::new(SignalState::new(spec)))
            .collect();
        Self {
            min: settings.window_min,
            max: settings.window_max,
            window: Mutex::new(Window {
                watermark: settings.window_min,
                active: 0,
                allowance: 1.0,
            }),
            signals,
            metrics,
        }
    }

    pub fn signals(&self) -> &[Arc<SignalState>] {
        &self.signals
    }

    /// Reserve a concurrency slot, or refuse when the window is full.
    pub fn admit(&self) -> ProxyResult<()> {
        let mut window = self.lock();
        if window.active >= window.watermark {
            return Err(ProxyError::backpressure_backoff());
        }
        window.active += 1;
        Ok(())
    }

    /// Free a slot and grow the window additively.
    pub fn release(&self) {
        let watermark = {
            let mut window = self.lock();
            window.active = window.active.saturating_sub(1);
            window.watermark += 1;
            self.constrain(&mut window);
            window.watermark
        };
        self.metrics.gauge("watermark", watermark as u64);
    }

    /// Fold the latest per-signal throttles into the allowance and shrink the
    /// watermark immediately if it dropped. Signals that have not produced a
    /// sample yet contribute zero throttle.
    pub fn refresh_allowance(&self) {
        let max_throttle = self
            .signals
            .iter()
            .map(|signal| signal.throttle())
            .fold(0.0_f64, f64::max);
        let allowance = 1.0 - max_throttle;

        let watermark = {
            let mut window = self.lock();
            window.allowance = allowance;
            self.constrain(&mut window);
            window.watermark
        };
        self.metrics.gauge("allowance", allowance);
        self.metrics.gauge("watermark", watermark as u64);
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        let window = self.lock();
        WindowSnapshot {
            watermark: window.watermark,
            active: window.active,
            allowance: window.allowance,
        }
    }

    /// Emit the static window gauges once at startup.
    pub fn init_gauges(&self) {
        self.metrics.gauge("cwdn_min", self.min as u64);
        self.metrics.gauge("cwdn_max", self.max as u64);
        for signal in &self.signals {
            if let Some(name) = &signal.spec().name {
                self.metrics
                    .gauge_with_tag("signal_warn", "name", name, signal.spec().warn);
                self.metrics.gauge_with_tag(
                    "signal_emergency",
                    "name",
                    name,
                    signal.spec().emergency,
                );
            }
        }
    }

    /// Keep the watermark inside `[min, floor(max * allowance)]`, pinning to
    /// `min` when the allowance pushes the ceiling below it.
    fn constrain(&self, window: &mut Window) {
        let ceiling = ((self.max as f64) * window.allowance).floor() as usize;
        window.watermark = window.watermark.clamp(self.min, ceiling.max(self.min));
    }

    fn lock(&self) -> MutexGuard<'_, Window> {
        self.window
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Releases the admission slot when dropped, so release runs on success,
/// error and unwind alike.
struct SlotGuard<'c> {
    controller: &'c CongestionController,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.controller.release();
    }
}

/// Admission stage: optionally lets recent-data queries through unmetered,
/// then gates everything else on the controller.
pub struct BackpressureStage {
    controller: Arc<CongestionController>,
    monitoring_base_url: Url,
    low_cost_bypass: bool,
    metrics: Metrics,
    next: Arc<dyn Middleware>,
}

impl BackpressureStage {
    pub fn new(
        settings: &BackpressureSettings,
        metrics: Metrics,
        next: Arc<dyn Middleware>,
    ) -> ProxyResult<Self> {
        let monitoring_base_url = Url::parse(&settings.monitoring_base_url)
            .map_err(|e| ProxyError::validation(format!("invalid monitoring_base_url: {}", e)))?;
        Ok(Self {
            controller: Arc::new(CongestionController::new(settings, metrics.clone())),
            monitoring_base_url,
            low_cost_bypass: settings.enable_low_cost_bypass,
            metrics,
            next,
        })
    }

    pub fn controller(&self) -> Arc<CongestionController> {
        self.controller.clone()
    }
}

#[async_trait]
impl Middleware for BackpressureStage {
    /// Spawns one poller task per signal; they run until the process-scoped
    /// cancellation fires. The allowance stays at 1 until the first
    /// successful sample lands.
    async fn init(&self, shutdown: &CancellationToken) -> ProxyResult<()> {
        self.controller.init_gauges();
        let client = SignalPoller::build_client()?;
        for state in self.controller.signals() {
            SignalPoller::new(
                client.clone(),
                &self.monitoring_base_url,
                state.clone(),
                self.controller.clone(),
                self.metrics.clone(),
            )?
            .spawn(shutdown.clone());
        }
        self.next.init(shutdown).await
    }

    async fn next(&self, carrier: Carrier) -> ProxyResult<Carrier> {
        if self.low_cost_bypass && querycost::classify(&carrier.request)?.is_low() {
            return self.next.next(carrier).await;
        }

        self.controller.admit()?;
        let _slot = SlotGuard {
            controller: &self.controller,
        };
        self.next.next(carrier).await
    }
}
