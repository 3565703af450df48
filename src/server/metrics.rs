//! Statsd metric reporting.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use cadence::ext::ToGaugeValue;
use cadence::{
    BufferedUdpMetricSink, Counted, Gauged, MetricError, MetricResult, NopMetricSink,
    QueuingMetricSink, StatsdClient, Timed,
};

/// Handle for emitting counters, gauges and timers. Clones share the
/// underlying client; a clone holding a started timer reports the elapsed
/// time when it is dropped.
#[derive(Clone, Debug)]
pub struct Metrics {
    client: Arc<StatsdClient>,
    timer: Option<Timer>,
}

#[derive(Clone, Debug)]
struct Timer {
    label: String,
    started: Instant,
}

impl Metrics {
    pub fn new(client: Arc<StatsdClient>) -> Self {
        Self {
            client,
            timer: None,
        }
    }

    /// Reporting handle for the configured statsd target. Without a host,
    /// everything lands in a no-op sink, which keeps call sites unconditional.
    pub fn from_opts(label: &str, host: Option<&str>, port: u16) -> Result<Self, MetricError> {
        let client = match host {
            Some(host) => {
                let socket = UdpSocket::bind("0.0.0.0:0")?;
                socket.set_nonblocking(true)?;
                let sink = QueuingMetricSink::from(BufferedUdpMetricSink::from((host, port), socket)?);
                StatsdClient::builder(label, sink)
                    .with_error_handler(|e| warn!("statsd send error: {:?}", e))
                    .build()
            }
            None => StatsdClient::builder(label, NopMetricSink).build(),
        };
        Ok(Self::new(Arc::new(client)))
    }

    /// Handle whose metrics all vanish, for tests.
    pub fn noop() -> Self {
        Self::new(Arc::new(StatsdClient::builder("", NopMetricSink).build()))
    }

    pub fn incr(&self, label: &str) {
        log_send_failure(label, self.client.count_with_tags(label, 1_i64).try_send());
    }

    pub fn incr_with_tag(&self, label: &str, key: &str, value: &str) {
        log_send_failure(
            label,
            self.client
                .count_with_tags(label, 1_i64)
                .with_tag(key, value)
                .try_send(),
        );
    }

    pub fn gauge<V: ToGaugeValue>(&self, label: &str, value: V) {
        log_send_failure(label, self.client.gauge_with_tags(label, value).try_send());
    }

    pub fn gauge_with_tag<V: ToGaugeValue>(&self, label: &str, key: &str, tag: &str, value: V) {
        log_send_failure(
            label,
            self.client
                .gauge_with_tags(label, value)
                .with_tag(key, tag)
                .try_send(),
        );
    }

    /// Arms the latency timer; the elapsed milliseconds are reported when
    /// this handle drops.
    pub fn start_timer(&mut self, label: &str) {
        self.timer = Some(Timer {
            label: label.to_owned(),
            started: Instant::now(),
        });
    }
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            let elapsed = timer.started.elapsed().as_millis() as u64;
            log_send_failure(
                &timer.label,
                self.client.time_with_tags(&timer.label, elapsed).try_send(),
            );
        }
    }
}

fn log_send_failure<T>(label: &str, result: MetricResult<T>) {
    if let Err(e) = result {
        debug!("metric {} was dropped: {:?}", label, e);
    }
}
