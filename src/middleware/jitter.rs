//! Pre-forward jitter: spreads bursty clients out before any capacity check.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::durations::parse_duration;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Carrier, Middleware, ProxyRequest};

pub const CRITICALITY_HEADER: &str = "x-request-criticality";
pub const CAN_WAIT_HEADER: &str = "x-can-wait";

/// Requests at this criticality never wait.
const CRITICAL_PLUS: &str = "CRITICAL_PLUS";

/// Sleeps a uniformly random duration before forwarding.
pub struct Jitterer {
    delay: Duration,
    honor_criticality: bool,
    next: Arc<dyn Middleware>,
}

impl Jitterer {
    pub fn new(delay: Duration, honor_criticality: bool, next: Arc<dyn Middleware>) -> Self {
        Self {
            delay,
            honor_criticality,
            next,
        }
    }

    /// Upper bound of the jitter window for this request. Criticality wins;
    /// a client wait budget can only widen the configured window.
    fn window(&self, request: &ProxyRequest) -> ProxyResult<Duration> {
        if self.honor_criticality && request.header(CRITICALITY_HEADER) == Some(CRITICAL_PLUS) {
            return Ok(Duration::ZERO);
        }
        match request.header(CAN_WAIT_HEADER) {
            Some(budget) => {
                let budget = parse_duration(budget).map_err(|e| {
                    ProxyError::validation(format!("invalid {} header: {}", CAN_WAIT_HEADER, e))
                })?;
                Ok(budget.max(self.delay))
            }
            None => Ok(self.delay),
        }
    }
}

#[async_trait]
impl Middleware for Jitterer {
    async fn init(&self, shutdown: &CancellationToken) -> ProxyResult<()> {
        self.next.init(shutdown).await
    }

    async fn next(&self, carrier: Carrier) -> ProxyResult<Carrier> {
        let window = self.window(&carrier.request)?;
        if !window.is_zero() {
            let nanos = rand::thread_rng().gen_range(0..window.as_nanos().max(1) as u64);
            let pause = Duration::from_nanos(nanos);
            tokio::select! {
                _ = carrier.request.cancel.cancelled() => return Err(ProxyError::canceled()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
        self.next.next(carrier).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    use super::*;
    use crate::middleware::support::{self, Terminal};

    fn jitterer(delay: Duration, honor_criticality: bool) -> (Arc<Terminal>, Jitterer) {
        let terminal = Arc::new(Terminal::default());
        let jitterer = Jitterer::new(delay, honor_criticality, terminal.clone());
        (terminal, jitterer)
    }

    #[test]
    fn test_window_defaults_to_configured_delay() {
        let (_, jitterer) = jitterer(Duration::from_secs(1), true);
        let request = support::request("/");
        assert_eq!(jitterer.window(&request).unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_critical_plus_skips_jitter() {
        let (_, jitterer) = jitterer(Duration::from_secs(1), true);
        let mut request = support::request("/");
        request
            .headers
            .insert(CRITICALITY_HEADER, "CRITICAL_PLUS".parse().unwrap());
        assert_eq!(jitterer.window(&request).unwrap(), Duration::ZERO);

        // Plain CRITICAL still waits.
        request
            .headers
            .insert(CRITICALITY_HEADER, "CRITICAL".parse().unwrap());
        assert_eq!(jitterer.window(&request).unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_criticality_ignored_when_disabled() {
        let (_, jitterer) = jitterer(Duration::from_secs(1), false);
        let mut request = support::request("/");
        request
            .headers
            .insert(CRITICALITY_HEADER, "CRITICAL_PLUS".parse().unwrap());
        assert_eq!(jitterer.window(&request).unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_can_wait_only_widens_the_window() {
        let (_, jitterer) = jitterer(Duration::from_secs(1), true);
        let mut request = support::request("/");
        request
            .headers
            .insert(CAN_WAIT_HEADER, "2m".parse().unwrap());
        assert_eq!(jitterer.window(&request).unwrap(), Duration::from_secs(120));

        request
            .headers
            .insert(CAN_WAIT_HEADER, "10ms".parse().unwrap());
        assert_eq!(jitterer.window(&request).unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_criticality_beats_can_wait() {
        let (_, jitterer) = jitterer(Duration::from_secs(1), true);
        let mut request = support::request("/");
        request
            .headers
            .insert(CRITICALITY_HEADER, "CRITICAL_PLUS".parse().unwrap());
        request
            .headers
            .insert(CAN_WAIT_HEADER, "2m".parse().unwrap());
        assert_eq!(jitterer.window(&request).unwrap(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_bad_can_wait_is_an_error() {
        let (terminal, jitterer) = jitterer(Duration::from_millis(1), true);
        let mut request = support::request("/");
        request
            .headers
            .insert(CAN_WAIT_HEADER, "soonish".parse().unwrap());

        let error = jitterer
            .next(Carrier::for_server(request))
            .await
            .unwrap_err();
        assert!(error.to_string().contains(CAN_WAIT_HEADER));
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sleeps_within_the_window_then_forwards() {
        let (terminal, jitterer) = jitterer(Duration::from_millis(20), false);
        let start = Instant::now();
        jitterer
            .next(Carrier::for_server(support::request("/")))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_critical_plus_forwards_immediately() {
        // A window this wide would time the test out if it were honored.
        let (terminal, jitterer) = jitterer(Duration::from_secs(3600), true);
        let mut request = support::request("/");
        request
            .headers
            .insert(CRITICALITY_HEADER, "CRITICAL_PLUS".parse().unwrap());

        jitterer.next(Carrier::for_server(request)).await.unwrap();
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_sleep() {
        let (terminal, jitterer) = jitterer(Duration::from_secs(3600), false);
        let request = support::request("/");
        request.cancel.cancel();

        let error = jitterer
            .next(Carrier::for_server(request))
            .await
            .unwrap_err();
        assert!(error.is_canceled());
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
    }
}
