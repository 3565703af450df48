//! Request bookkeeping and hang isolation.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::{Carrier, Middleware};
use crate::server::metrics::Metrics;

/// Counts and times every request, tags refusals by source, and keeps the
/// in-flight gauge honest even when the downstream stalls.
pub struct Observer {
    metrics: Metrics,
    in_flight: AtomicI64,
    next: Arc<dyn Middleware>,
}

impl Observer {
    pub fn new(metrics: Metrics, next: Arc<dyn Middleware>) -> Self {
        Self {
            metrics,
            in_flight: AtomicI64::new(0),
            next,
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> i64 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Middleware for Observer {
    async fn init(&self, shutdown: &CancellationToken) -> ProxyResult<()> {
        self.next.init(shutdown).await
    }

    /// Runs the downstream in its own task and races it against the request's
    /// cancellation handle. When cancellation wins, the task is left to
    /// finish on its own (admitted requests still release their slot there)
    /// while the exit bookkeeping runs here, so the in-flight gauge cannot
    /// leak on a hung downstream.
    async fn next(&self, carrier: Carrier) -> ProxyResult<Carrier> {
        let cancel = carrier.request.cancel.clone();

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.gauge("active_requests", in_flight.max(0) as u64);
        let mut timer = self.metrics.clone();
        timer.start_timer("request_latency_ms");

        let next = self.next.clone();
        let mut downstream = tokio::spawn(async move { next.next(carrier).await });

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ProxyError::canceled()),
            joined = &mut downstream => match joined {
                Ok(result) => result,
                Err(join_error) => Err(ProxyError::internal(format!(
                    "panic calling Next: {}",
                    panic_detail(join_error)
                ))),
            },
        };

        let in_flight = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        self.metrics.gauge("active_requests", in_flight.max(0) as u64);
        self.metrics.incr("request_count");
        drop(timer);

        if let Err(error) = &result {
            match error.block_source() {
                Some(source) => self
                    .metrics
                    .incr_with_tag("block_count", "source", source.as_str()),
                None => self.metrics.incr("error_count"),
            }
        }

        result
    }
}

fn panic_detail(error: JoinError) -> String {
    if error.is_panic() {
        let payload = error.into_panic();
        if let Some(detail) = payload.downcast_ref::<&str>() {
            (*detail).to_owned()
        } else if let Some(detail) = payload.downcast_ref::<String>() {
            detail.clone()
        } else {
            "unknown panic".to_owned()
        }
    } else {
        error.to_string()
    }
}
