//! Periodic instant-query polling, one task per configured signal.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::backpressure::CongestionController;
use crate::server::metrics::Metrics;
use crate::signals::SignalState;

pub const POLL_INTERVAL: Duration = Duration::from_secs(30);
pub const POLL_TIMEOUT: Duration = Duration::from_secs(15);

const QUERY_PATH: &str = "/api/v1/query";

/// Instant-query response, narrowed to the one scalar we read.
#[derive(Debug, Deserialize)]
struct QueryResponse {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySample>,
}

#[derive(Debug, Deserialize)]
struct QuerySample {
    value: (f64, String),
}

/// Polls one signal on a fixed cadence and folds fresh samples into the
/// controller's allowance. Poll failures keep the signal's previous throttle;
/// the task only exits when the process-scoped cancellation fires.
pub struct SignalPoller {
    client: Client,
    query_url: Url,
    state: Arc<SignalState>,
    controller: Arc<CongestionController>,
    metrics: Metrics,
}

impl SignalPoller {
    /// One pooled client shared by every poller.
    pub fn build_client() -> ProxyResult<Client> {
        Client::builder()
            .timeout(POLL_TIMEOUT)
            .use_rustls_tls()
            .build()
            .map_err(|e| ProxyError::internal(format!("failed to build signal poll client: {}", e)))
    }

    pub fn new(
        client: Client,
        monitoring_base_url: &Url,
        state: Arc<SignalState>,
        controller: Arc<CongestionController>,
        metrics: Metrics,
    ) -> ProxyResult<Self> {
        let base = monitoring_base_url.as_str().trim_end_matches('/');
        let query_url = Url::parse(&format!("{}{}", base, QUERY_PATH))
            .map_err(|e| ProxyError::validation(format!("invalid monitoring base URL: {}", e)))?;
        Ok(Self {
            client,
            query_url,
            state,
            controller,
            metrics,
        })
    }

    pub fn spawn(self, shutdown: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("stopping signal poller for {:?}", self.state.spec().query);
                        break;
                    }
                    _ = ticker.tick() => self.tick().await,
                }
            }
        });
    }

    async fn tick(&self) {
        match self.poll_once().await {
            Ok(value) => {
                self.state.record(value);
                if let Some(name) = &self.state.spec().name {
                    self.metrics
                        .gauge_with_tag("signal_value", "name", name, value);
                }
                self.controller.refresh_allowance();
            }
            Err(error) => {
                warn!(
                    "signal poll for {:?} failed: {}",
                    self.state.spec().query,
                    error
                );
                if let Some(name) = &self.state.spec().name {
                    self.metrics
                        .incr_with_tag("signal_error_count", "name", name);
                }
            }
        }
    }

    /// One GET against the metrics endpoint. Anything other than a single
    /// non-negative sample is an error.
    async fn poll_once(&self) -> ProxyResult<f64> {
        let response = self
            .client
            .get(self.query_url.clone())
            .query(&[("query", self.state.spec().query.as_str())])
            .send()
            .await
            .map_err(|e| ProxyError::upstream(format!("signal query failed: {}", e)))?;

        if response.status() != StatusCode::OK {
            return Err(ProxyError::upstream(format!(
                "signal query returned {}",
                response.status()
            )));
        }

        let body: QueryResponse = response
            .json()
            .await
            .map_err(|e| ProxyError::upstream(format!("undecodable signal response: {}", e)))?;

        let mut result = body.data.result;
        if result.len() != 1 {
            return Err(ProxyError::upstream(format!(
                "expected exactly one sample, got {}",
                result.len()
            )));
        }
        let sample = result.remove(0);
        let value: f64 = sample.value.1.parse().map_err(|_| {
            ProxyError::upstream(format!("signal sample {:?} is not a number", sample.value.1))
        })?;
        if value < 0.0 || !value.is_finite() {
            return Err(ProxyError::upstream(format!(
                "signal sample {} is negative or non-finite",
                value
            )));
        }
        Ok(value)
    }
}
