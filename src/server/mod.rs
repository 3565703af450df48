//! Main application server: a thin reverse-proxy shell around the chain.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev, web, App, HttpRequest, HttpResponse, HttpServer};
use async_trait::async_trait;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::middleware::backpressure::CongestionController;
use crate::middleware::{
    Chain, HandlerStage, Middleware, ProxyRequest, ResponseSink, ServeHandler, Transport,
};
use crate::server::metrics::Metrics;
use crate::settings::Settings;

pub mod metrics;

pub const MAX_REQUEST_BYTES: usize = 2_097_152;

/// This is the global HTTP state object that will be made available to all
/// HTTP API calls.
#[derive(Clone)]
pub struct ServerState {
    pub chain: Arc<Chain>,
    pub controller: Option<Arc<CongestionController>>,
    pub client_timeout: Option<Duration>,

    /// Process-scoped cancellation; per-request handles are children of it.
    pub shutdown: CancellationToken,
}

impl ServerState {
    /// Builds the chain, runs its init (spawning the signal pollers) and
    /// returns the ready-to-serve state.
    pub async fn from_settings(settings: &Settings) -> ProxyResult<Self> {
        let metrics = Metrics::from_opts(
            &settings.statsd_label,
            settings.statsd_host.as_deref(),
            settings.statsd_port,
        )?;

        let upstream = Url::parse(&settings.upstream_url)
            .map_err(|e| ProxyError::validation(format!("invalid upstream_url: {}", e)))?;
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .map_err(|e| ProxyError::internal(format!("failed to build upstream client: {}", e)))?;
        let forwarder = UpstreamForwarder::new(Transport::new(client, upstream));
        let terminal: Arc<dyn Middleware> = Arc::new(HandlerStage::new(Box::new(forwarder)));

        let chain = Arc::new(Chain::new(&settings.middleware, metrics, terminal)?);
        let shutdown = CancellationToken::new();
        chain.init(&shutdown).await?;

        Ok(Self {
            controller: chain.controller().cloned(),
            chain,
            client_timeout: settings.client_timeout_ms.map(Duration::from_millis),
            shutdown,
        })
    }
}

/// Terminal handler for the server form: forwards the request upstream and
/// copies the response into the carrier's writer.
pub struct UpstreamForwarder {
    transport: Transport,
}

impl UpstreamForwarder {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ServeHandler for UpstreamForwarder {
    async fn serve(&self, writer: &mut ResponseSink, request: &ProxyRequest) -> ProxyResult<()> {
        let response = self.transport.round_trip(request).await?;
        writer.set_status(response.status);
        for (name, value) in response.headers.iter() {
            writer.headers_mut().append(name.clone(), value.clone());
        }
        writer.write(&response.body);
        Ok(())
    }
}

async fn proxy(
    request: HttpRequest,
    body: web::Bytes,
    state: web::Data<ServerState>,
) -> Result<HttpResponse, ProxyError> {
    let proxied = ProxyRequest {
        method: request.method().clone(),
        uri: request.uri().clone(),
        headers: collect_headers(request.headers()),
        body,
        cancel: state.shutdown.child_token(),
    };
    let sink = state.chain.serve(proxied, state.client_timeout).await?;
    Ok(sink.into_response())
}

async fn heartbeat(state: web::Data<ServerState>) -> HttpResponse {
    let mut checks = serde_json::json!({ "status": "OK" });
    if let Some(controller) = &state.controller {
        let snapshot = controller.snapshot();
        checks["watermark"] = snapshot.watermark.into();
        checks["active"] = snapshot.active.into();
        checks["allowance"] = snapshot.allowance.into();
    }
    HttpResponse::Ok().json(checks)
}

async fn lbheartbeat(_: HttpRequest) -> HttpResponse {
    // Load balancer probe; answers regardless of controller state.
    HttpResponse::Ok()
        .content_type("application/json")
        .body("{}")
}

async fn version(_: HttpRequest) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn collect_headers(headers: &actix_web::http::header::HeaderMap) -> HeaderMap {
    let mut collected = HeaderMap::new();
    for (name, value) in headers.iter() {
        collected.append(name.clone(), value.clone());
    }
    collected
}

macro_rules! build_app {
    ($state: expr) => {
        App::new()
            .app_data(web::Data::new($state))
            .app_data(web::PayloadConfig::new(MAX_REQUEST_BYTES))
            // Dockerflow
            .service(web::resource("/__heartbeat__").route(web::get().to(heartbeat)))
            .service(web::resource("/__lbheartbeat__").route(web::get().to(lbheartbeat)))
            .service(web::resource("/__version__").route(web::get().to(version)))
            // Everything else flows through the chain to the upstream.
            .default_service(web::route().to(proxy))
    };
}

pub struct Server;

impl Server {
    pub async fn with_settings(
        settings: Settings,
    ) -> Result<(dev::Server, CancellationToken), ProxyError> {
        let state = ServerState::from_settings(&settings).await?;
        let shutdown = state.shutdown.clone();

        let mut server = HttpServer::new(move || build_app!(state.clone()));
        if let Some(keep_alive) = settings.actix_keep_alive {
            server = server.keep_alive(Duration::from_secs(keep_alive as u64));
        }
        let server = server
            .bind(format!("{}:{}", settings.host, settings.port))
            .expect("failed to bind the proxy listener")
            .run();
        Ok((server, shutdown))
    }
}

#[cfg(test)]
mod test;
