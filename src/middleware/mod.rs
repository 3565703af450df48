//! The admission chain: a stack of stages threaded by a request carrier.
//!
//! Stages are composed outermost to innermost as Observer, Blocker, Jitterer,
//! Backpressure, then a terminal. The terminal is what distinguishes the two
//! forms sharing the chain: the server form hands the carrier's response
//! writer to a caller-provided handler, the transport form performs the
//! outbound round-trip itself and records the response on the carrier.

pub mod backpressure;
pub mod blocker;
pub mod jitter;
pub mod observer;

use std::sync::Arc;
use std::time::Duration;

use actix_web::HttpResponse;
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{ProxyError, ProxyResult};
use crate::server::metrics::Metrics;
use crate::settings::MiddlewareSettings;

use backpressure::{BackpressureStage, CongestionController};
use blocker::Blocker;
use jitter::Jitterer;
use observer::Observer;

/// The request half of the carrier.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Fires when the client goes away or the per-request deadline elapses.
    pub cancel: CancellationToken,
}

impl ProxyRequest {
    /// A header value as UTF-8, if present and decodable.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

/// Response recorded by the transport form's terminal.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Accumulating response writer handed to server-form handlers.
#[derive(Debug)]
pub struct ResponseSink {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_response(self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status);
        for (name, value) in self.headers.iter() {
            builder.append_header((name.clone(), value.clone()));
        }
        builder.body(self.body)
    }
}

impl Default for ResponseSink {
    fn default() -> Self {
        Self::new()
    }
}

/// The in-flight container threaded through the chain. Exactly one of
/// `response` and `writer` belongs to the active form; touching the other is a
/// programming error surfaced by the terminal.
#[derive(Debug)]
pub struct Carrier {
    pub request: ProxyRequest,
    pub response: Option<UpstreamResponse>,
    pub writer: Option<ResponseSink>,
}

impl Carrier {
    pub fn for_server(request: ProxyRequest) -> Self {
        Self {
            request,
            response: None,
            writer: Some(ResponseSink::new()),
        }
    }

    pub fn for_transport(request: ProxyRequest) -> Self {
        Self {
            request,
            response: None,
            writer: None,
        }
    }
}

/// One stage of the chain. Stages own their downstream and forward the
/// carrier to it; `init` propagates top-down once at startup.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn init(&self, shutdown: &CancellationToken) -> ProxyResult<()>;
    async fn next(&self, carrier: Carrier) -> ProxyResult<Carrier>;
}

/// Server-form final handler seam.
#[async_trait]
pub trait ServeHandler: Send + Sync {
    async fn serve(&self, writer: &mut ResponseSink, request: &ProxyRequest) -> ProxyResult<()>;
}

/// Server-form terminal: invokes the caller-provided handler against the
/// carrier's response writer.
pub struct HandlerStage {
    handler: Box<dyn ServeHandler>,
}

impl HandlerStage {
    pub fn new(handler: Box<dyn ServeHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Middleware for HandlerStage {
    async fn init(&self, _shutdown: &CancellationToken) -> ProxyResult<()> {
        Ok(())
    }

    async fn next(&self, mut carrier: Carrier) -> ProxyResult<Carrier> {
        let Carrier {
            request, writer, ..
        } = &mut carrier;
        let writer = writer
            .as_mut()
            .ok_or_else(|| ProxyError::internal("server carrier has no response writer"))?;
        self.handler.serve(writer, request).await?;
        Ok(carrier)
    }
}

/// Transport-form terminal: performs the outbound round-trip and records the
/// response on the carrier.
pub struct TransportStage {
    transport: Transport,
}

impl TransportStage {
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Middleware for TransportStage {
    async fn init(&self, _shutdown: &CancellationToken) -> ProxyResult<()> {
        Ok(())
    }

    async fn next(&self, mut carrier: Carrier) -> ProxyResult<Carrier> {
        if carrier.writer.is_some() {
            return Err(ProxyError::internal(
                "transport carrier unexpectedly has a response writer",
            ));
        }
        carrier.response = Some(self.transport.round_trip(&carrier.request).await?);
        Ok(carrier)
    }
}

/// Shared outbound plumbing: one pooled client, one upstream base.
#[derive(Clone)]
pub struct Transport {
    client: reqwest::Client,
    upstream: Url,
}

impl Transport {
    pub fn new(client: reqwest::Client, upstream: Url) -> Self {
        Self { client, upstream }
    }

    /// Forwards the request to the upstream and collects the response. The
    /// in-flight send is abandoned as soon as the request's cancellation
    /// handle fires.
    pub async fn round_trip(&self, request: &ProxyRequest) -> ProxyResult<UpstreamResponse> {
        let mut url = self.upstream.clone();
        url.set_path(request.uri.path());
        url.set_query(request.uri.query());

        let mut headers = request.headers.clone();
        strip_connection_headers(&mut headers);

        let send = self
            .client
            .request(request.method.clone(), url)
            .headers(headers)
            .body(request.body.clone())
            .send();

        let response = tokio::select! {
            _ = request.cancel.cancelled() => return Err(ProxyError::canceled()),
            result = send => result
                .map_err(|e| ProxyError::upstream(format!("upstream request failed: {}", e)))?,
        };

        let status = response.status();
        let mut headers = response.headers().clone();
        strip_connection_headers(&mut headers);
        let body = response
            .bytes()
            .await
            .map_err(|e| ProxyError::upstream(format!("upstream body read failed: {}", e)))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Hop-by-hop headers never cross the proxy; content-length is recomputed
/// from the buffered body on each side.
fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in [
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
    ] {
        headers.remove(name);
    }
    headers.remove(CONNECTION);
    headers.remove(CONTENT_LENGTH);
    headers.remove(HOST);
    headers.remove(TE);
    headers.remove(TRAILER);
    headers.remove(TRANSFER_ENCODING);
    headers.remove(UPGRADE);
}

/// The assembled chain plus its two entry forms.
pub struct Chain {
    entry: Arc<dyn Middleware>,
    controller: Option<Arc<CongestionController>>,
}

impl Chain {
    /// Composes the enabled stages around `terminal`, innermost first.
    pub fn new(
        settings: &MiddlewareSettings,
        metrics: Metrics,
        terminal: Arc<dyn Middleware>,
    ) -> ProxyResult<Self> {
        let mut next = terminal;
        let mut controller = None;

        if settings.enable_backpressure {
            let stage = BackpressureStage::new(&settings.backpressure, metrics.clone(), next)?;
            controller = Some(stage.controller());
            next = Arc::new(stage);
        }
        if settings.enable_jitter {
            next = Arc::new(Jitterer::new(
                Duration::from_millis(settings.jitter_delay_ms),
                settings.enable_criticality,
                next,
            ));
        }
        if settings.enable_blocker {
            next = Arc::new(Blocker::new(&settings.block_patterns, next)?);
        }
        if settings.enable_observer {
            next = Arc::new(Observer::new(metrics, next));
        }

        Ok(Self {
            entry: next,
            controller,
        })
    }

    /// Startup hook: propagates through every stage and spawns the signal
    /// pollers. Requests may arrive as soon as this returns.
    pub async fn init(&self, shutdown: &CancellationToken) -> ProxyResult<()> {
        self.entry.init(shutdown).await
    }

    pub fn controller(&self) -> Option<&Arc<CongestionController>> {
        self.controller.as_ref()
    }

    /// Server form: thread the request through the chain and hand back what
    /// the terminal handler wrote. The optional per-request deadline is wired
    /// into the request's cancellation handle, so every stage observes it the
    /// same way it observes a client disconnect.
    pub async fn serve(
        &self,
        request: ProxyRequest,
        client_timeout: Option<Duration>,
    ) -> ProxyResult<ResponseSink> {
        let cancel = request.cancel.clone();
        // Unblocks any still-running downstream task once this entry returns.
        let _guard = cancel.clone().drop_guard();

        if let Some(deadline) = client_timeout {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => cancel.cancel(),
                }
            });
        }

        let carrier = self.entry.next(Carrier::for_server(request)).await?;
        carrier
            .writer
            .ok_or_else(|| ProxyError::internal("chain returned a carrier without a writer"))
    }

    /// Transport form: thread the request through the chain and return the
    /// response its terminal recorded.
    pub async fn round_trip(&self, request: ProxyRequest) -> ProxyResult<UpstreamResponse> {
        let carrier = self.entry.next(Carrier::for_transport(request)).await?;
        carrier
            .response
            .ok_or_else(|| ProxyError::internal("chain returned a carrier without a response"))
    }
}
