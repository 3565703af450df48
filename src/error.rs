//! Error types and rendering.

use std::error::Error;
use std::fmt;

use actix_web::http::header::{CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use backtrace::Backtrace;
use serde::Serialize;
use thiserror::Error;

/// Common `Result` type.
pub type ProxyResult<T> = Result<T, ProxyError>;

/// Where a refusal originated. Rendered as the `source` tag on block counters
/// and used to pick the response status.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockSource {
    Backpressure,
    Blocker,
}

impl BlockSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockSource::Backpressure => "backpressure",
            BlockSource::Blocker => "blocker",
        }
    }
}

impl fmt::Display for BlockSource {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

impl Error for BlockSource {}

/// Top-level error type.
#[derive(Debug)]
pub struct ProxyError {
    kind: ProxyErrorKind,
    pub(crate) backtrace: Box<Backtrace>,
    status: StatusCode,
}

/// Top-level ErrorKind.
#[derive(Error, Debug)]
pub enum ProxyErrorKind {
    /// Admission was refused or a block pattern matched.
    #[error("request blocked ({source}): {detail}")]
    Blocked { source: BlockSource, detail: String },

    #[error("request canceled")]
    Canceled,

    #[error("{}", _0)]
    Validation(String),

    #[error("{}", _0)]
    Upstream(String),

    #[error("{}", _0)]
    Internal(String),
}

impl ProxyError {
    pub fn kind(&self) -> &ProxyErrorKind {
        &self.kind
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The refusal source, when this error is a block.
    pub fn block_source(&self) -> Option<BlockSource> {
        match &self.kind {
            ProxyErrorKind::Blocked { source, .. } => Some(*source),
            _ => None,
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(&self.kind, ProxyErrorKind::Canceled)
    }

    pub fn error_backtrace(&self) -> String {
        format!("{:#?}", self.backtrace)
    }

    pub fn blocked(source: BlockSource, detail: String) -> Self {
        ProxyErrorKind::Blocked { source, detail }.into()
    }

    /// The congestion window is full; the caller should back off.
    pub fn backpressure_backoff() -> Self {
        Self::blocked(
            BlockSource::Backpressure,
            "the congestion window is full, please back off".to_owned(),
        )
    }

    pub fn canceled() -> Self {
        ProxyErrorKind::Canceled.into()
    }

    pub fn validation<M: fmt::Display>(message: M) -> Self {
        ProxyErrorKind::Validation(message.to_string()).into()
    }

    pub fn upstream<M: fmt::Display>(message: M) -> Self {
        ProxyErrorKind::Upstream(message.to_string()).into()
    }

    pub fn internal<M: fmt::Display>(message: M) -> Self {
        ProxyErrorKind::Internal(message.to_string()).into()
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, formatter)
    }
}

impl Error for ProxyError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.kind.source()
    }
}

impl From<ProxyErrorKind> for ProxyError {
    fn from(kind: ProxyErrorKind) -> Self {
        let status = match &kind {
            ProxyErrorKind::Blocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyErrorKind::Canceled
            | ProxyErrorKind::Validation(_)
            | ProxyErrorKind::Upstream(_)
            | ProxyErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        Self {
            kind,
            backtrace: Box::new(Backtrace::new()),
            status,
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(inner: std::io::Error) -> Self {
        ProxyErrorKind::Internal(inner.to_string()).into()
    }
}

impl From<cadence::MetricError> for ProxyError {
    fn from(inner: cadence::MetricError) -> Self {
        ProxyErrorKind::Internal(inner.to_string()).into()
    }
}

/// The standard error envelope returned for any request the chain refuses.
#[derive(Serialize)]
struct ErrorEnvelope<'e> {
    status: &'static str,
    #[serde(rename = "errorType")]
    error_type: &'static str,
    error: &'e str,
}

impl ResponseError for ProxyError {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn error_response(&self) -> HttpResponse {
        let error = self.to_string();
        let body = serde_json::to_string(&ErrorEnvelope {
            status: "error",
            error_type: "throttle-proxy",
            error: &error,
        })
        .unwrap_or_else(|_| {
            r#"{"status":"error","errorType":"throttle-proxy","error":"unserializable error"}"#
                .to_owned()
        });

        HttpResponse::build(self.status)
            .insert_header((CONTENT_TYPE, "application/json; charset=utf-8"))
            .insert_header((X_CONTENT_TYPE_OPTIONS, "nosniff"))
            .body(body)
    }
}

impl From<ProxyError> for HttpResponse {
    fn from(inner: ProxyError) -> Self {
        ResponseError::error_response(&inner)
    }
}
