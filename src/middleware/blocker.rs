//! Header-pattern request blocking.

use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{BlockSource, ProxyError, ProxyResult};
use crate::middleware::{Carrier, Middleware};

/// One compiled `HEADER=REGEX` pair.
#[derive(Debug)]
pub struct BlockPattern {
    header: String,
    regex: Regex,
}

impl BlockPattern {
    fn parse(pattern: &str) -> ProxyResult<Self> {
        let parts: Vec<&str> = pattern.split('=').collect();
        if parts.len() != 2 {
            return Err(ProxyError::validation(format!(
                "block pattern {:?} must be a single HEADER=REGEX pair",
                pattern
            )));
        }
        let header = parts[0].trim();
        if header.is_empty() {
            return Err(ProxyError::validation(format!(
                "block pattern {:?} has an empty header name",
                pattern
            )));
        }
        let regex = Regex::new(parts[1]).map_err(|e| {
            ProxyError::validation(format!("block pattern {:?} has an invalid regex: {}", pattern, e))
        })?;
        Ok(Self {
            header: header.to_owned(),
            regex,
        })
    }
}

/// Rejects any request with a header value matching a configured pattern.
pub struct Blocker {
    patterns: Vec<BlockPattern>,
    next: Arc<dyn Middleware>,
}

impl Blocker {
    pub fn new(patterns: &[String], next: Arc<dyn Middleware>) -> ProxyResult<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| BlockPattern::parse(pattern))
            .collect::<ProxyResult<Vec<_>>>()?;
        Ok(Self { patterns, next })
    }
}

#[async_trait]
impl Middleware for Blocker {
    async fn init(&self, shutdown: &CancellationToken) -> ProxyResult<()> {
        self.next.init(shutdown).await
    }

    async fn next(&self, carrier: Carrier) -> ProxyResult<Carrier> {
        for pattern in &self.patterns {
            for value in carrier.request.headers.get_all(pattern.header.as_str()) {
                let value = match value.to_str() {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                if pattern.regex.is_match(value) {
                    trace!(
                        "blocking request: header {} matched {}",
                        &pattern.header,
                        pattern.regex.as_str()
                    );
                    return Err(ProxyError::blocked(
                        BlockSource::Blocker,
                        format!(
                            "header {}, value {} blocked by regex {}",
                            pattern.header,
                            value,
                            pattern.regex.as_str()
                        ),
                    ));
                }
            }
        }
        self.next.next(carrier).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::middleware::support::{self, Terminal};

    fn blocker(patterns: &[&str]) -> (Arc<Terminal>, Blocker) {
        let terminal = Arc::new(Terminal::default());
        let patterns: Vec<String> = patterns.iter().map(|p| (*p).to_owned()).collect();
        let blocker = Blocker::new(&patterns, terminal.clone()).unwrap();
        (terminal, blocker)
    }

    #[tokio::test]
    async fn test_matching_header_is_blocked() {
        let (terminal, blocker) = blocker(&["X-User-Agent=service.*"]);
        let mut request = support::request("/");
        request
            .headers
            .insert("x-user-agent", "service1".parse().unwrap());

        let error = blocker
            .next(Carrier::for_server(request))
            .await
            .unwrap_err();
        assert_eq!(error.block_source(), Some(BlockSource::Blocker));
        let text = error.to_string();
        assert!(text.contains("X-User-Agent"), "got {:?}", text);
        assert!(text.contains("service1"));
        assert!(text.contains("service.*"));
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmatched_request_is_forwarded() {
        let (terminal, blocker) = blocker(&["x-user-agent=service.*"]);
        let mut request = support::request("/");
        request
            .headers
            .insert("x-user-agent", "browser/7".parse().unwrap());
        request.headers.insert("x-other", "service1".parse().unwrap());

        blocker.next(Carrier::for_server(request)).await.unwrap();
        assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_any_of_several_values_blocks() {
        let (_, blocker) = blocker(&["x-user-agent=^bad$"]);
        let mut request = support::request("/");
        request
            .headers
            .append("x-user-agent", "good".parse().unwrap());
        request
            .headers
            .append("x-user-agent", "bad".parse().unwrap());

        let error = blocker
            .next(Carrier::for_server(request))
            .await
            .unwrap_err();
        assert_eq!(error.block_source(), Some(BlockSource::Blocker));
    }

    #[test]
    fn test_pattern_validation() {
        assert!(BlockPattern::parse("x-header=value.*").is_ok());
        assert!(BlockPattern::parse("missing-equals").is_err());
        assert!(BlockPattern::parse("=value").is_err());
        assert!(BlockPattern::parse("a=b=c").is_err());
        assert!(BlockPattern::parse("x-header=(unclosed").is_err());
    }
}
