//! Query cost classification for the low-cost admission bypass.
//!
//! Queries that only touch recent samples are served from hot storage and are
//! cheap enough to skip admission; anything reaching further back competes for
//! a concurrency slot.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use http::header::CONTENT_TYPE;
use http::Method;
use lazy_static::lazy_static;
use regex::Regex;

use crate::durations;
use crate::error::{ProxyError, ProxyResult};
use crate::middleware::ProxyRequest;

const INSTANT_QUERY_PATH: &str = "/api/v1/query";
const RANGE_QUERY_PATH: &str = "/api/v1/query_range";

/// Queries touching nothing older than this bypass admission.
const RECENT_WINDOW_HOURS: i64 = 2;

/// Matches Prometheus' default query lookback.
const LOOKBACK_DELTA_MINUTES: i64 = 5;

const DEFAULT_STEP_SECONDS: u64 = 30;

lazy_static! {
    // Range and subquery selectors: "[5m]", "[1h:30s]".
    static ref RANGE_SELECTOR_REGEX: Regex = Regex::new(r"\[([^\]]+)\]").unwrap();
    static ref OFFSET_REGEX: Regex = Regex::new(r"offset\s+([0-9][0-9a-z.]*)").unwrap();
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QueryCost {
    Low,
    High,
}

impl QueryCost {
    pub fn is_low(&self) -> bool {
        matches!(self, QueryCost::Low)
    }
}

/// Classifies a query-endpoint request by the earliest sample it can touch.
///
/// Only the two query endpoints are recognized; any other path is an error.
/// Parameters are read from a copy, leaving the carrier's body intact for the
/// stages downstream.
pub fn classify(request: &ProxyRequest) -> ProxyResult<QueryCost> {
    let params = query_params(request);
    let query = params
        .get("query")
        .ok_or_else(|| ProxyError::validation("query parameter is required"))?;

    let now = Utc::now();
    let (start, step) = match request.uri.path() {
        INSTANT_QUERY_PATH => {
            let time = match params.get("time") {
                Some(value) => parse_time(value)?,
                None => now,
            };
            (time, std::time::Duration::ZERO)
        }
        RANGE_QUERY_PATH => {
            let start = parse_time(required(&params, "start")?)?;
            let end = parse_time(required(&params, "end")?)?;
            if end < start {
                return Err(ProxyError::validation("query end precedes start"));
            }
            let step = match params.get("step") {
                Some(value) => durations::parse_duration(value)
                    .map_err(|e| ProxyError::validation(format!("invalid step: {}", e)))?,
                None => std::time::Duration::from_secs(DEFAULT_STEP_SECONDS),
            };
            (start, step)
        }
        other => {
            return Err(ProxyError::validation(format!(
                "cannot classify query cost for path {:?}",
                other
            )))
        }
    };

    let earliest = earliest_sample(query, start)?;
    trace!(
        "classified query {:?} (start {}, step {:?}): earliest sample {}",
        query,
        start,
        step,
        earliest
    );

    if earliest < now - Duration::hours(RECENT_WINDOW_HOURS) {
        Ok(QueryCost::High)
    } else {
        Ok(QueryCost::Low)
    }
}

/// Lower bound on the timestamps `query` touches when evaluated from `start`:
/// the widest range selector plus the widest offset, then the lookback delta.
/// A conservative stand-in for full expression-tree analysis.
fn earliest_sample(query: &str, start: DateTime<Utc>) -> ProxyResult<DateTime<Utc>> {
    let mut max_range = std::time::Duration::ZERO;
    for selector in RANGE_SELECTOR_REGEX.captures_iter(query) {
        let literal = selector[1].split(':').next().unwrap_or_default().trim();
        let range = durations::parse_duration(literal)
            .map_err(|e| ProxyError::validation(format!("invalid range selector: {}", e)))?;
        max_range = max_range.max(range);
    }

    let mut max_offset = std::time::Duration::ZERO;
    for offset in OFFSET_REGEX.captures_iter(query) {
        let parsed = durations::parse_duration(&offset[1])
            .map_err(|e| ProxyError::validation(format!("invalid offset: {}", e)))?;
        max_offset = max_offset.max(parsed);
    }

    let reach = chrono_duration(max_range)?
        + chrono_duration(max_offset)?
        + Duration::minutes(LOOKBACK_DELTA_MINUTES);
    Ok(start - reach)
}

/// Merges URL query parameters with form-encoded body parameters, the URL
/// taking precedence. The body is only read, never consumed.
fn query_params(request: &ProxyRequest) -> HashMap<String, String> {
    let mut params = HashMap::new();
    if let Some(query) = request.uri.query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    if request.method == Method::POST && is_form_encoded(request) {
        for (key, value) in url::form_urlencoded::parse(&request.body) {
            params
                .entry(key.into_owned())
                .or_insert_with(|| value.into_owned());
        }
    }
    params
}

fn is_form_encoded(request: &ProxyRequest) -> bool {
    request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<mime::Mime>().ok())
        .map(|m| m.type_() == mime::APPLICATION && m.subtype() == mime::WWW_FORM_URLENCODED)
        .unwrap_or(false)
}

fn required<'p>(params: &'p HashMap<String, String>, name: &str) -> ProxyResult<&'p String> {
    params
        .get(name)
        .ok_or_else(|| ProxyError::validation(format!("{} parameter is required", name)))
}

fn parse_time(value: &str) -> ProxyResult<DateTime<Utc>> {
    durations::parse_timestamp(value).map_err(ProxyError::validation)
}

fn chrono_duration(duration: std::time::Duration) -> ProxyResult<Duration> {
    Duration::from_std(duration)
        .map_err(|_| ProxyError::validation(format!("duration out of range: {:?}", duration)))
}
