//! Prometheus-style duration and timestamp parsing.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // e.g. "1h30m", "90s", "500ms". Units must appear in descending order and
    // at least one must be present.
    static ref DURATION_REGEX: Regex = Regex::new(
        r"(?x)
^
(?:(?P<y>[0-9]+)y)?
(?:(?P<w>[0-9]+)w)?
(?:(?P<d>[0-9]+)d)?
(?:(?P<h>[0-9]+)h)?
(?:(?P<m>[0-9]+)m)?
(?:(?P<s>[0-9]+)s)?
(?:(?P<ms>[0-9]+)ms)?
$
"
    )
    .unwrap();
}

/// Parses either bare float seconds ("30", "1.5") or a Prometheus duration
/// literal ("5m", "1h30m", "500ms").
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    if let Ok(seconds) = value.parse::<f64>() {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(format!("duration out of range: {:?}", value));
        }
        return Ok(Duration::from_secs_f64(seconds));
    }

    let captures = match DURATION_REGEX.captures(value) {
        Some(captures) if !value.is_empty() => captures,
        _ => return Err(format!("not a valid duration string: {:?}", value)),
    };

    let mut millis = 0u64;
    let mut matched = false;
    for (group, unit_millis) in [
        ("y", 365 * 24 * 3_600_000),
        ("w", 7 * 24 * 3_600_000),
        ("d", 24 * 3_600_000),
        ("h", 3_600_000),
        ("m", 60_000),
        ("s", 1_000),
        ("ms", 1),
    ] {
        if let Some(figure) = captures.name(group) {
            let figure: u64 = figure
                .as_str()
                .parse()
                .map_err(|_| format!("not a valid duration string: {:?}", value))?;
            millis = millis
                .checked_add(figure.saturating_mul(unit_millis))
                .ok_or_else(|| format!("duration out of range: {:?}", value))?;
            matched = true;
        }
    }

    if !matched {
        return Err(format!("not a valid duration string: {:?}", value));
    }
    Ok(Duration::from_millis(millis))
}

/// Parses either float unix-seconds ("1712345678.25") or an RFC3339 timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(seconds) = value.parse::<f64>() {
        let whole = seconds.trunc() as i64;
        let nanos = ((seconds - whole as f64) * 1e9) as u32;
        return DateTime::from_timestamp(whole, nanos)
            .ok_or_else(|| format!("timestamp out of range: {:?}", value));
    }

    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|e| format!("not a valid timestamp: {:?}: {}", value, e))
}
