//! Rate-limit signatures and wait arithmetic.

use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Which collaborator hit the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitSource {
    Agent,
    Judge,
}

impl fmt::Display for RateLimitSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitSource::Agent => f.write_str("agent"),
            RateLimitSource::Judge => f.write_str("judge"),
        }
    }
}

/// One observed rate-limit signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub source: RateLimitSource,
    /// Seconds the provider asked us to wait; `None` falls back to the configured default.
    pub retry_after_secs: Option<f64>,
    pub message: String,
    pub detected_at: DateTime<Utc>,
}

impl RateLimitInfo {
    pub fn new(source: RateLimitSource, retry_after_secs: Option<f64>, message: &str) -> Self {
        Self {
            source,
            retry_after_secs,
            message: message.to_string(),
            detected_at: Utc::now(),
        }
    }

    /// Retry-after (or the default) padded by `buffer_fraction`.
    pub fn wait_duration(&self, default_secs: u64, buffer_fraction: f64) -> Duration {
        let base = self
            .retry_after_secs
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .unwrap_or(default_secs as f64);
        let padded = base * (1.0 + buffer_fraction.max(0.0));
        Duration::from_millis((padded * 1000.0).round() as u64)
    }

    /// Keep the longer of two retry-after values.
    pub fn lengthen(&mut self, other: &RateLimitInfo) {
        match (self.retry_after_secs, other.retry_after_secs) {
            (Some(current), Some(candidate)) if candidate > current => {
                self.retry_after_secs = Some(candidate);
            }
            (None, Some(candidate)) => self.retry_after_secs = Some(candidate),
            _ => {}
        }
    }
}

static SIGNATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(\b429\b|rate[ _-]?limit|too many requests|hit your limit|overloaded)")
        .unwrap_or_else(|err| panic!("invalid rate limit signature regex: {err}"))
});

static RETRY_AFTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)retry[ _-]?after"?\s*[:=]?\s*"?(\d+(?:\.\d+)?)(?:\s*(ms|milliseconds|s|sec|secs|seconds|m|min|minutes)\b)?"#)
        .unwrap_or_else(|err| panic!("invalid retry-after regex: {err}"))
});

/// Classify collaborator output; returns the parsed signal when it looks like a rate limit.
pub fn detect_rate_limit(source: RateLimitSource, text: &str) -> Option<RateLimitInfo> {
    let found = SIGNATURE.find(text)?;
    let line = text[..found.start()]
        .rfind('\n')
        .map_or(0, |idx| idx + 1);
    let end = text[found.end()..]
        .find('\n')
        .map_or(text.len(), |idx| found.end() + idx);
    let message = text[line..end].trim();
    Some(RateLimitInfo::new(
        source,
        parse_retry_after(text),
        message,
    ))
}

/// Whether `text` contains a rate-limit fingerprint.
pub fn has_rate_limit_signature(text: &str) -> bool {
    SIGNATURE.is_match(text)
}

fn parse_retry_after(text: &str) -> Option<f64> {
    let caps = RETRY_AFTER.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map_or("s", |unit| unit.as_str());
    let secs = match unit.to_ascii_lowercase().as_str() {
        "ms" | "milliseconds" => value / 1000.0,
        "m" | "min" | "minutes" => value * 60.0,
        _ => value,
    };
    Some(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_signatures() {
        for text in [
            "HTTP 429 from upstream",
            "Error: Rate limit exceeded",
            "too many requests, slow down",
            "You've hit your limit for today",
            "model is overloaded",
        ] {
            assert!(
                detect_rate_limit(RateLimitSource::Agent, text).is_some(),
                "{text}"
            );
        }
        assert!(detect_rate_limit(RateLimitSource::Agent, "compiled 4290 files").is_none());
        assert!(detect_rate_limit(RateLimitSource::Agent, "all good").is_none());
    }

    #[test]
    fn parses_retry_after_units() {
        let info = detect_rate_limit(
            RateLimitSource::Judge,
            "status 429\nretry-after: 30\n",
        )
        .expect("detected");
        assert_eq!(info.retry_after_secs, Some(30.0));
        assert_eq!(info.message, "status 429");
        assert_eq!(info.source, RateLimitSource::Judge);

        let info = detect_rate_limit(RateLimitSource::Agent, "rate limited, retry after 2 minutes")
            .expect("detected");
        assert_eq!(info.retry_after_secs, Some(120.0));

        let info = detect_rate_limit(RateLimitSource::Agent, "rate_limit {\"retry_after\": 1500ms}")
            .expect("detected");
        assert_eq!(info.retry_after_secs, Some(1.5));
    }

    #[test]
    fn wait_applies_default_and_buffer() {
        let info = RateLimitInfo::new(RateLimitSource::Agent, None, "429");
        assert_eq!(info.wait_duration(60, 0.1), Duration::from_secs(66));

        let info = RateLimitInfo::new(RateLimitSource::Agent, Some(10.0), "429");
        assert_eq!(info.wait_duration(60, 0.0), Duration::from_secs(10));
    }

    #[test]
    fn lengthen_only_grows() {
        let mut info = RateLimitInfo::new(RateLimitSource::Agent, Some(10.0), "a");
        info.lengthen(&RateLimitInfo::new(RateLimitSource::Judge, Some(5.0), "b"));
        assert_eq!(info.retry_after_secs, Some(10.0));
        info.lengthen(&RateLimitInfo::new(RateLimitSource::Judge, Some(25.0), "c"));
        assert_eq!(info.retry_after_secs, Some(25.0));
        assert_eq!(info.message, "a");
    }
}
