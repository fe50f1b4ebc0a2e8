//! Rate-limit retry policy.
//!
//! Only HTTP 429 is retried. The wait before the next attempt comes from the
//! first source that yields a positive duration:
//! 1. the `Retry-After` header, in (possibly fractional) seconds
//! 2. a `retryDelay` or `quotaResetDelay` entry in the error body's `details`
//! 3. exponential backoff from [`RetryPolicy::base_delay`], capped at
//!    [`RetryPolicy::max_delay`]

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff for a zero-based attempt: `base_delay * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    retry_delay: Option<String>,
    quota_reset_delay: Option<String>,
}

/// Picks the wait before retrying a 429 response.
pub fn retry_delay(body: &[u8], headers: &HeaderMap, attempt: u32, policy: &RetryPolicy) -> Duration {
    if let Some(delay) = retry_after_header(headers) {
        return delay;
    }

    if let Some(delay) = body_retry_delay(body) {
        return delay;
    }

    policy.backoff(attempt)
}

fn retry_after_header(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    let secs = raw.trim().parse::<f64>().ok()?;
    if secs <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(secs).ok()
}

fn body_retry_delay(body: &[u8]) -> Option<Duration> {
    let envelope = serde_json::from_slice::<ErrorEnvelope>(body).ok()?;
    envelope.error.details.iter().find_map(|detail| {
        detail
            .retry_delay
            .as_deref()
            .and_then(parse_duration)
            .or_else(|| detail.quota_reset_delay.as_deref().and_then(parse_duration))
    })
}

/// Parses Go-style duration strings such as `"0.420051630s"`, `"420.05ms"` or
/// `"1m30s"`. Returns `None` for empty, malformed or zero durations.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return None;
    }

    let mut total_secs = 0.0_f64;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_end == 0 {
            return None;
        }
        let value = rest[..number_end].parse::<f64>().ok()?;
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" | "µs" | "μs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        total_secs += value * scale;
        rest = &rest[unit_end..];
    }

    Duration::try_from_secs_f64(total_secs)
        .ok()
        .filter(|delay| !delay.is_zero())
}

#[cfg(test)]
mod tests {
    use reqwest::header::HeaderValue;
    use serde_json::json;

    use super::*;

    fn headers_with_retry_after(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).expect("header value"));
        headers
    }

    fn quota_body(retry_delay: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "error": {
                "code": 429,
                "message": "Resource has been exhausted",
                "details": [
                    {"@type": "type.googleapis.com/google.rpc.ErrorInfo", "reason": "RATE_LIMIT_EXCEEDED"},
                    {"@type": "type.googleapis.com/google.rpc.RetryInfo", "retryDelay": retry_delay}
                ]
            }
        }))
        .expect("serializes")
    }

    #[test]
    fn retry_after_header_wins_over_body_and_backoff() {
        let policy = RetryPolicy::default();
        let delay = retry_delay(
            &quota_body("7s"),
            &headers_with_retry_after("2"),
            3,
            &policy,
        );
        assert_eq!(delay, Duration::from_secs(2));
    }

    #[test]
    fn fractional_retry_after_is_honoured() {
        let delay = retry_delay(
            b"",
            &headers_with_retry_after("0.25"),
            0,
            &RetryPolicy::default(),
        );
        assert_eq!(delay, Duration::from_millis(250));
    }

    #[test]
    fn body_retry_delay_used_when_header_missing_or_invalid() {
        let policy = RetryPolicy::default();
        let delay = retry_delay(
            &quota_body("0.420051630s"),
            &headers_with_retry_after("soon"),
            0,
            &policy,
        );
        assert_eq!(delay, Duration::from_nanos(420_051_630));
    }

    #[test]
    fn quota_reset_delay_is_second_choice_within_a_detail() {
        let body = serde_json::to_vec(&json!({
            "error": {"details": [{"quotaResetDelay": "1m30s"}]}
        }))
        .expect("serializes");
        let delay = retry_delay(&body, &HeaderMap::new(), 0, &RetryPolicy::default());
        assert_eq!(delay, Duration::from_secs(90));
    }

    #[test]
    fn falls_back_to_exponential_backoff() {
        let policy = RetryPolicy::default();
        let headers = HeaderMap::new();
        assert_eq!(
            retry_delay(b"not json", &headers, 0, &policy),
            Duration::from_millis(500)
        );
        assert_eq!(
            retry_delay(b"{}", &headers, 1, &policy),
            Duration::from_secs(1)
        );
        assert_eq!(
            retry_delay(b"", &headers, 4, &policy),
            Duration::from_secs(8)
        );
        assert_eq!(
            retry_delay(b"", &headers, 6, &policy),
            Duration::from_secs(30)
        );
        assert_eq!(
            retry_delay(b"", &headers, 40, &policy),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn zero_sources_are_skipped() {
        let body = serde_json::to_vec(&json!({
            "error": {"details": [{"retryDelay": "0s"}]}
        }))
        .expect("serializes");
        let delay = retry_delay(
            &body,
            &headers_with_retry_after("0"),
            1,
            &RetryPolicy::default(),
        );
        assert_eq!(delay, Duration::from_secs(1));
    }

    #[test]
    fn parse_duration_handles_go_formats() {
        assert_eq!(parse_duration("1.5s"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("10us"), Some(Duration::from_micros(10)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1m0.5s"), Some(Duration::from_millis(60_500)));
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("12"), None);
        assert_eq!(parse_duration("s"), None);
        assert_eq!(parse_duration("3 days"), None);
    }
}
