//! HTTP utilities for GCP REST API calls
//!
//! [`classify_status`] is the only place where provider status codes and
//! error bodies are inspected.

use crate::error::HydrateError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::time::Duration;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

/// Error reasons GCP reports with a 403 that actually mean "slow down"
const THROTTLE_REASONS: &[&str] = &[
    "rateLimitExceeded",
    "userRateLimitExceeded",
    "quotaExceeded",
    "RATE_LIMIT_EXCEEDED",
];

/// Sanitize response body for logging
/// Truncates long responses and strips control characters
fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// HTTP client wrapper for GCP API calls
#[derive(Clone)]
pub struct GcpHttpClient {
    client: Client,
}

impl GcpHttpClient {
    /// Create a new HTTP client with a per-call timeout
    pub fn new(timeout: Duration) -> Result<Self, HydrateError> {
        let client = Client::builder()
            .user_agent(concat!("gcptables/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| HydrateError::fatal(format!("failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Make a GET request to a GCP API, classifying any failure
    pub async fn get(
        &self,
        url: &str,
        token: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, HydrateError> {
        tracing::debug!("GET {}", url);

        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(classify_transport)?;

        if !status.is_success() {
            tracing::warn!("API error: {} - {}", status, sanitize_for_log(&body));
            return Err(classify_status(status, &headers, &body));
        }

        if body.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body)
            .map_err(|e| HydrateError::fatal(format!("failed to parse response JSON: {e}")))
    }
}

/// Map a non-success HTTP response to the closed error set
pub fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> HydrateError {
    let message = format!("API request failed: {}", status);

    if status == StatusCode::TOO_MANY_REQUESTS {
        return HydrateError::throttled(parse_retry_after(headers), message);
    }

    if status == StatusCode::FORBIDDEN && has_throttle_reason(body) {
        return HydrateError::throttled(parse_retry_after(headers), message);
    }

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            HydrateError::permission_denied(message)
        }
        StatusCode::REQUEST_TIMEOUT
        | StatusCode::INTERNAL_SERVER_ERROR
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT => HydrateError::transient(message),
        s if s.is_server_error() => HydrateError::transient(message),
        _ => HydrateError::fatal(message),
    }
}

fn classify_transport(error: reqwest::Error) -> HydrateError {
    if error.is_builder() {
        HydrateError::fatal(format!("invalid request: {error}"))
    } else {
        // Timeouts, connection resets and truncated bodies are all worth retrying
        HydrateError::transient(format!("request failed: {error}"))
    }
}

/// Look for a throttling reason in a GCP error body:
/// `{"error": {"errors": [{"reason": "rateLimitExceeded"}], "status": "..."}}`
fn has_throttle_reason(body: &str) -> bool {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return false;
    };
    let Some(error) = value.get("error") else {
        return false;
    };

    let in_errors = error
        .get("errors")
        .and_then(|v| v.as_array())
        .map(|errors| {
            errors.iter().any(|e| {
                e.get("reason")
                    .and_then(|r| r.as_str())
                    .map(|r| THROTTLE_REASONS.contains(&r))
                    .unwrap_or(false)
            })
        })
        .unwrap_or(false);

    let in_status = error
        .get("status")
        .and_then(|s| s.as_str())
        .map(|s| s == "RESOURCE_EXHAUSTED")
        .unwrap_or(false);

    in_errors || in_status
}

/// Parse a Retry-After header: either delta-seconds or an HTTP-date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(secs) = raw.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let at = chrono::DateTime::parse_from_rfc2822(raw).ok()?;
    let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use reqwest::header::HeaderValue;

    fn kind(status: u16, body: &str) -> ErrorKind {
        let status = StatusCode::from_u16(status).unwrap();
        classify_status(status, &HeaderMap::new(), body).kind()
    }

    #[test]
    fn test_classify_status_codes() {
        assert_eq!(kind(401, ""), ErrorKind::PermissionDenied);
        assert_eq!(kind(403, ""), ErrorKind::PermissionDenied);
        assert_eq!(kind(429, ""), ErrorKind::Throttled);
        assert_eq!(kind(503, ""), ErrorKind::Transient);
        assert_eq!(kind(500, ""), ErrorKind::Transient);
        assert_eq!(kind(400, ""), ErrorKind::Fatal);
        assert_eq!(kind(404, ""), ErrorKind::Fatal);
    }

    #[test]
    fn test_403_with_rate_limit_reason_is_throttled() {
        let body = r#"{"error":{"code":403,"errors":[{"reason":"userRateLimitExceeded"}]}}"#;
        assert_eq!(kind(403, body), ErrorKind::Throttled);
    }

    #[test]
    fn test_retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        let err = classify_status(StatusCode::TOO_MANY_REQUESTS, &headers, "");
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn test_retry_after_past_http_date_is_zero() {
        let mut headers = HeaderMap::new();
        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(parse_retry_after(&headers), Some(Duration::ZERO));
    }

    #[test]
    fn test_sanitize_truncates() {
        let long = "x".repeat(500);
        let sanitized = sanitize_for_log(&long);
        assert!(sanitized.contains("truncated, 500 bytes total"));
        assert_eq!(sanitize_for_log("a\nb"), "ab");
    }
}
