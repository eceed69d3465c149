//! Normalization of provider-specific failures into the error taxonomy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use gd_core::{ProviderError, ProviderId};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};

/// Map an HTTP error response onto the taxonomy.
///
/// 429 and quota-flavored bodies are `Throttled`; 401/403 without a quota
/// body are `AuthFailure`; 408 and 5xx are `Transient`; remaining 4xx are
/// `Permanent` (the request itself is unacceptable and no other provider
/// will accept it either).
pub fn classify_response(
    provider: ProviderId,
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
) -> ProviderError {
    let excerpt = body_excerpt(body);

    if status == StatusCode::TOO_MANY_REQUESTS || is_rate_or_quota_body(body) {
        let mut message = format!("status {status}: {excerpt}");
        if let Some(retry_after) = parse_retry_after(headers) {
            message.push_str(&format!(" (retry after {}s)", retry_after.as_secs()));
        }
        return ProviderError::throttled(provider, message);
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ProviderError::auth_failure(provider, format!("status {status}: {excerpt}"));
    }

    if status == StatusCode::REQUEST_TIMEOUT || status.is_server_error() {
        return ProviderError::transient(provider, format!("status {status}: {excerpt}"));
    }

    ProviderError::permanent(provider, format!("status {status}: {excerpt}"))
}

/// Transport-level failures (connect refused, timeout, decode) are all
/// retryable against another provider.
pub fn classify_transport_error(provider: ProviderId, err: &reqwest::Error) -> ProviderError {
    let detail = if err.is_timeout() {
        "request timed out".to_string()
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("transport error: {err}")
    };
    ProviderError::transient(provider, detail)
}

/// Daily-quota exhaustion reads differently from per-minute throttling and
/// warrants a much longer cooldown.
pub fn is_quota_exhausted(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("quota") || lower.contains("billing") || lower.contains("exceeded your current")
}

fn is_rate_or_quota_body(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("quota")
        || lower.contains("insufficient_quota")
        || lower.contains("resource_exhausted")
}

/// Retry-After may be delta-seconds or an HTTP date.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let retry_at = DateTime::parse_from_rfc2822(raw).ok()?.with_timezone(&Utc);
    let seconds = (retry_at - Utc::now()).num_seconds().max(0) as u64;
    Some(Duration::from_secs(seconds))
}

fn body_excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 200 {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(200).collect();
        format!("{head}...")
    }
}
