//! Shared HTTP utilities for the reward-gated link workspace.
//!
//! Provides common response builders, time formatting, requester
//! identification, and query parsing used by the api-server.

use chrono::{DateTime, SecondsFormat, Utc};
use std::time::SystemTime;

// ============================================================================
// JSON Response Helpers (framework-agnostic)
// ============================================================================

/// Create a structured error JSON with a default message based on the code.
///
/// Returns: `{"error": {"code": "<code>", "message": "<default message>"}}`
pub fn json_err(code: &str) -> serde_json::Value {
    let message = match code {
        "not_found" => "Resource not found",
        "link_not_found" => "This link does not exist",
        "link_unavailable" => "This link is currently unavailable",
        "bad_request" => "Bad request",
        "invalid_code" => "Invalid short code format",
        "invalid_url" => "Invalid URL",
        "invalid_rule" => "Invalid rule",
        "invalid_amount" => "Invalid amount",
        "unauthorized" => "Authentication required",
        "forbidden" => "Access denied",
        "conflict" => "Resource already exists",
        "retry" => "Temporary conflict, please retry",
        "upstream_unavailable" => "Upstream service unavailable",
        "error" | "internal" => "Internal server error",
        _ => code, // Fallback to code as message for unknown codes
    };
    serde_json::json!({"error": {"code": code, "message": message}})
}

/// Create a structured error JSON with a custom message.
///
/// Returns: `{"error": {"code": "<code>", "message": "<message>"}}`
pub fn json_error_with_message(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({"error": {"code": code, "message": message}})
}

// ============================================================================
// URL Building
// ============================================================================

/// Build a short URL from a host and code.
///
/// If `domain` is set and non-empty, uses that as the base. Otherwise falls
/// back to `https://{host}/{code}` or `/{code}` if host is empty.
pub fn build_short_url(domain: Option<&str>, host: &str, code: &str) -> String {
    if let Some(dom) = domain.filter(|d| !d.is_empty()) {
        return format!("{}/{}", dom.trim_end_matches('/'), code);
    }
    if host.is_empty() {
        format!("/{}", code)
    } else {
        format!("https://{}/{}", host, code)
    }
}

// ============================================================================
// Time Utilities
// ============================================================================

/// Convert SystemTime to RFC3339 string (millisecond precision, UTC).
pub fn system_time_to_rfc3339(t: SystemTime) -> String {
    let dt: DateTime<Utc> = t.into();
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC3339 string to SystemTime.
///
/// Returns an error if the string is not a valid RFC3339 timestamp.
pub fn rfc3339_to_system_time(s: &str) -> Result<SystemTime, chrono::ParseError> {
    let dt = DateTime::parse_from_rfc3339(s)?;
    Ok(dt.with_timezone(&Utc).into())
}

// ============================================================================
// Requester identification
// ============================================================================

/// Best-effort client address for dedup: the first `X-Forwarded-For` hop,
/// then `X-Real-IP`, then the socket peer. Returns `None` when nothing
/// usable is present.
pub fn requester_key_from_headers(
    forwarded_for: Option<&str>,
    real_ip: Option<&str>,
    peer: Option<&str>,
) -> Option<String> {
    forwarded_for
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|s| !s.is_empty()))
        .or_else(|| peer.map(str::trim).filter(|s| !s.is_empty()))
        .map(str::to_string)
}

// ============================================================================
// Query Parsing
// ============================================================================

/// Parse a `limit` query parameter from a query string.
///
/// Returns `Some(n)` if `limit=n` is found and `n` is in range 1-500.
/// Returns `None` otherwise.
pub fn parse_limit_query(query: Option<&str>) -> Option<usize> {
    let q = query?;
    for pair in q.split('&') {
        let mut it = pair.splitn(2, '=');
        let key = it.next()?;
        if key == "limit" {
            if let Some(val) = it.next() {
                if let Ok(n) = val.parse::<usize>() {
                    if (1..=500).contains(&n) {
                        return Some(n);
                    }
                }
            }
        }
    }
    None
}

/// Parse a boolean-ish flag (`1`, `true`, `yes`, `on`), case-insensitive.
pub fn is_truthy(s: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|t| s.trim().eq_ignore_ascii_case(t))
}
