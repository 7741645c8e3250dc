// ABOUTME: HTTP middleware for rate limiting, CSRF protection, and request validation
// ABOUTME: Shared helpers for client identification, cookies, and JSON error responses

pub mod csrf;
pub mod rate_limit;
pub mod validate;

use axum::extract::ConnectInfo;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::net::SocketAddr;

/// Identify the client behind a request: first X-Forwarded-For hop,
/// then X-Real-IP, then the socket peer address.
pub fn client_key(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    connect_info
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Uniform JSON error body used by every middleware rejection.
pub fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

/// Extract a named cookie value from the Cookie header.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(axum::http::header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let mut parts = pair.trim().splitn(2, '=');
        if parts.next() == Some(name) {
            return parts.next().map(|v| v.to_string());
        }
    }
    None
}

/// Compare two byte strings in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with(name: &'static str, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(name, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_client_key_prefers_forwarded_for() {
        let headers = headers_with("x-forwarded-for", "203.0.113.9, 10.0.0.1");
        assert_eq!(client_key(&headers, None), "203.0.113.9");
    }

    #[test]
    fn test_client_key_real_ip_fallback() {
        let headers = headers_with("x-real-ip", "198.51.100.4");
        assert_eq!(client_key(&headers, None), "198.51.100.4");
    }

    #[test]
    fn test_client_key_peer_fallback() {
        let addr: SocketAddr = "192.0.2.1:4321".parse().unwrap();
        let info = ConnectInfo(addr);
        assert_eq!(client_key(&HeaderMap::new(), Some(&info)), "192.0.2.1");
    }

    #[test]
    fn test_client_key_unknown_without_peer() {
        assert_eq!(client_key(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn test_cookie_value_parses_multiple() {
        let headers = headers_with("cookie", "a=1; csrf_token=abc%7Cdef; b=2");
        assert_eq!(
            cookie_value(&headers, "csrf_token").as_deref(),
            Some("abc%7Cdef")
        );
        assert_eq!(cookie_value(&headers, "b").as_deref(), Some("2"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"same", b"same"));
        assert!(!constant_time_eq(b"same", b"diff"));
        assert!(!constant_time_eq(b"short", b"longer"));
        assert!(constant_time_eq(b"", b""));
    }
}
