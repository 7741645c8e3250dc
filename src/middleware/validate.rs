// ABOUTME: Request validation middleware: URL caps, content-type whitelist, injection scanning
// ABOUTME: Rejects SQL-injection, XSS, and path-traversal patterns in paths and query parameters

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::RegexSet;
use serde_json::json;
use std::sync::Arc;

use crate::config::SecurityConfig;
use crate::middleware::error_response;

const SQLI_PATTERNS: &[&str] = &[
    r"(?i)\bunion(\s+all)?\s+select\b",
    r"(?i)\bselect\s+.+\s+from\b",
    r"(?i)\binsert\s+into\b",
    r"(?i)\bdelete\s+from\b",
    r"(?i)\bdrop\s+(table|database)\b",
    r"(?i)\bupdate\s+\S+\s+set\b",
    r"(?i)'\s*(or|and)\s+'?\d",
    r"(?i)'\s*or\s*'[^']*'\s*=\s*'",
    r"--\s*$",
    r"(?i);\s*(drop|delete|truncate)\b",
];

const XSS_PATTERNS: &[&str] = &[
    r"(?i)<\s*script",
    r"(?i)<\s*/\s*script",
    r"(?i)javascript\s*:",
    r"(?i)\bon(load|error|click|mouseover|focus|submit)\s*=",
    r"(?i)<\s*(iframe|object|embed)",
    r"(?i)document\s*\.\s*(cookie|location)",
];

const TRAVERSAL_PATTERNS: &[&str] = &[r"\.\./", r"\.\.\\", r"(?i)/etc/(passwd|shadow)", r"(?i)\\windows\\"];

/// Compiled scanning state shared across requests.
pub struct RequestValidator {
    max_url_len: usize,
    allowed_content_types: Vec<String>,
    allowed_origins: Vec<String>,
    force_https: bool,
    sqli: RegexSet,
    xss: RegexSet,
    traversal: RegexSet,
}

impl RequestValidator {
    pub fn new(config: &SecurityConfig) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            max_url_len: config.max_url_len,
            allowed_content_types: config.allowed_content_types.clone(),
            allowed_origins: config.allowed_origins.clone(),
            force_https: config.force_https,
            sqli: RegexSet::new(SQLI_PATTERNS).context("Invalid SQL injection patterns")?,
            xss: RegexSet::new(XSS_PATTERNS).context("Invalid XSS patterns")?,
            traversal: RegexSet::new(TRAVERSAL_PATTERNS)
                .context("Invalid path traversal patterns")?,
        }))
    }

    /// Scan one value, returning the attack category on a hit.
    pub fn scan(&self, value: &str) -> Option<&'static str> {
        let decoded = percent_decode(value);
        for candidate in [value, decoded.as_str()] {
            if self.sqli.is_match(candidate) {
                return Some("sql_injection");
            }
            if self.xss.is_match(candidate) {
                return Some("xss");
            }
            if self.traversal.is_match(candidate) {
                return Some("path_traversal");
            }
        }
        None
    }

    fn origin_allowed(&self, origin: &str) -> bool {
        self.allowed_origins.is_empty()
            || self
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    }

    fn content_type_allowed(&self, content_type: &str) -> bool {
        let media_type = content_type
            .split(';')
            .next()
            .unwrap_or(content_type)
            .trim();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(media_type))
    }
}

pub async fn validate_middleware(
    State(validator): State<Arc<RequestValidator>>,
    req: Request,
    next: Next,
) -> Response {
    if validator.force_https {
        let forwarded_proto = req
            .headers()
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok());
        if forwarded_proto == Some("http") {
            if let Some(location) = https_location(&req) {
                return Response::builder()
                    .status(StatusCode::PERMANENT_REDIRECT)
                    .header(axum::http::header::LOCATION, location)
                    .body(axum::body::Body::empty())
                    .unwrap_or_else(|_| {
                        error_response(StatusCode::BAD_REQUEST, "Invalid redirect target")
                    });
            }
        }
    }

    let uri = req.uri().to_string();
    if uri.len() > validator.max_url_len {
        tracing::warn!(len = uri.len(), "URL exceeds length cap");
        return error_response(StatusCode::URI_TOO_LONG, "URL too long");
    }

    let path = req.uri().path();
    if let Some(category) = validator.scan(path) {
        tracing::warn!(path = %path, category, "Rejected suspicious path");
        return validation_error("path", category);
    }

    for (name, value) in query_pairs(req.uri().query().unwrap_or("")) {
        if let Some(category) = validator.scan(&value).or_else(|| validator.scan(&name)) {
            tracing::warn!(parameter = %name, category, "Rejected suspicious query parameter");
            return validation_error(&name, category);
        }
    }

    let unsafe_method = !matches!(
        *req.method(),
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    );
    let content_type = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());
    if unsafe_method {
        let origin = req
            .headers()
            .get(axum::http::header::ORIGIN)
            .and_then(|v| v.to_str().ok());
        if let Some(origin) = origin {
            if !validator.origin_allowed(origin) {
                tracing::warn!(origin = %origin, "Rejected origin");
                return error_response(StatusCode::FORBIDDEN, "Origin not allowed");
            }
        }
        if let Some(ref ct) = content_type {
            if !validator.content_type_allowed(ct) {
                tracing::warn!(content_type = %ct, "Rejected content type");
                return error_response(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported media type");
            }
        }
    }

    // JSON bodies must be valid UTF-8; invalid runes become U+FFFD so
    // downstream serde sees well-formed text.
    let req = if content_type
        .as_deref()
        .is_some_and(|ct| ct.starts_with("application/json"))
    {
        match sanitize_utf8(req).await {
            Ok(req) => req,
            Err(resp) => return resp,
        }
    } else {
        req
    };

    next.run(req).await
}

/// HTTPS form of the request URL, derived from the Host header.
fn https_location(req: &Request) -> Option<String> {
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())?;
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    Some(format!("https://{}{}", host, path_and_query))
}

fn validation_error(parameter: &str, category: &'static str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "Invalid input detected",
            "parameter": parameter,
            "category": category,
        })),
    )
        .into_response()
}

async fn sanitize_utf8(req: Request) -> std::result::Result<Request, Response> {
    let (parts, body) = req.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Unreadable request body"))?;
    let sanitized = String::from_utf8_lossy(&bytes).into_owned();
    Ok(Request::from_parts(parts, axum::body::Body::from(sanitized)))
}

/// Split a raw query string into decoded name/value pairs.
fn query_pairs(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut kv = pair.splitn(2, '=');
            (
                percent_decode(kv.next().unwrap_or("")),
                percent_decode(kv.next().unwrap_or("")),
            )
        })
        .collect()
}

/// Minimal percent-decoding; '+' is treated as a space.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if let Some(hex) = input.get(i + 1..i + 3) {
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(b'%');
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// =============================================================================
// Tests
// =============================================================================
