// ABOUTME: CSRF protection combining HMAC-signed synchroniser tokens with double-submit cookies
// ABOUTME: Safe methods pass through (and get a cookie); unsafe methods must present matching proof

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::config::{CsrfConfig, CsrfMode};
use crate::middleware::{constant_time_eq, cookie_value, error_response};

type HmacSha256 = Hmac<Sha256>;

const ISSUED_SWEEP_PERIOD: Duration = Duration::from_secs(3600);

/// Form field consulted when the CSRF header is absent.
const FORM_FIELD: &str = "csrf_token";

/// Largest form body the middleware will buffer looking for the token field.
const MAX_FORM_BYTES: usize = 1024 * 1024;

/// Issues and verifies CSRF tokens of the form `nonce|expiry|hex(sig)`,
/// where expiry is RFC 3339 and sig is HMAC-SHA256 over `nonce|expiry`.
///
/// A SHA-256 hash of every issued token is kept in a TTL map so validation
/// can short-circuit on membership before falling back to the signature.
pub struct CsrfProtect {
    mac: HmacSha256,
    mode: CsrfMode,
    issued: Mutex<HashMap<[u8; 32], DateTime<Utc>>>,
    ttl_secs: i64,
    pub cookie_name: String,
    pub header_name: String,
    secure_cookies: bool,
    skip_paths: Vec<String>,
    enabled: bool,
}

impl CsrfProtect {
    pub fn new(config: &CsrfConfig, secret: &str) -> Result<Arc<Self>> {
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .context("Failed to initialize CSRF HMAC key")?;
        Ok(Arc::new(Self {
            mac,
            mode: config.mode,
            issued: Mutex::new(HashMap::new()),
            ttl_secs: config.token_ttl_secs as i64,
            cookie_name: config.cookie_name.clone(),
            header_name: config.header_name.clone(),
            secure_cookies: config.secure_cookies,
            skip_paths: config.skip_paths.clone(),
            enabled: config.enabled,
        }))
    }

    /// Mint a fresh token for the configured mode: a signed synchroniser
    /// token, or a bare random value for stateless double-submit.
    pub fn issue(&self) -> String {
        match self.mode {
            CsrfMode::Synchroniser => self.issue_token(),
            CsrfMode::DoubleSubmit => random_nonce(),
        }
    }

    /// Mint a fresh signed token valid for the configured TTL.
    pub fn issue_token(&self) -> String {
        let nonce = random_nonce();
        let expiry = Utc::now() + ChronoDuration::seconds(self.ttl_secs);
        let expiry_str = expiry.to_rfc3339_opts(SecondsFormat::Secs, true);
        let signature = self.sign(&nonce, &expiry_str);
        let token = format!("{}|{}|{}", nonce, expiry_str, signature);

        self.issued
            .lock()
            .expect("issued lock poisoned")
            .insert(token_hash(&token), expiry);
        token
    }

    /// Verify structure, expiry, and signature. Tokens this instance issued
    /// hit the membership map first and skip the HMAC work.
    pub fn validate_token(&self, token: &str) -> std::result::Result<(), &'static str> {
        if token.is_empty() {
            return Err("empty token");
        }

        let mut parts = token.splitn(3, '|');
        let (nonce, expiry_str, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(n), Some(e), Some(s)) if !n.is_empty() && !s.is_empty() => (n, e, s),
            _ => return Err("malformed token"),
        };
        let expiry = DateTime::parse_from_rfc3339(expiry_str).map_err(|_| "malformed token")?;
        if Utc::now() > expiry {
            return Err("token expired");
        }

        {
            let issued = self.issued.lock().expect("issued lock poisoned");
            if let Some(stored_expiry) = issued.get(&token_hash(token)) {
                if Utc::now() <= *stored_expiry {
                    return Ok(());
                }
            }
        }

        let signature_bytes = hex_decode(signature).ok_or("malformed token")?;
        let mut mac = self.mac.clone();
        mac.update(format!("{}|{}", nonce, expiry_str).as_bytes());
        mac.verify_slice(&signature_bytes).map_err(|_| "bad signature")
    }

    fn sign(&self, nonce: &str, expiry_str: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(format!("{}|{}", nonce, expiry_str).as_bytes());
        hex_encode(&mac.finalize().into_bytes())
    }

    /// Build the Set-Cookie header value carrying `token`.
    /// Cookie Expires matches the token's own expiry.
    pub fn set_cookie(&self, token: &str) -> String {
        let expiry = token
            .split('|')
            .nth(1)
            .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
            .map(|e| e.with_timezone(&Utc))
            .unwrap_or_else(|| Utc::now() + ChronoDuration::seconds(self.ttl_secs));
        let expires = expiry.format("%a, %d %b %Y %H:%M:%S GMT");
        let mut cookie = format!(
            "{}={}; Path=/; Expires={}; SameSite=Strict",
            self.cookie_name, token, expires
        );
        // The browser client reads this cookie to echo it in the header,
        // so HttpOnly would break the double-submit check.
        if self.secure_cookies {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// Evict expired entries from the issued-token map every hour.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let csrf = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ISSUED_SWEEP_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let mut issued = csrf.issued.lock().expect("issued lock poisoned");
                issued.retain(|_, expiry| *expiry > now);
                tracing::debug!(tracked = issued.len(), "CSRF token sweep complete");
            }
        })
    }

    fn skips(&self, path: &str) -> bool {
        self.skip_paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p)))
    }

    #[cfg(test)]
    fn issued_count(&self) -> usize {
        self.issued.lock().expect("issued lock poisoned").len()
    }
}

fn random_nonce() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn token_hash(token: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().into()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

pub async fn csrf_middleware(
    State(csrf): State<Arc<CsrfProtect>>,
    req: Request,
    next: Next,
) -> Response {
    if !csrf.enabled || csrf.skips(req.uri().path()) {
        return next.run(req).await;
    }

    if matches!(
        *req.method(),
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    ) {
        // Seed the double-submit cookie on first contact.
        let had_cookie = cookie_value(req.headers(), &csrf.cookie_name).is_some();
        let mut resp = next.run(req).await;
        if !had_cookie {
            let cookie = csrf.set_cookie(&csrf.issue());
            if let Ok(v) = HeaderValue::from_str(&cookie) {
                resp.headers_mut().append(axum::http::header::SET_COOKIE, v);
            }
        }
        return resp;
    }

    let path = req.uri().path().to_string();
    let cookie_token = cookie_value(req.headers(), &csrf.cookie_name);
    let header_token = req
        .headers()
        .get(&csrf.header_name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    // Header is preferred; fall back to a form field for plain form posts.
    let (submitted, req) = match header_token {
        Some(t) => (Some(t), req),
        None => form_token(req).await,
    };

    let (submitted, cookie_token) = match (submitted, cookie_token) {
        (Some(s), Some(c)) => (s, c),
        _ => {
            tracing::warn!(path = %path, "CSRF token missing");
            return error_response(StatusCode::FORBIDDEN, "CSRF token missing");
        }
    };

    // Double-submit: submitted token must match the cookie exactly.
    if !constant_time_eq(submitted.as_bytes(), cookie_token.as_bytes()) {
        tracing::warn!(path = %path, "CSRF token mismatch");
        return error_response(StatusCode::FORBIDDEN, "Invalid CSRF token");
    }

    // Synchroniser mode additionally requires a valid signature and expiry;
    // double-submit is stateless and stops at byte equality.
    if csrf.mode == CsrfMode::Synchroniser {
        if let Err(reason) = csrf.validate_token(&submitted) {
            tracing::warn!(path = %path, reason, "CSRF token rejected");
            return error_response(StatusCode::FORBIDDEN, "Invalid CSRF token");
        }
    }

    next.run(req).await
}

/// Pull the CSRF field out of a urlencoded form body, then rebuild the
/// request so the handler still sees the bytes.
async fn form_token(req: Request) -> (Option<String>, Request) {
    let is_form = req
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return (None, req);
    }

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_FORM_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return (None, Request::from_parts(parts, axum::body::Body::empty()));
        }
    };

    let token = std::str::from_utf8(&bytes).ok().and_then(|form| {
        form.split('&').find_map(|pair| {
            let mut kv = pair.splitn(2, '=');
            (kv.next() == Some(FORM_FIELD)).then(|| kv.next().unwrap_or("").to_string())
        })
    });

    (token, Request::from_parts(parts, axum::body::Body::from(bytes)))
}

// =============================================================================
// Tests
// =============================================================================
