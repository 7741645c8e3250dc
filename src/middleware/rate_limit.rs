// ABOUTME: Token-bucket and sliding-window rate limiting with periodic state cleanup
// ABOUTME: Axum middleware attaching X-RateLimit headers and 429 responses

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::config::RateLimitConfig;
use crate::middleware::{client_key, error_response};

/// How often the background sweeper runs.
const SWEEP_PERIOD: Duration = Duration::from_secs(300);

// =============================================================================
// Token bucket
// =============================================================================

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Outcome of a limiter check, carries everything the response headers need.
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Unix time at which the bucket is back at full capacity.
    pub reset_unix: i64,
    pub retry_after_secs: u64,
}

/// Continuous-refill token bucket keyed by client.
pub struct TokenBucketLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate_per_sec: f64,
    burst: f64,
    limit: u64,
    interval_secs: u64,
    /// Keys idle for twice the interval are dropped by the sweeper.
    idle_max: Duration,
}

impl TokenBucketLimiter {
    pub fn new(requests_per_interval: f64, interval_secs: u64, burst: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate_per_sec: requests_per_interval / interval_secs.max(1) as f64,
            burst,
            limit: requests_per_interval as u64,
            interval_secs,
            idle_max: Duration::from_secs(interval_secs.max(1) * 2),
        }
    }

    /// Take one token for `key`, refilling by elapsed time first.
    /// Unknown clients start with a full bucket.
    pub fn allow(&self, key: &str) -> Decision {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }

        let secs_to_full = (self.burst - bucket.tokens) / self.rate_per_sec;
        Decision {
            allowed,
            limit: self.limit,
            remaining: bucket.tokens.floor() as u64,
            reset_unix: chrono::Utc::now().timestamp() + secs_to_full.ceil() as i64,
            retry_after_secs: self.interval_secs,
        }
    }

    fn sweep(&self) {
        let mut buckets = self.buckets.lock().expect("bucket lock poisoned");
        buckets.retain(|_, b| b.last_refill.elapsed() < self.idle_max);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.buckets.lock().expect("bucket lock poisoned").len()
    }
}

// =============================================================================
// Sliding window
// =============================================================================

/// Exact-count sliding window, used for authentication-tier endpoints
/// where bursts must not be forgiven.
pub struct SlidingWindowLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
    limit: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(limit: usize, window_secs: u64) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            limit,
            window: Duration::from_secs(window_secs),
        }
    }

    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("window lock poisoned");
        let hits = windows.entry(key.to_string()).or_default();

        while hits.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
            hits.pop_front();
        }
        if hits.len() >= self.limit {
            return false;
        }
        hits.push_back(now);
        true
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("window lock poisoned");
        windows.retain(|_, hits| {
            while hits.front().is_some_and(|t| now.duration_since(*t) >= self.window) {
                hits.pop_front();
            }
            !hits.is_empty()
        });
    }
}

// =============================================================================
// Combined limiter state + middleware
// =============================================================================

pub struct RateLimiters {
    pub api: TokenBucketLimiter,
    pub auth: SlidingWindowLimiter,
    auth_tier_paths: Vec<String>,
    skip_paths: Vec<String>,
    enabled: bool,
}

impl RateLimiters {
    pub fn new(config: &RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            api: TokenBucketLimiter::new(
                config.requests_per_interval,
                config.interval_secs,
                config.burst,
            ),
            auth: SlidingWindowLimiter::new(config.auth_limit, config.auth_window_secs),
            auth_tier_paths: config.auth_tier_paths.clone(),
            skip_paths: config.skip_paths.clone(),
            enabled: config.enabled,
        })
    }

    fn skips(&self, path: &str) -> bool {
        self.skip_paths.iter().any(|p| p == path)
    }

    fn auth_tier(&self, path: &str) -> bool {
        self.auth_tier_paths.iter().any(|p| p == path)
    }

    /// Periodically drop idle per-client state so the maps stay bounded.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiters = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_PERIOD);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                limiters.api.sweep();
                limiters.auth.sweep();
                tracing::debug!("Rate limiter sweep complete");
            }
        })
    }
}

pub async fn rate_limit_middleware(
    State(limiters): State<Arc<RateLimiters>>,
    req: Request,
    next: Next,
) -> Response {
    if !limiters.enabled || limiters.skips(req.uri().path()) {
        return next.run(req).await;
    }

    let connect_info = req.extensions().get::<ConnectInfo<SocketAddr>>().cloned();
    let client = client_key(req.headers(), connect_info.as_ref());
    let path = req.uri().path().to_string();

    if limiters.auth_tier(&path) {
        let auth_key = format!("user:{}:{}", client, path);
        if !limiters.auth.allow(&auth_key) {
            tracing::warn!(client = %client, path = %path, "Auth rate limit exceeded");
            return error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        }
    }

    let decision = limiters.api.allow(&client);
    if !decision.allowed {
        tracing::warn!(client = %client, path = %path, "Rate limit exceeded");
        let mut resp = error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        apply_headers(&mut resp, &decision);
        if let Ok(v) = HeaderValue::from_str(&decision.retry_after_secs.to_string()) {
            resp.headers_mut().insert("Retry-After", v);
        }
        return resp;
    }

    let mut resp = next.run(req).await;
    apply_headers(&mut resp, &decision);
    resp
}

fn apply_headers(resp: &mut Response, decision: &Decision) {
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert("X-RateLimit-Limit", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert("X-RateLimit-Remaining", v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset_unix.to_string()) {
        headers.insert("X-RateLimit-Reset", v);
    }
}

// =============================================================================
// Tests
// =============================================================================
