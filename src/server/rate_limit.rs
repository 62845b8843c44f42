//! Per-client request limiting for the gateway.
//!
//! A fixed one-minute window per client address, held in memory. Counters
//! reset when the process restarts.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tokio::sync::RwLock;

use crate::server::types::ApiError;

const WINDOW: Duration = Duration::from_secs(60);

/// Past this many tracked clients, expired windows are dropped on the next check.
const PRUNE_THRESHOLD: usize = 10_000;

/// Paths that are never counted.
const EXEMPT_PATHS: &[&str] = &["/healthz"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }
}

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl WindowState {
    fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            count: 0,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= WINDOW
    }

    fn time_until_reset(&self, now: Instant) -> Duration {
        WINDOW.saturating_sub(now.duration_since(self.window_start))
    }
}

/// In-memory limiter keyed by client.
pub struct RateLimiter {
    per_minute: u32,
    state: RwLock<HashMap<String, WindowState>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            state: RwLock::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.per_minute
    }

    pub fn enabled(&self) -> bool {
        self.per_minute > 0
    }

    /// Count one request for `client` unless its window is already full.
    pub async fn check_and_record(&self, client: &str) -> RateLimitResult {
        self.check_at(client, Instant::now()).await
    }

    async fn check_at(&self, client: &str, now: Instant) -> RateLimitResult {
        if !self.enabled() {
            return RateLimitResult::Allowed {
                remaining: u32::MAX,
            };
        }

        let mut state = self.state.write().await;
        if state.len() > PRUNE_THRESHOLD {
            state.retain(|_, window| !window.expired(now));
        }

        let window = state
            .entry(client.to_string())
            .or_insert_with(|| WindowState::new(now));
        if window.expired(now) {
            *window = WindowState::new(now);
        }

        if window.count >= self.per_minute {
            return RateLimitResult::Limited {
                retry_after: window.time_until_reset(now),
            };
        }
        window.count += 1;
        RateLimitResult::Allowed {
            remaining: self.per_minute - window.count,
        }
    }

    pub async fn tracked_clients(&self) -> usize {
        self.state.read().await.len()
    }
}

/// The peer address when the server was started with connect info, else a
/// shared bucket.
fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "local".to_string())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    if !limiter.enabled() || EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let client = client_key(&request);
    match limiter.check_and_record(&client).await {
        RateLimitResult::Allowed { remaining } => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("ratelimit-limit", HeaderValue::from(limiter.limit()));
            headers.insert("ratelimit-remaining", HeaderValue::from(remaining));
            response
        }
        RateLimitResult::Limited { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            tracing::warn!(client = %client, path = %request.uri().path(), "Rate limit exceeded");
            let mut response = ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                "RateLimited",
                format!("more than {} requests per minute", limiter.limit()),
            )
            .into_response();
            let headers = response.headers_mut();
            headers.insert(header::RETRY_AFTER, HeaderValue::from(secs));
            headers.insert("ratelimit-limit", HeaderValue::from(limiter.limit()));
            headers.insert("ratelimit-remaining", HeaderValue::from(0u32));
            response
        }
    }
}
