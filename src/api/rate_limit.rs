use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use super::error::ApiError;
use crate::config::RateLimitSettings;
use crate::error::DoraError;

/// Distinct clients tracked at once; past this, new clients share one overflow window
const MAX_TRACKED_CLIENTS: usize = 10_000;
const OVERFLOW_KEY: &str = "overflow";

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// Quota left for a client after an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allowance {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// Fixed-window request counter keyed by client address
pub struct RateLimiter {
    window: Duration,
    max_requests: u32,
    trust_forwarded_for: bool,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            window: settings.window,
            max_requests: settings.max_requests,
            trust_forwarded_for: settings.trust_forwarded_for,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `key` at `now`
    pub fn check(&self, key: &str, now: Instant) -> Result<Allowance, DoraError> {
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let key = if windows.contains_key(key) || self.make_room(&mut windows, now) {
            key
        } else {
            OVERFLOW_KEY
        };

        let entry = windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        let reset_after = self.window.saturating_sub(now.duration_since(entry.started));
        if entry.count >= self.max_requests {
            return Err(DoraError::RateLimited {
                retry_after_secs: reset_after.as_secs().max(1),
            });
        }
        entry.count += 1;

        Ok(Allowance {
            limit: self.max_requests,
            remaining: self.max_requests - entry.count,
            reset_after,
        })
    }

    /// Drop expired windows once the table is full; true if a new client fits
    fn make_room(&self, windows: &mut HashMap<String, Window>, now: Instant) -> bool {
        if windows.len() < MAX_TRACKED_CLIENTS {
            return true;
        }
        let span = self.window;
        windows.retain(|_, w| now.duration_since(w.started) < span);
        windows.len() < MAX_TRACKED_CLIENTS
    }

    /// Key a request by its peer address, or by the first forwarded hop when the
    /// service sits behind a trusted proxy
    pub fn client_key(&self, request: &Request) -> String {
        let forwarded = if self.trust_forwarded_for {
            forwarded_for(request.headers())
        } else {
            None
        };
        forwarded
            .or_else(|| {
                request
                    .extensions()
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// First `X-Forwarded-For` hop when it looks like an address
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = raw.split(',').next()?.trim();
    if first.is_empty() || first.len() > 64 {
        return None;
    }
    first
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b':' || b == b'-')
        .then(|| first.to_string())
}

/// Middleware rejecting clients over quota with 429 and `Retry-After`
pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = limiter.client_key(&request);
    match limiter.check(&key, Instant::now()) {
        Ok(allowance) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("ratelimit-limit", HeaderValue::from(allowance.limit));
            headers.insert("ratelimit-remaining", HeaderValue::from(allowance.remaining));
            headers.insert(
                "ratelimit-reset",
                HeaderValue::from(allowance.reset_after.as_secs()),
            );
            response
        }
        Err(err) => {
            tracing::warn!(client = %key, "rate limit exceeded");
            ApiError::from(err).into_response()
        }
    }
}
