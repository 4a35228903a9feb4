use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::errors::{LedgerError, LedgerResult};
use crate::retry::RetryPolicy;

/// What a guard does when its own backend fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log and let the request through.
    FailOpen,
    /// Reject the request with 503.
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail_open" | "open" => Ok(FailurePolicy::FailOpen),
            "fail_closed" | "closed" => Ok(FailurePolicy::FailClosed),
            other => Err(format!(
                "expected fail_open or fail_closed, got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rate limit store contention: {0}")]
    Contention(String),

    #[error("rate limit store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_contention(&self) -> bool {
        matches!(self, StoreError::Contention(_))
    }
}

/// Outcome of one counted hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_after: Duration,
}

/// Backend holding per-key window counters.
pub trait RateLimitStore: Send + Sync {
    /// Counts a hit for `key` unless it already used `limit` hits in the
    /// window that contains `now`.
    fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> Result<WindowDecision, StoreError>;
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Keys beyond this count trigger a sweep of expired windows.
const SWEEP_THRESHOLD: usize = 10_000;

/// In-process store; counters reset when the process restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, WindowEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryStore {
    fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        now: Instant,
    ) -> Result<WindowDecision, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, entry| now.saturating_duration_since(entry.window_start) < window);
        }

        let entry = entries.entry(key.to_string()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.saturating_duration_since(entry.window_start) >= window {
            entry.count = 0;
            entry.window_start = now;
        }

        let reset_after = window.saturating_sub(now.saturating_duration_since(entry.window_start));

        if entry.count >= limit {
            return Ok(WindowDecision {
                allowed: false,
                remaining: 0,
                reset_after,
            });
        }

        entry.count += 1;
        Ok(WindowDecision {
            allowed: true,
            remaining: limit - entry.count,
            reset_after,
        })
    }
}

/// Result of a rate-limit check that lets the request continue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { limit: u32, remaining: u32 },
    /// The store failed and the policy is fail-open.
    Bypassed,
}

/// Fixed-window limiter: `limit` requests per key per window.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    limit: u32,
    window: Duration,
    failure_policy: FailurePolicy,
    retry: RetryPolicy,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        limit: u32,
        window: Duration,
        failure_policy: FailurePolicy,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            limit,
            window,
            failure_policy,
            retry,
        }
    }

    pub fn per_minute(limit: u32, failure_policy: FailurePolicy, retry: RetryPolicy) -> Self {
        Self::new(
            Arc::new(MemoryStore::new()),
            limit,
            Duration::from_secs(60),
            failure_policy,
            retry,
        )
    }

    pub async fn check(&self, key: &str) -> LedgerResult<RateDecision> {
        let outcome = self
            .retry
            .retry_async_if(
                move |_| async move {
                    self.store
                        .try_acquire(key, self.limit, self.window, Instant::now())
                },
                StoreError::is_contention,
            )
            .await;

        match outcome {
            Ok(decision) if decision.allowed => Ok(RateDecision::Allowed {
                limit: self.limit,
                remaining: decision.remaining,
            }),
            Ok(decision) => {
                tracing::info!(key = %key, limit = self.limit, "Rate limit exceeded");
                Err(LedgerError::RateLimited {
                    retry_after_secs: decision.reset_after.as_secs().max(1),
                })
            }
            Err(e) => match self.failure_policy {
                FailurePolicy::FailOpen => {
                    tracing::warn!(key = %key, error = %e, "Rate limiter failed, allowing request");
                    Ok(RateDecision::Bypassed)
                }
                FailurePolicy::FailClosed => {
                    tracing::error!(key = %key, error = %e, "Rate limiter failed, rejecting request");
                    Err(LedgerError::RateLimiterUnavailable(e.to_string()))
                }
            },
        }
    }
}

/// Identifies the caller: forwarded address, real IP, peer address.
pub fn client_key(request: &Request) -> String {
    let headers = request.headers();
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return real_ip.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "anonymous".to_string())
}

pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response, LedgerError> {
    let key = client_key(&request);
    let decision = limiter.check(&key).await?;

    let mut response = next.run(request).await;
    if let RateDecision::Allowed { limit, remaining } = decision {
        let headers = response.headers_mut();
        headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(remaining));
    }
    Ok(response)
}
