//! Per-endpoint rate limiting: probe-and-consume counters keyed by
//! endpoint id.
//!
//! The limiter is the only point of coordination between delivery
//! workers, so implementations must be atomic per key. Production
//! deployments back [`RateLimiter`] with a shared counter store;
//! [`InMemoryRateLimiter`] covers tests and single-process embedding
//! with fixed windows.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum RateLimitError {
    #[error("rate limit store error: {0}")]
    Store(String),
}

/// Outcome of a probe or a consume against one key's window.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    /// Configured budget for the window.
    pub limit: u32,
    pub allowed: bool,
    /// Tokens left in the current window.
    pub remaining: u32,
    /// Time until the window resets.
    pub reset_after: Duration,
}

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Non-consuming probe: report the window state without taking a
    /// token.
    async fn should_allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError>;

    /// Consume one token when capacity remains.
    async fn allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError>;
}

#[derive(Debug)]
struct Window {
    started: Instant,
    count: u32,
}

impl Window {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    /// Roll over to a fresh window once the current one has elapsed.
    fn refresh(&mut self, window: Duration) {
        if self.started.elapsed() >= window {
            self.started = Instant::now();
            self.count = 0;
        }
    }

    fn snapshot(&self, limit: u32, window: Duration) -> RateLimitResult {
        RateLimitResult {
            limit,
            allowed: self.count < limit,
            remaining: limit.saturating_sub(self.count),
            reset_after: window.saturating_sub(self.started.elapsed()),
        }
    }
}

/// Fixed-window counters behind a single lock, atomic per process.
#[derive(Debug, Default)]
pub struct InMemoryRateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn should_allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError> {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_insert_with(Window::new);
        entry.refresh(window);
        Ok(entry.snapshot(limit, window))
    }

    async fn allow(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
    ) -> Result<RateLimitResult, RateLimitError> {
        let mut windows = self.windows.lock().await;
        let entry = windows.entry(key.to_string()).or_insert_with(Window::new);
        entry.refresh(window);

        if entry.count < limit {
            entry.count += 1;
        }
        Ok(entry.snapshot(limit, window))
    }
}
