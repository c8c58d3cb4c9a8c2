//! In-memory rate limiting for channel traffic.
//!
//! DESIGN
//! ======
//! Sliding-window counters backed by `HashMap<Uuid, VecDeque<Instant>>`,
//! keyed by connection id. Two limits are enforced:
//! - Presence: a burst cap per second. Clients already throttle to one
//!   update per frame interval; this only stops misbehaving senders.
//! - Broadcast events (reactions, chat): N per window.
//!
//! Windows are dropped when a connection goes away via [`RateLimiter::forget`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::config::Config;

#[derive(Clone, Copy)]
struct RateLimitConfig {
    presence_limit: usize,
    presence_window: Duration,
    broadcast_limit: usize,
    broadcast_window: Duration,
}

impl RateLimitConfig {
    fn from_config(config: &Config) -> Self {
        Self {
            presence_limit: config.presence_burst_per_sec,
            presence_window: Duration::from_secs(1),
            broadcast_limit: config.broadcast_events_per_window,
            broadcast_window: config.broadcast_window,
        }
    }
}

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("presence rate limit exceeded (max {limit} updates/{window_secs}s)")]
    Presence { limit: usize, window_secs: u64 },
    #[error("broadcast rate limit exceeded (max {limit} events/{window_secs}s)")]
    Broadcast { limit: usize, window_secs: u64 },
}

impl crate::frame::ErrorCode for RateLimitError {
    fn error_code(&self) -> &'static str {
        "E_RATE_LIMITED"
    }

    fn retryable(&self) -> bool {
        true
    }
}

// =============================================================================
// RATE LIMITER
// =============================================================================

#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Mutex<RateLimiterInner>>,
    config: RateLimitConfig,
}

#[derive(Default)]
struct RateLimiterInner {
    presence: HashMap<Uuid, VecDeque<Instant>>,
    broadcast: HashMap<Uuid, VecDeque<Instant>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self { inner: Arc::new(Mutex::new(RateLimiterInner::default())), config: RateLimitConfig::from_config(config) }
    }

    /// Record a presence update for `client_id` if it fits the burst window.
    ///
    /// # Errors
    ///
    /// Returns `Presence` when the connection exceeded its per-second cap.
    pub fn check_presence(&self, client_id: Uuid) -> Result<(), RateLimitError> {
        self.check_presence_at(client_id, Instant::now())
    }

    /// Record a broadcast event for `client_id` if it fits the window.
    ///
    /// # Errors
    ///
    /// Returns `Broadcast` when the connection exceeded its event quota.
    pub fn check_broadcast(&self, client_id: Uuid) -> Result<(), RateLimitError> {
        self.check_broadcast_at(client_id, Instant::now())
    }

    fn check_presence_at(&self, client_id: Uuid, now: Instant) -> Result<(), RateLimitError> {
        let RateLimitConfig { presence_limit, presence_window, .. } = self.config;
        let mut inner = self.lock();
        let window = inner.presence.entry(client_id).or_default();
        if record_in_window(window, now, presence_limit, presence_window) {
            Ok(())
        } else {
            Err(RateLimitError::Presence { limit: presence_limit, window_secs: presence_window.as_secs() })
        }
    }

    fn check_broadcast_at(&self, client_id: Uuid, now: Instant) -> Result<(), RateLimitError> {
        let RateLimitConfig { broadcast_limit, broadcast_window, .. } = self.config;
        let mut inner = self.lock();
        let window = inner.broadcast.entry(client_id).or_default();
        if record_in_window(window, now, broadcast_limit, broadcast_window) {
            Ok(())
        } else {
            Err(RateLimitError::Broadcast { limit: broadcast_limit, window_secs: broadcast_window.as_secs() })
        }
    }

    /// Drop all windows for a disconnected connection.
    pub fn forget(&self, client_id: Uuid) {
        let mut inner = self.lock();
        inner.presence.remove(&client_id);
        inner.broadcast.remove(&client_id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimiterInner> {
        // A poisoned limiter only holds counters; keep serving with them.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Evict expired entries, then record `now` if under `limit`.
fn record_in_window(window: &mut VecDeque<Instant>, now: Instant, limit: usize, span: Duration) -> bool {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
    if window.len() >= limit {
        return false;
    }
    window.push_back(now);
    true
}

#[cfg(test)]
#[path = "rate_limit_test.rs"]
mod tests;
