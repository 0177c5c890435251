//! Shared per-destination 429 backoff state.
//!
//! One rate-limited tenant must not cause other tenants to probe the server,
//! and concurrent callers on the same tenant must share a single backoff
//! window. Deadlines live in atomic slots keyed by destination; readers see
//! the latest deadline without locks, and a wait is exactly one sleep, never
//! a poll loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::time::Instant;

/// Default backoff applied on a 429 that carries no advisory delay.
pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Process-wide map from destination key to an absolute backoff deadline in
/// monotonic milliseconds. A deadline of 0 means "no backoff".
#[derive(Debug)]
pub struct RateLimiter {
    anchor: Instant,
    entries: Mutex<HashMap<String, Arc<AtomicU64>>>,
}

impl RateLimiter {
    /// A fresh limiter with its own clock anchor. Production code shares
    /// [`RateLimiter::global`]; tests inject instances.
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide limiter. Entries are lazily created and never torn
    /// down.
    pub fn global() -> Arc<RateLimiter> {
        static GLOBAL: OnceLock<Arc<RateLimiter>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(RateLimiter::new())).clone()
    }

    fn slot(&self, key: &str) -> Arc<AtomicU64> {
        let mut entries = self.entries.lock().unwrap();
        entries.entry(key.to_string()).or_default().clone()
    }

    fn now_ms(&self) -> u64 {
        self.anchor.elapsed().as_millis() as u64
    }

    /// Sleep for the remainder of the destination's backoff window, if any.
    /// Exactly one sleep; returns immediately when no backoff is active.
    pub async fn wait_for_backoff(&self, key: &str) {
        let deadline = self.slot(key).load(Ordering::Acquire);
        if deadline > self.now_ms() {
            tokio::time::sleep_until(self.anchor + Duration::from_millis(deadline)).await;
        }
    }

    /// Record server push-back: back off this destination for `duration`.
    /// Concurrent setters keep the farthest deadline.
    pub fn set_backoff(&self, key: &str, duration: Duration) {
        let deadline = self.now_ms() + duration.as_millis() as u64;
        self.slot(key).fetch_max(deadline, Ordering::AcqRel);
    }

    /// Clear the destination's backoff after a successful response.
    pub fn clear_backoff(&self, key: &str) {
        self.slot(key).store(0, Ordering::Release);
    }

    /// Remaining backoff for a destination, if any. Diagnostic only.
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        let deadline = self.slot(key).load(Ordering::Acquire);
        let now = self.now_ms();
        (deadline > now).then(|| Duration::from_millis(deadline - now))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
