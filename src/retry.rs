//! Time-bounded retries with jittered exponential backoff, a progress
//! watchdog, and per-destination admission control.
//!
//! Retries are capped by time, never by attempt count: the executor keeps
//! going until the operation succeeds, fails non-retryably, or the progress
//! timeout expires. The admission semaphore bounds how many sockets this
//! process opens toward one destination; the rate limiter reflects
//! server-side push-back. Both gate every attempt independently.

use crate::config::Destination;
use crate::error::{Result, TinkerError};
use crate::rate_limit::{RateLimiter, DEFAULT_BACKOFF};
use crate::telemetry::{Metadata, Severity, TelemetryHandle};
use serde_json::json;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

/// Retry policy knobs.
///
/// # Example
///
/// ```
/// use tinker_client::RetryConfig;
/// use std::time::Duration;
///
/// let config = RetryConfig::default();
/// assert_eq!(config.base_delay, Duration::from_millis(500));
///
/// // Delays stay within [0, max_delay] regardless of attempt.
/// let d = config.delay_for_attempt(20);
/// assert!(d <= config.max_delay);
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial backoff. Default: 500 ms.
    pub base_delay: Duration,
    /// Cap per sleep. Default: 10 s.
    pub max_delay: Duration,
    /// Symmetric jitter as a fraction of the capped delay. Default: 0.25.
    pub jitter_pct: f64,
    /// Total allowed time without forward progress. Default: 120 min.
    pub progress_timeout: Duration,
    /// Admission semaphore width per destination. Default: 100.
    pub max_connections: usize,
    /// When false, a single gated attempt with no retry loop.
    pub enable_retry_logic: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_pct: 0.25,
            progress_timeout: Duration::from_secs(7200),
            max_connections: 100,
            enable_retry_logic: true,
        }
    }
}

impl RetryConfig {
    /// Small bounded policy for best-effort traffic (telemetry flushes).
    pub fn best_effort() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            progress_timeout: Duration::from_secs(10),
            max_connections: 4,
            ..Self::default()
        }
    }

    /// Disable jitter. Deterministic delays, mostly for tests.
    pub fn no_jitter(mut self) -> Self {
        self.jitter_pct = 0.0;
        self
    }

    /// Backoff delay for attempt `n` (0-indexed).
    ///
    /// `min(base * 2^n, max)` with symmetric jitter of `±jitter_pct`,
    /// clamped to `[0, max]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw = self.base_delay.as_secs_f64() * 2f64.powi(attempt.min(63) as i32);
        let capped = raw.min(self.max_delay.as_secs_f64());
        let jitter = capped * self.jitter_pct * (2.0 * fastrand::f64() - 1.0);
        let delay = (capped + jitter).clamp(0.0, self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay)
    }
}

/// Process-wide admission semaphores keyed by `(destination, width)`.
///
/// FIFO-fair to the degree tokio's semaphore provides. Permits bound local
/// socket pressure; they are unrelated to server-side rate limiting.
#[derive(Debug)]
pub struct AdmissionControl {
    semaphores: Mutex<HashMap<(String, usize), Arc<Semaphore>>>,
}

impl AdmissionControl {
    fn new() -> Self {
        Self {
            semaphores: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide table.
    pub fn global() -> Arc<AdmissionControl> {
        static GLOBAL: OnceLock<Arc<AdmissionControl>> = OnceLock::new();
        GLOBAL
            .get_or_init(|| Arc::new(AdmissionControl::new()))
            .clone()
    }

    async fn acquire(&self, key: &str, width: usize) -> tokio::sync::OwnedSemaphorePermit {
        let sem = {
            let mut map = self.semaphores.lock().unwrap();
            map.entry((key.to_string(), width))
                .or_insert_with(|| Arc::new(Semaphore::new(width.max(1))))
                .clone()
        };
        sem.acquire_owned()
            .await
            .expect("admission semaphore is never closed")
    }
}

/// Wraps fallible operations in time-bounded retries.
///
/// One executor per client; cheap to clone. Every attempt is gated by the
/// admission semaphore (acquired once per call, released on any exit) and
/// the destination's rate-limiter window.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    limiter: Arc<RateLimiter>,
    admission: Arc<AdmissionControl>,
    telemetry: TelemetryHandle,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, limiter: Arc<RateLimiter>, telemetry: TelemetryHandle) -> Self {
        Self {
            config,
            limiter,
            admission: AdmissionControl::global(),
            telemetry,
        }
    }

    /// Use a private admission table instead of the process-wide one.
    #[cfg(test)]
    pub(crate) fn with_private_admission(mut self) -> Self {
        self.admission = Arc::new(AdmissionControl::new());
        self
    }

    /// The executor's retry policy.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `op` until success, non-retryable failure, or progress timeout.
    ///
    /// `op_name` labels telemetry events; `metadata` is passed through onto
    /// every event emitted for this call.
    pub async fn execute<T, F, Fut>(
        &self,
        dest: &Destination,
        op_name: &str,
        metadata: &Metadata,
        op: F,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let key = dest.key();
        let _permit = self
            .admission
            .acquire(&key, self.config.max_connections)
            .await;

        self.emit("retry.attempt.start", metadata, json!({ "op": op_name }));
        let last_progress = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let since_progress = last_progress.elapsed();
            if since_progress >= self.config.progress_timeout {
                let err = TinkerError::Timeout {
                    elapsed: since_progress,
                    context: format!("{op_name}: no progress within progress_timeout"),
                };
                self.emit(
                    "retry.attempt.failed",
                    metadata,
                    json!({ "op": op_name, "attempt": attempt, "error": err.to_string() }),
                );
                return Err(err);
            }

            self.limiter.wait_for_backoff(&key).await;

            match op().await {
                Ok(value) => {
                    self.limiter.clear_backoff(&key);
                    self.emit(
                        "retry.attempt.stop",
                        metadata,
                        json!({ "op": op_name, "attempt": attempt }),
                    );
                    return Ok(value);
                }
                Err(err) => {
                    if err.is_rate_limited() {
                        self.limiter
                            .set_backoff(&key, err.retry_after().unwrap_or(DEFAULT_BACKOFF));
                    }
                    if !self.config.enable_retry_logic || !err.is_retryable() {
                        self.emit(
                            "retry.attempt.failed",
                            metadata,
                            json!({ "op": op_name, "attempt": attempt, "error": err.to_string() }),
                        );
                        return Err(err);
                    }

                    // Sleeps never extend past the progress budget, so the
                    // watchdog fires promptly at the top of the next pass.
                    let remaining = self
                        .config
                        .progress_timeout
                        .saturating_sub(last_progress.elapsed());
                    let delay = self.config.delay_for_attempt(attempt).min(remaining);
                    attempt += 1;
                    tracing::debug!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient failure"
                    );
                    self.emit(
                        "retry.attempt.retry",
                        metadata,
                        json!({
                            "op": op_name,
                            "attempt": attempt,
                            "delay_ms": delay.as_millis() as u64,
                            "error": err.to_string(),
                        }),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn emit(&self, name: &str, metadata: &Metadata, mut payload: serde_json::Value) {
        if let Some(obj) = payload.as_object_mut() {
            for (k, v) in metadata {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        self.telemetry
            .generic(name, Severity::Debug, Some(payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{EventKind, TelemetryHandle};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn dest(key: &str) -> Destination {
        Destination {
            base_url: "https://example.com/svc".into(),
            api_key: key.into(),
        }
    }

    fn executor(config: RetryConfig) -> (RetryExecutor, tokio::sync::mpsc::UnboundedReceiver<crate::telemetry::TelemetryEvent>) {
        let (handle, rx) = TelemetryHandle::test_pair();
        let exec = RetryExecutor::new(config, Arc::new(RateLimiter::new()), handle)
            .with_private_admission();
        (exec, rx)
    }

    fn drain_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<crate::telemetry::TelemetryEvent>,
    ) -> Vec<crate::telemetry::TelemetryEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[test]
    fn test_delay_schedule_without_jitter() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::default()
        }
        .no_jitter();

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        // Capped from attempt 5 on.
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(40), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_bounds_with_jitter() {
        let config = RetryConfig::default();
        for attempt in 0..24 {
            for _ in 0..50 {
                let d = config.delay_for_attempt(attempt);
                assert!(d <= config.max_delay, "delay {d:?} above cap");
            }
        }
    }

    #[test]
    fn test_jitter_mean_approximates_capped_delay() {
        let config = RetryConfig::default();
        let samples = 2000;
        let mean: f64 = (0..samples)
            .map(|_| config.delay_for_attempt(1).as_secs_f64())
            .sum::<f64>()
            / samples as f64;
        // Expected 1.0s, symmetric jitter of ±0.25 → mean well within 5%.
        assert!((mean - 1.0).abs() < 0.05, "mean {mean} drifted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let (exec, mut rx) = executor(RetryConfig::default().no_jitter());
        let attempts = AtomicU32::new(0);

        let result = exec
            .execute(&dest("k"), "op", &Metadata::new(), || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(TinkerError::Connection("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);

        let events = drain_events(&mut rx);
        let retries = events
            .iter()
            .filter(|e| e.name.as_deref() == Some("retry.attempt.retry"))
            .count();
        assert_eq!(retries, 3);
        assert!(events
            .iter()
            .any(|e| e.name.as_deref() == Some("retry.attempt.stop")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_timeout_fires() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            progress_timeout: Duration::from_secs(5),
            ..RetryConfig::default()
        }
        .no_jitter();
        let (exec, mut rx) = executor(config);

        let start = Instant::now();
        let err = exec
            .execute(&dest("k"), "op", &Metadata::new(), || async {
                Err::<(), _>(TinkerError::Connection("down".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TinkerError::Timeout { .. }));
        // The budget is honored with at most one capped sleep of slack.
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(8));

        let events = drain_events(&mut rx);
        let retries = events
            .iter()
            .filter(|e| e.name.as_deref() == Some("retry.attempt.retry"))
            .count();
        assert!(retries >= 1);
        let failed = events
            .iter()
            .filter(|e| e.name.as_deref() == Some("retry.attempt.failed"))
            .count();
        assert_eq!(failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_passes_through() {
        let (exec, mut rx) = executor(RetryConfig::default());
        let attempts = AtomicU32::new(0);

        let err = exec
            .execute(&dest("k"), "op", &Metadata::new(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(TinkerError::ApiStatus {
                        status: 400,
                        body: "bad".into(),
                        retry_after: None,
                    })
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, TinkerError::ApiStatus { status: 400, .. }));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| e.name.as_deref() == Some("retry.attempt.failed")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_disabled_single_attempt() {
        let config = RetryConfig {
            enable_retry_logic: false,
            ..RetryConfig::default()
        };
        let (exec, _rx) = executor(config);
        let attempts = AtomicU32::new(0);

        let result = exec
            .execute(&dest("k"), "op", &Metadata::new(), || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(TinkerError::Connection("down".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_primes_and_success_clears_limiter() {
        let limiter = Arc::new(RateLimiter::new());
        let (handle, _rx) = TelemetryHandle::test_pair();
        let exec = RetryExecutor::new(
            RetryConfig::default().no_jitter(),
            limiter.clone(),
            handle,
        )
        .with_private_admission();

        let d = dest("tenant-a");
        let attempts = AtomicU32::new(0);
        exec.execute(&d, "sample", &Metadata::new(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(TinkerError::ApiStatus {
                        status: 429,
                        body: "limited".into(),
                        retry_after: Some(Duration::from_millis(500)),
                    })
                } else {
                    Ok(())
                }
            }
        })
        .await
        .unwrap();

        // Cleared after the eventual success.
        assert!(limiter.remaining(&d.key()).is_none());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_serializes_when_width_is_one() {
        let config = RetryConfig {
            max_connections: 1,
            ..RetryConfig::default()
        };
        let (exec, _rx) = executor(config);
        let exec = Arc::new(exec);
        let d = dest("k");

        let start = Instant::now();
        let mut tasks = Vec::new();
        for _ in 0..2 {
            let exec = exec.clone();
            let d = d.clone();
            tasks.push(tokio::spawn(async move {
                exec.execute(&d, "op", &Metadata::new(), || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // Two 100 ms ops through a width-1 semaphore cannot overlap.
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_carry_caller_metadata() {
        let (exec, mut rx) = executor(RetryConfig::default());
        let mut metadata = Metadata::new();
        metadata.insert("request_kind".into(), json!("sample"));

        exec.execute(&dest("k"), "op", &metadata, || async { Ok(()) })
            .await
            .unwrap();

        let events = drain_events(&mut rx);
        assert!(!events.is_empty());
        for event in events {
            assert_eq!(event.kind, EventKind::GenericEvent);
            let payload = event.payload.unwrap();
            assert_eq!(payload["request_kind"], "sample");
        }
    }
}
