//! Batched, best-effort client telemetry.
//!
//! Events flow through a cheap clonable [`TelemetryHandle`] into an MPSC
//! queue drained by a single reporter task. Flushes trigger on a queue
//! threshold, a periodic timer, or an explicit drain, and ship through the
//! retry executor with a small bounded policy. Delivery is best effort:
//! events are dropped, loudly, rather than ever blocking the hot path.

use crate::config::Destination;
use crate::error::TinkerError;
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::transport::{PoolKind, Transport};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Caller-supplied metadata tagged onto emitted events.
pub type Metadata = serde_json::Map<String, Value>;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// What kind of record an event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStart,
    SessionEnd,
    UnhandledException,
    GenericEvent,
}

/// One telemetry record in wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    #[serde(rename = "event")]
    pub kind: EventKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub session_id: Option<String>,
    pub timestamp_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Value>,
}

impl TelemetryEvent {
    fn new(kind: EventKind, severity: Severity) -> Self {
        Self {
            kind,
            severity,
            session_id: None,
            timestamp_ms: now_ms(),
            name: None,
            payload: None,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Body of `POST /telemetry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySendRequest {
    pub session_id: String,
    pub platform: String,
    pub sdk_version: String,
    pub events: Vec<TelemetryEvent>,
}

#[derive(Debug)]
enum ReporterCmd {
    Event(TelemetryEvent),
    Fatal(TelemetryEvent),
    Drain(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
enum HandleInner {
    Disabled,
    Reporter(mpsc::UnboundedSender<ReporterCmd>),
    #[cfg(test)]
    Capture(mpsc::UnboundedSender<TelemetryEvent>),
}

/// Cheap clonable emitter. A disabled handle drops everything.
#[derive(Debug, Clone)]
pub struct TelemetryHandle {
    inner: HandleInner,
    session_id: Option<String>,
}

impl TelemetryHandle {
    /// A handle that drops every event.
    pub fn disabled() -> Self {
        Self {
            inner: HandleInner::Disabled,
            session_id: None,
        }
    }

    /// Whether events reach a reporter.
    pub fn is_enabled(&self) -> bool {
        !matches!(self.inner, HandleInner::Disabled)
    }

    /// Emit a generic event.
    pub fn generic(&self, name: &str, severity: Severity, payload: Option<Value>) {
        let mut event = TelemetryEvent::new(EventKind::GenericEvent, severity);
        event.name = Some(name.to_string());
        event.payload = payload;
        self.send(ReporterCmd::Event, event);
    }

    /// Emit an unhandled-exception record.
    pub fn exception(&self, message: &str, detail: Option<Value>) {
        let mut event = TelemetryEvent::new(EventKind::UnhandledException, Severity::Error);
        event.payload = Some(serde_json::json!({ "message": message, "detail": detail }));
        self.send(ReporterCmd::Event, event);
    }

    /// Record a fatal error: an unhandled-exception event followed by the
    /// session_end lifecycle event (at most once per session), flushed
    /// immediately.
    pub fn log_fatal_exception(&self, err: &TinkerError) {
        let mut event = TelemetryEvent::new(EventKind::UnhandledException, Severity::Critical);
        event.payload = Some(serde_json::json!({ "message": err.to_string() }));
        self.send(ReporterCmd::Fatal, event);
    }

    fn send(&self, wrap: fn(TelemetryEvent) -> ReporterCmd, mut event: TelemetryEvent) {
        event.session_id = self.session_id.clone();
        match &self.inner {
            HandleInner::Disabled => {}
            // A send after shutdown is fine; the event is simply dropped.
            HandleInner::Reporter(tx) => {
                let _ = tx.send(wrap(event));
            }
            #[cfg(test)]
            HandleInner::Capture(tx) => {
                let _ = tx.send(event);
            }
        }
    }

    /// A handle whose events land in the returned receiver. Test-only.
    #[cfg(test)]
    pub(crate) fn test_pair() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: HandleInner::Capture(tx),
                session_id: Some("test-session".into()),
            },
            rx,
        )
    }
}

/// Reporter tuning.
#[derive(Debug, Clone)]
pub struct ReporterOptions {
    /// Queue length that forces a flush. Default: 100.
    pub flush_threshold: usize,
    /// Timer-driven flush cadence. Default: 10 s.
    pub flush_interval: Duration,
    /// Retry policy for flush POSTs.
    pub retry: RetryConfig,
    /// Tags attached to the session_start event.
    pub tags: Vec<String>,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            flush_threshold: 100,
            flush_interval: Duration::from_secs(10),
            retry: RetryConfig::best_effort(),
            tags: Vec::new(),
        }
    }
}

/// Batched event shipper with drain-on-shutdown.
pub struct TelemetryReporter {
    handle: TelemetryHandle,
    cmd_tx: Option<mpsc::UnboundedSender<ReporterCmd>>,
    task: Option<JoinHandle<()>>,
}

impl TelemetryReporter {
    /// Start the reporter task and emit `session_start`.
    pub fn start(
        transport: Arc<dyn Transport>,
        dest: Destination,
        session_id: impl Into<String>,
        limiter: Arc<RateLimiter>,
        options: ReporterOptions,
    ) -> Self {
        let session_id = session_id.into();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let handle = TelemetryHandle {
            inner: HandleInner::Reporter(cmd_tx.clone()),
            session_id: Some(session_id.clone()),
        };
        let worker = ReporterWorker {
            transport,
            dest,
            session_id,
            limiter,
            options,
        };
        let task = tokio::spawn(worker.run(cmd_rx));
        Self {
            handle,
            cmd_tx: Some(cmd_tx),
            task: Some(task),
        }
    }

    /// A reporter that drops everything. Used when telemetry is off.
    pub fn disabled() -> Self {
        Self {
            handle: TelemetryHandle::disabled(),
            cmd_tx: None,
            task: None,
        }
    }

    /// The emitter to hand out to subsystems.
    pub fn handle(&self) -> TelemetryHandle {
        self.handle.clone()
    }

    /// Block until every queued event has been flushed, or the timeout
    /// expires. Returns whether the queue drained.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let Some(tx) = &self.cmd_tx else { return true };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(ReporterCmd::Drain(ack_tx)).is_err() {
            return true;
        }
        matches!(tokio::time::timeout(timeout, ack_rx).await, Ok(Ok(())))
    }

    /// Drain, emit `session_end` (if not already sent), and release the
    /// reporter task.
    pub async fn stop(mut self) {
        if let (Some(tx), Some(task)) = (self.cmd_tx.take(), self.task.take()) {
            let (ack_tx, ack_rx) = oneshot::channel();
            if tx.send(ReporterCmd::Stop(ack_tx)).is_ok() {
                let _ = ack_rx.await;
            }
            let _ = task.await;
        }
    }
}

struct ReporterWorker {
    transport: Arc<dyn Transport>,
    dest: Destination,
    session_id: String,
    limiter: Arc<RateLimiter>,
    options: ReporterOptions,
}

impl ReporterWorker {
    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<ReporterCmd>) {
        let executor = RetryExecutor::new(
            self.options.retry.clone(),
            self.limiter.clone(),
            TelemetryHandle::disabled(),
        );
        let mut buffer: Vec<TelemetryEvent> = Vec::new();
        let mut session_end_sent = false;

        let mut start = TelemetryEvent::new(EventKind::SessionStart, Severity::Info);
        start.session_id = Some(self.session_id.clone());
        start.payload = Some(serde_json::json!({ "tags": self.options.tags }));
        buffer.push(start);

        let mut ticker = tokio::time::interval(self.options.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(ReporterCmd::Event(event)) => {
                        buffer.push(event);
                        if buffer.len() >= self.options.flush_threshold {
                            self.flush(&executor, &mut buffer).await;
                        }
                    }
                    Some(ReporterCmd::Fatal(event)) => {
                        buffer.push(event);
                        if !session_end_sent {
                            buffer.push(self.session_end());
                            session_end_sent = true;
                        }
                        self.flush(&executor, &mut buffer).await;
                    }
                    Some(ReporterCmd::Drain(ack)) => {
                        self.flush(&executor, &mut buffer).await;
                        let _ = ack.send(());
                    }
                    Some(ReporterCmd::Stop(ack)) => {
                        if !session_end_sent {
                            buffer.push(self.session_end());
                            session_end_sent = true;
                        }
                        self.flush(&executor, &mut buffer).await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        self.flush(&executor, &mut buffer).await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    if !buffer.is_empty() {
                        self.flush(&executor, &mut buffer).await;
                    }
                }
            }
        }
    }

    fn session_end(&self) -> TelemetryEvent {
        let mut event = TelemetryEvent::new(EventKind::SessionEnd, Severity::Info);
        event.session_id = Some(self.session_id.clone());
        event
    }

    async fn flush(&self, executor: &RetryExecutor, buffer: &mut Vec<TelemetryEvent>) {
        if buffer.is_empty() {
            return;
        }
        let request = TelemetrySendRequest {
            session_id: self.session_id.clone(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            sdk_version: env!("CARGO_PKG_VERSION").to_string(),
            events: std::mem::take(buffer),
        };
        let dropped = request.events.len();
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%err, "telemetry batch failed to encode; dropping");
                return;
            }
        };
        let result = executor
            .execute(&self.dest, "telemetry.flush", &Metadata::new(), || {
                self.transport
                    .post_json(PoolKind::Telemetry, "telemetry", &body)
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(%err, dropped, "telemetry flush failed; dropping batch");
        }
    }
}
