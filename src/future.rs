//! Future polling engine.
//!
//! Every write endpoint returns a server-side future handle; this module
//! polls `retrieve_future` until the server reports a terminal `completed`
//! or `failed` payload, translating queue states into bounded waits and
//! surfacing transport errors through the retry executor.

use crate::ctx::ClientCtx;
use crate::error::{ErrorCategory, Result, TinkerError};
use crate::telemetry::{Metadata, Severity};
use crate::transport::PoolKind;
use crate::types::{QueueState, TryAgainResponse};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// At most one periodic queue-state reminder per request within this window.
const QUEUE_STATE_REMINDER: Duration = Duration::from_secs(30);

/// Options for awaiting a server-side future.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Delay between polls when the server reports `pending` and gives no
    /// advisory delay. Default: 500 ms.
    pub default_poll_delay: Duration,
    /// Total wait budget. `None` leaves the budget to the progress timeout.
    pub max_wait: Option<Duration>,
    /// Metadata tagged onto every telemetry event emitted while polling.
    pub metadata: Metadata,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            default_poll_delay: Duration::from_millis(500),
            max_wait: None,
            metadata: Metadata::new(),
        }
    }
}

#[derive(Debug)]
enum Terminal {
    Completed(Value),
    Failed {
        message: String,
        category: ErrorCategory,
        data: Option<Value>,
    },
}

impl Terminal {
    fn to_result(&self) -> Result<Value> {
        match self {
            Terminal::Completed(value) => Ok(value.clone()),
            Terminal::Failed {
                message,
                category,
                data,
            } => Err(TinkerError::RequestFailed {
                message: message.clone(),
                category: *category,
                data: data.clone(),
            }),
        }
    }
}

/// Polls one `request_id` to completion. Terminal results are cached:
/// re-awaiting yields the cached outcome without touching the server.
#[derive(Debug)]
pub struct FuturePoller {
    ctx: Arc<ClientCtx>,
    request_id: String,
    opts: PollOptions,
    terminal: tokio::sync::Mutex<Option<Terminal>>,
}

impl FuturePoller {
    pub(crate) fn new(ctx: Arc<ClientCtx>, request_id: String, opts: PollOptions) -> Self {
        Self {
            ctx,
            request_id,
            opts,
            terminal: tokio::sync::Mutex::new(None),
        }
    }

    /// The server-side request id being polled.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Poll until terminal, returning the raw result payload.
    pub async fn await_result(&self) -> Result<Value> {
        let mut terminal = self.terminal.lock().await;
        if let Some(cached) = terminal.as_ref() {
            return cached.to_result();
        }
        let outcome = self.poll_to_terminal().await?;
        let result = outcome.to_result();
        *terminal = Some(outcome);
        result
    }

    async fn poll_to_terminal(&self) -> Result<Terminal> {
        let started = Instant::now();
        let deadline = self.opts.max_wait.map(|d| started + d);
        let body = json!({ "request_id": self.request_id });
        let mut observer = QueueStateObserver::new();

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(TinkerError::Timeout {
                        elapsed: started.elapsed(),
                        context: format!("awaiting future {}", self.request_id),
                    });
                }
            }

            let reply = self
                .ctx
                .executor
                .execute(&self.ctx.dest, "retrieve_future", &self.opts.metadata, || {
                    self.ctx
                        .transport
                        .post_json(PoolKind::Futures, "retrieve_future", &body)
                })
                .await?;

            match self.classify(&reply)? {
                Classified::Completed(result) => return Ok(Terminal::Completed(result)),
                Classified::Failed(terminal) => return Ok(terminal),
                Classified::Pending => {
                    self.bounded_sleep(self.opts.default_poll_delay, deadline).await;
                }
                Classified::TryAgain(try_again) => {
                    observer.observe(&self.ctx, &self.request_id, &try_again, &self.opts.metadata);
                    let delay = try_again
                        .retry_after_ms
                        .map(Duration::from_millis)
                        .unwrap_or(self.opts.default_poll_delay)
                        .max(self.opts.default_poll_delay)
                        .min(self.ctx.executor.config().progress_timeout);
                    self.bounded_sleep(delay, deadline).await;
                }
            }
        }
    }

    /// Discriminate one `retrieve_future` reply.
    ///
    /// A payload that matches no known envelope is a direct typed result
    /// streamed by the server; it counts as terminal success.
    fn classify(&self, reply: &Value) -> Result<Classified> {
        match reply.get("status").and_then(Value::as_str) {
            Some("completed") => {
                return Ok(Classified::Completed(
                    reply.get("result").cloned().unwrap_or(Value::Null),
                ))
            }
            Some("failed") => {
                let message = reply
                    .get("error")
                    .or_else(|| reply.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string();
                let category = reply
                    .get("category")
                    .and_then(|c| serde_json::from_value(c.clone()).ok())
                    .unwrap_or_default();
                return Ok(Classified::Failed(Terminal::Failed {
                    message,
                    category,
                    data: reply.get("data").cloned(),
                }));
            }
            Some("pending") => return Ok(Classified::Pending),
            _ => {}
        }
        if reply.get("type").and_then(Value::as_str) == Some("try_again") {
            let try_again: TryAgainResponse = serde_json::from_value(reply.clone())?;
            return Ok(Classified::TryAgain(try_again));
        }
        Ok(Classified::Completed(reply.clone()))
    }

    async fn bounded_sleep(&self, delay: Duration, deadline: Option<Instant>) {
        let delay = match deadline {
            Some(deadline) => delay.min(deadline.saturating_duration_since(Instant::now())),
            None => delay,
        };
        tokio::time::sleep(delay).await;
    }
}

enum Classified {
    Completed(Value),
    Failed(Terminal),
    Pending,
    TryAgain(TryAgainResponse),
}

/// Debounced queue-state observation: one event per state transition, plus
/// at most one reminder per [`QUEUE_STATE_REMINDER`] while the state holds.
struct QueueStateObserver {
    last_state: Option<QueueState>,
    last_emit: Instant,
}

impl QueueStateObserver {
    fn new() -> Self {
        Self {
            last_state: None,
            last_emit: Instant::now(),
        }
    }

    fn observe(
        &mut self,
        ctx: &ClientCtx,
        request_id: &str,
        try_again: &TryAgainResponse,
        metadata: &Metadata,
    ) {
        let state = try_again.queue_state;
        let transitioned = self.last_state != Some(state);
        let reminder_due = self.last_emit.elapsed() >= QUEUE_STATE_REMINDER;
        if !transitioned && !reminder_due {
            return;
        }
        self.last_state = Some(state);
        self.last_emit = Instant::now();

        tracing::info!(
            request_id,
            queue_state = ?state,
            reason = state.reason(),
            "still waiting on server-side future"
        );
        let mut payload = json!({
            "request_id": request_id,
            "queue_state": state,
            "reason": state.reason(),
            "message": try_again.message,
        });
        if let Some(obj) = payload.as_object_mut() {
            for (k, v) in metadata {
                obj.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }
        ctx.telemetry
            .generic("future.queue_state", Severity::Info, Some(payload));
    }
}

/// Typed handle on a server-side future.
///
/// Awaitable any number of times; the terminal outcome is cached after the
/// first await. `result_with_timeout` cancels only the awaiter; the server
/// operation is allowed to complete silently.
#[derive(Debug)]
pub struct ApiFuture<T> {
    poller: FuturePoller,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> ApiFuture<T> {
    pub(crate) fn new(ctx: Arc<ClientCtx>, request_id: String, opts: PollOptions) -> Self {
        Self {
            poller: FuturePoller::new(ctx, request_id, opts),
            _marker: PhantomData,
        }
    }

    /// The server-side request id.
    pub fn request_id(&self) -> &str {
        self.poller.request_id()
    }

    /// Await the typed result.
    pub async fn result(&self) -> Result<T> {
        let raw = self.poller.await_result().await?;
        Ok(serde_json::from_value(raw)?)
    }

    /// Await the raw JSON result.
    pub async fn raw_result(&self) -> Result<Value> {
        self.poller.await_result().await
    }

    /// Await with a deadline. On expiry the awaiter is cancelled and a
    /// timeout error returned; the remote operation keeps running.
    pub async fn result_with_timeout(&self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(TinkerError::Timeout {
                elapsed: timeout,
                context: format!("awaiting future {}", self.request_id()),
            }),
        }
    }
}
