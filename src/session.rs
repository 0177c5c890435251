//! Service client and session lifecycle.
//!
//! [`ServiceClient`] owns the shared context and the telemetry reporter.
//! A [`Session`] is the server-side logical group for training runs and
//! samplers; it is kept alive by a periodic heartbeat and must be stopped
//! synchronously — when `stop` returns, no further heartbeat RPC will be
//! issued for that session.

use crate::config::ClientConfig;
use crate::ctx::ClientCtx;
use crate::error::{Result, TinkerError};
use crate::rate_limit::RateLimiter;
use crate::sampling::{SamplerModel, SamplingClient};
use crate::telemetry::{Metadata, ReporterOptions, TelemetryHandle, TelemetryReporter};
use crate::training::TrainingClient;
use crate::transport::{HttpTransport, PoolKind, Transport};
use crate::types::{GetSamplerResponse, TinkerPath, WeightsInfoResponse};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Entry point: one per process and destination, long-lived.
pub struct ServiceClient {
    ctx: Arc<ClientCtx>,
    reporter: TelemetryReporter,
}

impl ServiceClient {
    /// Connect over HTTP using the given config.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&config)?);
        Self::with_transport(config, transport)
    }

    /// Connect over an arbitrary transport (tests, instrumentation).
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let limiter = RateLimiter::global();
        let reporter = if config.telemetry_enabled {
            let sdk_session_id = format!("sdk-{}-{:016x}", std::process::id(), fastrand::u64(..));
            TelemetryReporter::start(
                transport.clone(),
                config.destination(),
                sdk_session_id,
                limiter.clone(),
                ReporterOptions {
                    tags: config.session_tags.clone(),
                    ..ReporterOptions::default()
                },
            )
        } else {
            TelemetryReporter::disabled()
        };
        let ctx = ClientCtx::new(config, transport, limiter, reporter.handle());
        Ok(Self { ctx, reporter })
    }

    /// The telemetry emitter for application-level events.
    pub fn telemetry(&self) -> TelemetryHandle {
        self.reporter.handle()
    }

    /// Create a server-side session and start its heartbeat.
    pub async fn create_session(&self) -> Result<Session> {
        let body = json!({
            "tags": self.ctx.config.session_tags,
            "feature_gates": self.ctx.config.feature_gates,
        });
        let reply = self
            .ctx
            .executor
            .execute(&self.ctx.dest, "create_session", &Metadata::new(), || {
                self.ctx
                    .transport
                    .post_json(PoolKind::Session, "create_session", &body)
            })
            .await?;
        let session_id = reply
            .get("session_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| TinkerError::Validation("create_session reply missing id".into()))?
            .to_string();
        Ok(Session::start(self.ctx.clone(), session_id))
    }

    /// Inspect a sampler by id.
    pub async fn get_sampler(&self, sampler_id: &str) -> Result<GetSamplerResponse> {
        let path = format!("samplers/{sampler_id}");
        let reply = self
            .ctx
            .executor
            .execute(&self.ctx.dest, "get_sampler", &Metadata::new(), || {
                self.ctx.transport.get_json(PoolKind::Session, &path)
            })
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Inspect stored weights by tinker path.
    pub async fn weights_info(&self, path: &TinkerPath) -> Result<WeightsInfoResponse> {
        let body = json!({ "tinker_path": path });
        let reply = self
            .ctx
            .executor
            .execute(&self.ctx.dest, "weights_info", &Metadata::new(), || {
                self.ctx
                    .transport
                    .post_json(PoolKind::Session, "weights_info", &body)
            })
            .await?;
        Ok(serde_json::from_value(reply)?)
    }

    /// Drain telemetry and release the reporter.
    pub async fn shutdown(self) {
        self.reporter.stop().await;
    }
}

/// One server-side session: a namespace for training runs and samplers,
/// kept alive by heartbeats.
pub struct Session {
    ctx: Arc<ClientCtx>,
    session_id: String,
    train_counter: AtomicU64,
    sample_counter: AtomicU64,
    lost: Arc<AtomicBool>,
    heartbeat_stop: Option<oneshot::Sender<()>>,
    heartbeat_task: Option<JoinHandle<()>>,
}

impl Session {
    fn start(ctx: Arc<ClientCtx>, session_id: String) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = Heartbeat {
            ctx: ctx.clone(),
            session_id: session_id.clone(),
            lost: lost.clone(),
            failure_window: ctx.config.heartbeat_failure_window,
        };
        let task = tokio::spawn(heartbeat.run(ctx.config.heartbeat_interval, stop_rx));
        Self {
            ctx,
            session_id,
            train_counter: AtomicU64::new(0),
            sample_counter: AtomicU64::new(0),
            lost,
            heartbeat_stop: Some(stop_tx),
            heartbeat_task: Some(task),
        }
    }

    /// The opaque server-side session id.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    fn check_alive(&self) -> Result<()> {
        if self.lost.load(Ordering::Relaxed) {
            return Err(TinkerError::Connection(format!(
                "session {} is lost: heartbeats have been failing",
                self.session_id
            )));
        }
        Ok(())
    }

    /// Open a training run in this session.
    pub fn create_training_run(
        &self,
        base_model: impl Into<String>,
        lora_rank: Option<u32>,
    ) -> Result<TrainingClient> {
        self.check_alive()?;
        let n = self.train_counter.fetch_add(1, Ordering::Relaxed);
        let model_id = format!("{}:train:{}", self.session_id, n);
        Ok(TrainingClient::spawn(
            self.ctx.clone(),
            model_id,
            base_model.into(),
            lora_rank,
        ))
    }

    /// Open a sampling client in this session.
    pub async fn create_sampler(&self, model: SamplerModel) -> Result<SamplingClient> {
        self.check_alive()?;
        let n = self.sample_counter.fetch_add(1, Ordering::Relaxed);
        let model_id = format!("{}:sample:{}", self.session_id, n);
        SamplingClient::create(self.ctx.clone(), &self.session_id, model_id, &model).await
    }

    /// Stop the session. Synchronous contract: an in-flight heartbeat is
    /// awaited and no further heartbeat is issued once this returns.
    pub async fn stop(mut self) {
        if let (Some(stop), Some(task)) = (self.heartbeat_stop.take(), self.heartbeat_task.take()) {
            let _ = stop.send(());
            let _ = task.await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // A dropped-without-stop session must not leak its heartbeat task.
        if let Some(task) = self.heartbeat_task.take() {
            task.abort();
        }
    }
}

struct Heartbeat {
    ctx: Arc<ClientCtx>,
    session_id: String,
    lost: Arc<AtomicBool>,
    failure_window: Duration,
}

impl Heartbeat {
    async fn run(self, interval: Duration, mut stop: oneshot::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();
        let mut failing_since: Option<Instant> = None;
        let mut warned = false;

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let body = json!({
                        "session_id": self.session_id,
                        "type": "session_heartbeat",
                    });
                    // Heartbeats are fire-and-observe: no retry loop, and a
                    // failure never terminates the session by itself.
                    match self
                        .ctx
                        .transport
                        .post_json(PoolKind::Session, "session_heartbeat", &body)
                        .await
                    {
                        Ok(_) => {
                            failing_since = None;
                            warned = false;
                            self.lost.store(false, Ordering::Relaxed);
                        }
                        Err(err) => {
                            let since = *failing_since.get_or_insert_with(Instant::now);
                            if since.elapsed() >= self.failure_window && !warned {
                                tracing::warn!(
                                    session_id = %self.session_id,
                                    error = %err,
                                    window_secs = self.failure_window.as_secs(),
                                    "heartbeats failing past the tolerance window; session marked lost"
                                );
                                self.lost.store(true, Ordering::Relaxed);
                                warned = true;
                            } else {
                                tracing::debug!(
                                    session_id = %self.session_id,
                                    error = %err,
                                    "heartbeat failed"
                                );
                            }
                        }
                    }
                }
            }
        }
    }
}
