//! Sampling client — the lock-free hot path.
//!
//! After initialization, everything a sample call needs lives in an
//! immutable registry entry shared behind an `Arc`: destination, session id,
//! transport, and the sequence counter. A call is an atomic fetch-add, a
//! request build, and an RPC — no actor hop, so dozens of concurrent samples
//! on one client never serialize behind a mailbox.
//!
//! Retry decisions happen at this layer (the transport itself never
//! retries), so 429 handling can interleave with rate-limiter updates.

use crate::ctx::ClientCtx;
use crate::error::{Result, TinkerError};
use crate::future::{ApiFuture, PollOptions};
use crate::telemetry::Metadata;
use crate::transport::PoolKind;
use crate::types::{
    AsyncFuture, ComputeLogprobsResponse, ModelInput, SampleRequest, SampleResponse,
    SamplingParams, TinkerPath,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// What a sampler serves: a base model by name, or saved sampler weights.
#[derive(Debug, Clone)]
pub enum SamplerModel {
    Base(String),
    Weights(TinkerPath),
}

/// Per-call options beyond the prompt and decoding params.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Number of continuations to draw. Default: 1.
    pub num_samples: u32,
    /// Request logprobs for the first N prompt tokens. Omitted from the
    /// wire when `None`.
    pub prompt_logprobs: Option<u32>,
    /// Polling behavior for the returned future.
    pub poll: PollOptions,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            num_samples: 1,
            prompt_logprobs: None,
            poll: PollOptions::default(),
        }
    }
}

/// Immutable per-client state shared through the registry.
struct SamplerEntry {
    ctx: Arc<ClientCtx>,
    model_id: String,
    sampling_session_id: String,
    seq: AtomicU64,
}

fn registry() -> &'static RwLock<HashMap<u64, Arc<SamplerEntry>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<u64, Arc<SamplerEntry>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

fn next_client_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Non-blocking sampling against one sampling session.
pub struct SamplingClient {
    client_id: u64,
    entry: Arc<SamplerEntry>,
}

impl SamplingClient {
    /// Open a sampling session and register the client.
    pub(crate) async fn create(
        ctx: Arc<ClientCtx>,
        session_id: &str,
        model_id: String,
        model: &SamplerModel,
    ) -> Result<Self> {
        let client_id = next_client_id();
        let mut body = json!({
            "session_id": session_id,
            "sampling_client_id": client_id.to_string(),
        });
        match model {
            SamplerModel::Base(name) => body["base_model"] = json!(name),
            SamplerModel::Weights(path) => body["model_path"] = json!(path),
        }
        let reply = ctx
            .executor
            .execute(&ctx.dest, "create_sampling_session", &Metadata::new(), || {
                ctx.transport
                    .post_json(PoolKind::Session, "create_sampling_session", &body)
            })
            .await?;
        let sampling_session_id = reply
            .get("sampling_session_id")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                TinkerError::Validation("create_sampling_session reply missing id".into())
            })?
            .to_string();

        let entry = Arc::new(SamplerEntry {
            ctx,
            model_id,
            sampling_session_id,
            seq: AtomicU64::new(0),
        });
        registry()
            .write()
            .unwrap()
            .insert(client_id, entry.clone());
        Ok(Self { client_id, entry })
    }

    /// This client's registry id.
    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    /// The `{session_id}:sample:{n}` model id of this client.
    pub fn model_id(&self) -> &str {
        &self.entry.model_id
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("model_id".into(), json!(self.entry.model_id));
        metadata.insert("sampling_client_id".into(), json!(self.client_id));
        metadata
    }

    /// Enqueue a sample call. Returns a future on the server-side result.
    ///
    /// Safe to call from any number of tasks concurrently; server-visible
    /// order is fixed by the atomically drawn `seq_id`.
    pub async fn sample(
        &self,
        prompt: ModelInput,
        params: SamplingParams,
        opts: SampleOptions,
    ) -> Result<ApiFuture<SampleResponse>> {
        let entry = &self.entry;
        let seq_id = entry.seq.fetch_add(1, Ordering::Relaxed);
        let request = SampleRequest {
            sampling_session_id: entry.sampling_session_id.clone(),
            seq_id,
            prompt,
            sampling_params: params,
            num_samples: opts.num_samples,
            prompt_logprobs: opts.prompt_logprobs,
        };
        let body = serde_json::to_value(&request)?;
        let metadata = self.metadata();
        let reply = entry
            .ctx
            .executor
            .execute(&entry.ctx.dest, "asample", &metadata, || {
                entry.ctx.transport.post_json(PoolKind::Sampling, "asample", &body)
            })
            .await?;
        let future: AsyncFuture = serde_json::from_value(reply)?;
        let mut poll = opts.poll;
        poll.metadata = metadata;
        Ok(ApiFuture::new(entry.ctx.clone(), future.request_id, poll))
    }

    /// Logprobs for a prompt under the current weights. Spends no tokens.
    pub async fn compute_logprobs(
        &self,
        prompt: ModelInput,
    ) -> Result<ApiFuture<ComputeLogprobsResponse>> {
        let entry = &self.entry;
        let seq_id = entry.seq.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "sampling_session_id": entry.sampling_session_id,
            "seq_id": seq_id,
            "prompt": prompt,
        });
        let metadata = self.metadata();
        let reply = entry
            .ctx
            .executor
            .execute(&entry.ctx.dest, "compute_logprobs", &metadata, || {
                entry
                    .ctx
                    .transport
                    .post_json(PoolKind::Sampling, "compute_logprobs", &body)
            })
            .await?;
        let future: AsyncFuture = serde_json::from_value(reply)?;
        let mut poll = PollOptions::default();
        poll.metadata = metadata;
        Ok(ApiFuture::new(entry.ctx.clone(), future.request_id, poll))
    }

    /// Remove this client from the registry. Idempotent; safe after
    /// shutdown.
    pub fn unregister(&self) {
        if let Ok(mut map) = registry().write() {
            map.remove(&self.client_id);
        }
    }
}

impl Drop for SamplingClient {
    fn drop(&mut self) {
        self.unregister();
    }
}
