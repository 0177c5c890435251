//! Shared wire types: prompts, training data, request/response bodies,
//! artifact paths, and the async-future envelope.
//!
//! Wire shapes are dictated by the server. Field names here are the
//! authoritative wire names (`eps`, not `epsilon`; `optimizer`, not
//! `load_optimizer_state`).

use crate::error::{Result, TinkerError};
use crate::tensor::TensorData;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Image encoding accepted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

/// One element of a prompt.
///
/// Image chunks carry only an advisory `expected_tokens`; the server computes
/// true token counts and rejects mismatches. The legacy height/width/tokens
/// fields are gone from the contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    /// Pre-tokenized text.
    EncodedText { tokens: Vec<i64> },
    /// Inline image bytes, base64-encoded.
    Image {
        data: String,
        format: ImageFormat,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected_tokens: Option<u64>,
    },
    /// Reference to an already-uploaded image.
    #[serde(rename = "image_asset_pointer")]
    ImagePointer {
        location: String,
        format: ImageFormat,
        #[serde(skip_serializing_if = "Option::is_none")]
        expected_tokens: Option<u64>,
    },
}

impl Chunk {
    /// Text chunk from token ids.
    pub fn encoded_text(tokens: Vec<i64>) -> Self {
        Chunk::EncodedText { tokens }
    }

    /// Inline image chunk from raw bytes.
    pub fn image_from_bytes(bytes: &[u8], format: ImageFormat) -> Self {
        Chunk::Image {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            format,
            expected_tokens: None,
        }
    }

    /// Attach an advisory token count to an image chunk. No-op for text.
    pub fn with_expected_tokens(mut self, tokens: u64) -> Self {
        match &mut self {
            Chunk::Image {
                expected_tokens, ..
            }
            | Chunk::ImagePointer {
                expected_tokens, ..
            } => *expected_tokens = Some(tokens),
            Chunk::EncodedText { .. } => {}
        }
        self
    }

    /// Semantic length in tokens.
    ///
    /// Defined for text always; for image chunks only when `expected_tokens`
    /// is set. Reading it otherwise is a caller error.
    pub fn length(&self) -> Result<u64> {
        match self {
            Chunk::EncodedText { tokens } => Ok(tokens.len() as u64),
            Chunk::Image {
                expected_tokens, ..
            }
            | Chunk::ImagePointer {
                expected_tokens, ..
            } => expected_tokens.ok_or_else(|| {
                TinkerError::Validation(
                    "image chunk has no expected_tokens; its length is undefined".into(),
                )
            }),
        }
    }

    /// The "number count" used by the request bin-packing heuristic:
    /// token count for text, payload byte length for images.
    pub fn number_count(&self) -> usize {
        match self {
            Chunk::EncodedText { tokens } => tokens.len(),
            Chunk::Image { data, .. } => data.len(),
            Chunk::ImagePointer { location, .. } => location.len(),
        }
    }
}

/// An ordered sequence of chunks forming a prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelInput {
    pub chunks: Vec<Chunk>,
}

impl ModelInput {
    /// Prompt made of a single text chunk.
    pub fn from_tokens(tokens: Vec<i64>) -> Self {
        Self {
            chunks: vec![Chunk::encoded_text(tokens)],
        }
    }

    /// Append a chunk (builder style).
    pub fn push(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Total semantic length across chunks. Fails if any image chunk lacks
    /// `expected_tokens`.
    pub fn length(&self) -> Result<u64> {
        self.chunks.iter().try_fold(0, |acc, c| Ok(acc + c.length()?))
    }

    /// Bin-packing weight of this prompt.
    pub fn number_count(&self) -> usize {
        self.chunks.iter().map(Chunk::number_count).sum()
    }
}

/// One training example: a prompt plus named loss-function input tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    pub model_input: ModelInput,
    #[serde(default)]
    pub loss_fn_inputs: HashMap<String, TensorData>,
}

impl Datum {
    /// A datum with no loss-fn inputs.
    pub fn new(model_input: ModelInput) -> Self {
        Self {
            model_input,
            loss_fn_inputs: HashMap::new(),
        }
    }

    /// Attach a named loss-fn input tensor (builder style).
    pub fn with_input(mut self, name: impl Into<String>, tensor: TensorData) -> Self {
        self.loss_fn_inputs.insert(name.into(), tensor);
        self
    }

    /// Bin-packing weight: prompt weight plus the byte length of every
    /// loss-fn input's flattened data.
    pub fn number_count(&self) -> usize {
        self.model_input.number_count()
            + self
                .loss_fn_inputs
                .values()
                .map(TensorData::data_byte_len)
                .sum::<usize>()
    }
}

/// Built-in server-side loss functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    CrossEntropy,
    ImportanceSampling,
    Ppo,
    Cispo,
    Dro,
    /// Gradients computed client-side and submitted as the backward half.
    /// Used by the custom-loss pipeline, not accepted from plain
    /// `forward_backward` callers.
    Custom,
}

/// Adam optimizer parameters, wire names and defaults.
///
/// The wire field is `eps` (the server rejects `epsilon`), and the defaults
/// are the service's, not a local library's.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.95,
            eps: 1e-12,
        }
    }
}

impl AdamParams {
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }
}

/// Decoding controls for a sampling call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub max_tokens: u32,
    pub temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub stop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 1.0,
            top_p: None,
            stop: Vec::new(),
            seed: None,
        }
    }
}

/// Body of `POST /asample`.
///
/// `prompt_logprobs` must be absent from the JSON when unset; the server
/// rejects an explicit null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRequest {
    pub sampling_session_id: String,
    pub seq_id: u64,
    pub prompt: ModelInput,
    pub sampling_params: SamplingParams,
    pub num_samples: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub prompt_logprobs: Option<u32>,
}

/// Why a sampled sequence stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Length,
    StopToken,
    Eos,
    #[serde(other)]
    Unknown,
}

/// One sampled continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampledSequence {
    pub tokens: Vec<i64>,
    pub logprobs: Vec<f64>,
    pub stop_reason: StopReason,
}

/// Result of a sampling call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResponse {
    pub sequences: Vec<SampledSequence>,
}

/// Result of `POST /compute_logprobs`. Does not spend tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeLogprobsResponse {
    pub logprobs: Vec<f64>,
}

/// Result of a forward or forward/backward pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ForwardBackwardOutput {
    /// Per-datum named output tensors (e.g. `logprobs`).
    #[serde(default)]
    pub loss_fn_outputs: Vec<HashMap<String, TensorData>>,
    /// Scalar metrics reported by the server (e.g. `loss:sum`).
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Result of `POST /optim_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimStepResponse {
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
}

/// Result of `POST /save_weights`: a persistent tinker URI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveWeightsResponse {
    pub path: String,
}

/// Body of `POST /load_weights`.
///
/// The wire field is `optimizer`. The deprecated caller spelling
/// `load_optimizer_state` is still accepted on input for a deprecation
/// window, but is never sent to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadWeightsRequest {
    pub model_id: String,
    pub path: String,
    #[serde(alias = "load_optimizer_state")]
    pub optimizer: bool,
    pub seq_id: u64,
}

/// Result of `POST /load_weights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LoadWeightsResponse {}

/// Result of `POST /save_weights_for_sampler`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveWeightsForSamplerResponse {
    pub path: String,
}

/// Result of `get_info` on a training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetInfoResponse {
    pub arch: String,
    pub model_name: String,
    pub tokenizer_id: String,
    pub is_lora: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lora_rank: Option<u32>,
}

/// Result of `GET /samplers/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSamplerResponse {
    pub sampler_id: String,
    pub base_model: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub model_path: Option<String>,
}

/// Result of `POST /weights_info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightsInfoResponse {
    pub base_model: String,
    pub is_lora: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lora_rank: Option<u32>,
}

/// A stored checkpoint, as reported by inspection endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint_id: String,
    pub kind: ArtifactKind,
    pub path: String,
}

/// A training run, as reported by inspection endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingRun {
    pub training_run_id: String,
    pub base_model: String,
    pub is_lora: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub lora_rank: Option<u32>,
}

/// Which artifact family a tinker path names. Classified by the middle path
/// segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Weights,
    SamplerWeights,
}

impl ArtifactKind {
    fn segment(&self) -> &'static str {
        match self {
            ArtifactKind::Weights => "weights",
            ArtifactKind::SamplerWeights => "sampler_weights",
        }
    }
}

/// A `tinker://{training_run_id}/{weights|sampler_weights}/{checkpoint_id}`
/// artifact URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TinkerPath {
    pub training_run_id: String,
    pub kind: ArtifactKind,
    pub checkpoint_id: String,
}

impl TinkerPath {
    pub fn new(
        training_run_id: impl Into<String>,
        kind: ArtifactKind,
        checkpoint_id: impl Into<String>,
    ) -> Self {
        Self {
            training_run_id: training_run_id.into(),
            kind,
            checkpoint_id: checkpoint_id.into(),
        }
    }
}

impl fmt::Display for TinkerPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tinker://{}/{}/{}",
            self.training_run_id,
            self.kind.segment(),
            self.checkpoint_id
        )
    }
}

impl FromStr for TinkerPath {
    type Err = TinkerError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("tinker://").ok_or_else(|| {
            TinkerError::Validation(format!("not a tinker path (missing scheme): {s}"))
        })?;
        let mut parts = rest.splitn(3, '/');
        let (run, kind, ckpt) = match (parts.next(), parts.next(), parts.next()) {
            (Some(r), Some(k), Some(c)) if !r.is_empty() && !c.is_empty() => (r, k, c),
            _ => {
                return Err(TinkerError::Validation(format!(
                    "malformed tinker path: {s}"
                )))
            }
        };
        let kind = match kind {
            "weights" => ArtifactKind::Weights,
            "sampler_weights" => ArtifactKind::SamplerWeights,
            other => {
                return Err(TinkerError::Validation(format!(
                    "unknown tinker artifact kind: {other}"
                )))
            }
        };
        Ok(TinkerPath::new(run, kind, ckpt))
    }
}

impl TryFrom<String> for TinkerPath {
    type Error = TinkerError;
    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<TinkerPath> for String {
    fn from(p: TinkerPath) -> String {
        p.to_string()
    }
}

/// The server's admission state for a pending future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Active,
    PausedCapacity,
    PausedRateLimit,
    #[serde(other)]
    Unknown,
}

impl QueueState {
    /// Human-readable reason for the wait, surfaced in observation events.
    pub fn reason(&self) -> &'static str {
        match self {
            QueueState::Active => "request is queued and the server is working",
            QueueState::PausedCapacity => "server paused the queue: at capacity",
            QueueState::PausedRateLimit => "server paused the queue: rate limited",
            QueueState::Unknown => "server reported an unrecognized queue state",
        }
    }
}

/// Server handle for a long-running operation, returned by every write
/// endpoint and consumed by `retrieve_future`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncFuture {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub queue_state: Option<QueueState>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after_ms: Option<u64>,
}

/// A transient `try_again` poll reply. `retry_after_ms` is advisory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TryAgainResponse {
    #[serde(default = "QueueState::unknown")]
    pub queue_state: QueueState,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl QueueState {
    fn unknown() -> Self {
        QueueState::Unknown
    }
}
