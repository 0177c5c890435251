//! # Tinker Client
//!
//! Client SDK for the Tinker distributed training and sampling service.
//!
//! The service exposes RPC-style endpoints for training sessions, sampling
//! sessions, optimizer steps, and weight save/load, with long-running
//! operations returning server-side futures that are polled to completion.
//! This crate is the client core: request sequencing, future polling,
//! retries with backoff, shared rate-limit state, and batched telemetry.
//!
//! ## Core Concepts
//!
//! - **[`ServiceClient`]** — process entry point; owns the shared context
//!   and the telemetry reporter.
//! - **[`Session`]** — server-side logical group, kept alive by heartbeats;
//!   namespace for training runs and samplers.
//! - **[`TrainingClient`]** — strictly sequenced forward/backward,
//!   `optim_step`, and weight save/load on one training run. One mailbox
//!   worker per run owns the sequence counter.
//! - **[`SamplingClient`]** — lock-free concurrent sampling; sequence ids
//!   come from an atomic counter, no actor hop on the hot path.
//! - **[`ApiFuture`]** — typed handle on a server-side future; awaitable
//!   with or without a timeout, terminal results cached.
//! - **[`RetryExecutor`]** — time-bounded retries with jittered exponential
//!   backoff, a progress watchdog, and per-destination admission control.
//! - **[`TelemetryReporter`]** — batched event shipping with
//!   drain-on-shutdown.
//!
//! ## Quick Start
//!
//! ```no_run
//! use tinker_client::{
//!     AdamParams, ClientConfig, Datum, LossKind, ModelInput, SampleOptions, SamplerModel,
//!     SamplingParams, ServiceClient,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ServiceClient::connect(ClientConfig::from_env())?;
//!     let session = client.create_session().await?;
//!
//!     // Train: sequenced writes on one run.
//!     let run = session.create_training_run("llama-3-8b", Some(16))?;
//!     let fb = run
//!         .forward_backward(
//!             vec![Datum::new(ModelInput::from_tokens(vec![1, 2, 3]))],
//!             LossKind::CrossEntropy,
//!         )
//!         .await?;
//!     println!("metrics: {:?}", fb.result().await?.metrics);
//!     run.optim_step(AdamParams::default()).await?.result().await?;
//!
//!     // Sample: concurrent calls on the lock-free path.
//!     let sampler = session
//!         .create_sampler(SamplerModel::Base("llama-3-8b".into()))
//!         .await?;
//!     let sample = sampler
//!         .sample(
//!             ModelInput::from_tokens(vec![1, 2, 3]),
//!             SamplingParams::default(),
//!             SampleOptions::default(),
//!         )
//!         .await?;
//!     println!("{:?}", sample.result().await?.sequences);
//!
//!     session.stop().await;
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod ctx;
pub mod custom_loss;
pub mod error;
pub mod future;
pub mod rate_limit;
pub mod retry;
pub mod sampling;
pub mod session;
pub mod telemetry;
pub mod tensor;
pub mod training;
pub mod transport;
pub mod types;

pub use config::{ClientConfig, ClientConfigBuilder, Destination};
pub use custom_loss::{LossMetrics, LOGPROB_GRADS_KEY};
pub use error::{ErrorCategory, Result, TinkerError};
pub use future::{ApiFuture, FuturePoller, PollOptions};
pub use rate_limit::RateLimiter;
pub use retry::{RetryConfig, RetryExecutor};
pub use sampling::{SampleOptions, SamplerModel, SamplingClient};
pub use session::{ServiceClient, Session};
pub use telemetry::{
    ReporterOptions, Severity, TelemetryEvent, TelemetryHandle, TelemetryReporter,
};
pub use tensor::{TensorAdapter, TensorData, TensorDtype};
pub use training::{ForwardBackwardFuture, TrainingClient, MAX_CHUNK_NUMBER_COUNT};
pub use transport::{HttpTransport, MockTransport, PoolKind, Transport};
pub use types::{
    AdamParams, ArtifactKind, AsyncFuture, Checkpoint, Chunk, ComputeLogprobsResponse, Datum,
    ForwardBackwardOutput, GetInfoResponse, GetSamplerResponse, ImageFormat, LoadWeightsRequest,
    LoadWeightsResponse, LossKind, ModelInput, OptimStepResponse, QueueState, SampleRequest,
    SampleResponse, SampledSequence, SamplingParams, SaveWeightsForSamplerResponse,
    SaveWeightsResponse, StopReason, TinkerPath, TrainingRun, TryAgainResponse,
    WeightsInfoResponse,
};
