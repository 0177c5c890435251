//! Training client — strictly sequenced writes on one training run.
//!
//! Every write on a run carries a `seq_id` that the server requires to be
//! strictly increasing and contiguous from 0. One mailbox worker per run
//! owns the counter; concurrent callers queue behind it. This is the one
//! place in the crate where serialization is required and intentional — a
//! writer is never shared across runs, so tenants cannot head-of-line block
//! each other.

use crate::ctx::ClientCtx;
use crate::error::{Result, TinkerError};
use crate::future::{ApiFuture, PollOptions};
use crate::telemetry::Metadata;
use crate::transport::PoolKind;
use crate::types::{
    AdamParams, AsyncFuture, Datum, ForwardBackwardOutput, GetInfoResponse, LoadWeightsRequest,
    LoadWeightsResponse, LossKind, OptimStepResponse, SaveWeightsForSamplerResponse,
    SaveWeightsResponse, TinkerPath,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Flush threshold for the request bin-packing heuristic: a batch closes
/// when adding the next datum would push its number count past this.
pub const MAX_CHUNK_NUMBER_COUNT: usize = 500_000;

/// A forward/backward result, possibly split across several server batches.
///
/// Awaiting merges the per-batch outputs: `loss_fn_outputs` concatenate in
/// datum order, metrics sum per key.
#[derive(Debug)]
pub struct ForwardBackwardFuture {
    chunks: Vec<ApiFuture<ForwardBackwardOutput>>,
}

impl ForwardBackwardFuture {
    /// Request ids of the underlying server futures, in batch order.
    pub fn request_ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.request_id()).collect()
    }

    /// Await every batch and merge.
    pub async fn result(&self) -> Result<ForwardBackwardOutput> {
        let outputs =
            futures::future::try_join_all(self.chunks.iter().map(|c| c.result())).await?;
        Ok(merge_outputs(outputs))
    }

    /// Await with a deadline covering all batches together.
    pub async fn result_with_timeout(&self, timeout: Duration) -> Result<ForwardBackwardOutput> {
        match tokio::time::timeout(timeout, self.result()).await {
            Ok(result) => result,
            Err(_) => Err(TinkerError::Timeout {
                elapsed: timeout,
                context: "awaiting forward/backward batches".into(),
            }),
        }
    }
}

fn merge_outputs(outputs: Vec<ForwardBackwardOutput>) -> ForwardBackwardOutput {
    let mut merged = ForwardBackwardOutput::default();
    for output in outputs {
        merged.loss_fn_outputs.extend(output.loss_fn_outputs);
        for (key, value) in output.metrics {
            *merged.metrics.entry(key).or_insert(0.0) += value;
        }
    }
    merged
}

/// Split data into server-acceptable batches by accumulated number count.
///
/// A batch flushes when the next datum would exceed the limit; a datum
/// larger than the limit by itself still travels, alone.
pub(crate) fn chunk_batches(data: Vec<Datum>, limit: usize) -> Vec<Vec<Datum>> {
    let mut batches = Vec::new();
    let mut current: Vec<Datum> = Vec::new();
    let mut current_count = 0usize;
    for datum in data {
        let count = datum.number_count();
        if !current.is_empty() && current_count + count > limit {
            batches.push(std::mem::take(&mut current));
            current_count = 0;
        }
        current_count += count;
        current.push(datum);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

enum TrainCmd {
    ForwardBackward {
        data: Vec<Datum>,
        loss: LossKind,
        backward: bool,
        reply: oneshot::Sender<Result<ForwardBackwardFuture>>,
    },
    OptimStep {
        params: AdamParams,
        reply: oneshot::Sender<Result<ApiFuture<OptimStepResponse>>>,
    },
    SaveState {
        name: String,
        reply: oneshot::Sender<Result<ApiFuture<SaveWeightsResponse>>>,
    },
    LoadState {
        path: TinkerPath,
        optimizer: bool,
        reply: oneshot::Sender<Result<ApiFuture<LoadWeightsResponse>>>,
    },
    SaveForSampler {
        reply: oneshot::Sender<Result<ApiFuture<SaveWeightsForSamplerResponse>>>,
    },
}

/// Sequenced training operations on one run.
///
/// Calls may arrive from any number of tasks; the per-run worker assigns
/// seq_ids monotonically and enqueues RPCs in mailbox order, so completion
/// order equals submission order.
#[derive(Debug)]
pub struct TrainingClient {
    ctx: Arc<ClientCtx>,
    model_id: String,
    base_model: String,
    lora_rank: Option<u32>,
    tx: mpsc::Sender<TrainCmd>,
}

impl TrainingClient {
    pub(crate) fn spawn(
        ctx: Arc<ClientCtx>,
        model_id: String,
        base_model: String,
        lora_rank: Option<u32>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let worker = TrainWorker {
            ctx: ctx.clone(),
            model_id: model_id.clone(),
            seq: 0,
        };
        tokio::spawn(worker.run(rx));
        Self {
            ctx,
            model_id,
            base_model,
            lora_rank,
            tx,
        }
    }

    /// The `{session_id}:train:{n}` model id of this run.
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Base model this run fine-tunes.
    pub fn base_model(&self) -> &str {
        &self.base_model
    }

    /// LoRA rank, when this run is a LoRA fine-tune.
    pub fn lora_rank(&self) -> Option<u32> {
        self.lora_rank
    }

    async fn send<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<T>>) -> TrainCmd,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| TinkerError::Connection("training worker stopped".into()))?;
        reply_rx
            .await
            .map_err(|_| TinkerError::Connection("training worker dropped reply".into()))?
    }

    /// Run a forward and backward pass with a built-in loss.
    pub async fn forward_backward(
        &self,
        data: Vec<Datum>,
        loss: LossKind,
    ) -> Result<ForwardBackwardFuture> {
        self.send(|reply| TrainCmd::ForwardBackward {
            data,
            loss,
            backward: true,
            reply,
        })
        .await
    }

    /// Forward pass only: evaluation, or the first leg of a custom-loss
    /// pipeline.
    pub async fn forward(&self, data: Vec<Datum>, loss: LossKind) -> Result<ForwardBackwardFuture> {
        self.send(|reply| TrainCmd::ForwardBackward {
            data,
            loss,
            backward: false,
            reply,
        })
        .await
    }

    /// Apply gradients accumulated by prior forward/backward passes in this
    /// sequence.
    pub async fn optim_step(&self, params: AdamParams) -> Result<ApiFuture<OptimStepResponse>> {
        self.send(|reply| TrainCmd::OptimStep { params, reply }).await
    }

    /// Persist a named checkpoint. The future yields its tinker URI.
    pub async fn save_state(
        &self,
        name: impl Into<String>,
    ) -> Result<ApiFuture<SaveWeightsResponse>> {
        let name = name.into();
        self.send(|reply| TrainCmd::SaveState { name, reply }).await
    }

    /// Restore weights from a checkpoint; `optimizer` additionally restores
    /// optimizer moments.
    pub async fn load_state(
        &self,
        path: TinkerPath,
        optimizer: bool,
    ) -> Result<ApiFuture<LoadWeightsResponse>> {
        self.send(|reply| TrainCmd::LoadState {
            path,
            optimizer,
            reply,
        })
        .await
    }

    /// Export current weights for a sampling client. The future yields the
    /// sampler-weights tinker URI.
    pub async fn save_weights_for_sampler(
        &self,
    ) -> Result<ApiFuture<SaveWeightsForSamplerResponse>> {
        self.send(|reply| TrainCmd::SaveForSampler { reply }).await
    }

    /// Inspect the run. Read-only: consumes no seq_id and bypasses the
    /// writer mailbox.
    pub async fn get_info(&self) -> Result<GetInfoResponse> {
        let body = json!({ "model_id": self.model_id });
        let metadata = self.metadata();
        let reply = self
            .ctx
            .executor
            .execute(&self.ctx.dest, "get_info", &metadata, || {
                self.ctx.transport.post_json(PoolKind::Training, "get_info", &body)
            })
            .await?;
        // Reads may come back direct or as a future handle.
        if let Ok(future) = serde_json::from_value::<AsyncFuture>(reply.clone()) {
            let mut poll = PollOptions::default();
            poll.metadata = metadata;
            let typed: ApiFuture<GetInfoResponse> =
                ApiFuture::new(self.ctx.clone(), future.request_id, poll);
            return typed.result().await;
        }
        Ok(serde_json::from_value(reply)?)
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("model_id".into(), json!(self.model_id));
        metadata
    }
}

struct TrainWorker {
    ctx: Arc<ClientCtx>,
    model_id: String,
    seq: u64,
}

impl TrainWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<TrainCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                TrainCmd::ForwardBackward {
                    data,
                    loss,
                    backward,
                    reply,
                } => {
                    let result = self.forward_backward(data, loss, backward).await;
                    let _ = reply.send(result);
                }
                TrainCmd::OptimStep { params, reply } => {
                    let body = json!({
                        "model_id": self.model_id,
                        "seq_id": self.next_seq(),
                        "adam_params": params,
                    });
                    let _ = reply.send(self.submit("optim_step", body).await);
                }
                TrainCmd::SaveState { name, reply } => {
                    let body = json!({
                        "model_id": self.model_id,
                        "path": name,
                        "seq_id": self.next_seq(),
                    });
                    let _ = reply.send(self.submit("save_weights", body).await);
                }
                TrainCmd::LoadState {
                    path,
                    optimizer,
                    reply,
                } => {
                    let request = LoadWeightsRequest {
                        model_id: self.model_id.clone(),
                        path: path.to_string(),
                        optimizer,
                        seq_id: self.next_seq(),
                    };
                    let result = match serde_json::to_value(&request) {
                        Ok(body) => self.submit("load_weights", body).await,
                        Err(err) => Err(err.into()),
                    };
                    let _ = reply.send(result);
                }
                TrainCmd::SaveForSampler { reply } => {
                    let body = json!({
                        "model_id": self.model_id,
                        "seq_id": self.next_seq(),
                    });
                    let _ = reply.send(self.submit("save_weights_for_sampler", body).await);
                }
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("model_id".into(), json!(self.model_id));
        metadata
    }

    async fn forward_backward(
        &mut self,
        data: Vec<Datum>,
        loss: LossKind,
        backward: bool,
    ) -> Result<ForwardBackwardFuture> {
        if data.is_empty() {
            return Err(TinkerError::Validation(
                "forward/backward requires at least one datum".into(),
            ));
        }
        let endpoint = if backward { "forward_backward" } else { "forward" };
        let mut chunks = Vec::new();
        for batch in chunk_batches(data, MAX_CHUNK_NUMBER_COUNT) {
            let body = json!({
                "model_id": self.model_id,
                "seq_id": self.next_seq(),
                "loss_fn": loss,
                "data": batch,
            });
            chunks.push(self.submit(endpoint, body).await?);
        }
        Ok(ForwardBackwardFuture { chunks })
    }

    async fn submit<T: serde::de::DeserializeOwned>(
        &self,
        endpoint: &str,
        body: Value,
    ) -> Result<ApiFuture<T>> {
        let metadata = self.metadata();
        let reply = self
            .ctx
            .executor
            .execute(&self.ctx.dest, endpoint, &metadata, || {
                self.ctx.transport.post_json(PoolKind::Training, endpoint, &body)
            })
            .await?;
        let future: AsyncFuture = serde_json::from_value(reply)?;
        let mut poll = PollOptions::default();
        poll.metadata = metadata;
        Ok(ApiFuture::new(self.ctx.clone(), future.request_id, poll))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::test_support::mock_ctx;
    use crate::retry::RetryConfig;
    use crate::tensor::TensorData;
    use crate::transport::MockTransport;
    use crate::types::{ArtifactKind, ModelInput};
    use std::collections::HashMap;

    fn train_client(mock: Arc<MockTransport>) -> TrainingClient {
        let (ctx, _rx) = mock_ctx(mock, RetryConfig::default().no_jitter());
        TrainingClient::spawn(ctx, "sess-1:train:0".into(), "llama-3-8b".into(), Some(16))
    }

    fn datum(tokens: Vec<i64>) -> Datum {
        Datum::new(ModelInput::from_tokens(tokens))
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_writes_get_contiguous_seq_ids() {
        let mock = Arc::new(MockTransport::new());
        for i in 0..100 {
            mock.push_ok(json!({"request_id": format!("R-{i}")}));
        }
        let client = Arc::new(train_client(mock.clone()));

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client
                    .forward_backward(vec![datum(vec![1, 2])], LossKind::CrossEntropy)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let mut seqs: Vec<u64> = mock
            .bodies_for("forward_backward")
            .iter()
            .map(|b| b["seq_id"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs.len(), 100);
        seqs.sort_unstable();
        // No duplicates, no gaps: exactly 0..=99.
        assert_eq!(seqs, (0..100).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submission_order_is_preserved() {
        let mock = Arc::new(MockTransport::new());
        for i in 0..10 {
            mock.push_ok(json!({"request_id": format!("R-{i}")}));
        }
        let client = train_client(mock.clone());

        for _ in 0..10 {
            client
                .forward_backward(vec![datum(vec![1])], LossKind::CrossEntropy)
                .await
                .unwrap();
        }

        let seqs: Vec<u64> = mock
            .bodies_for("forward_backward")
            .iter()
            .map(|b| b["seq_id"].as_u64().unwrap())
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_backward_body_shape() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({"request_id": "R"}));
        let client = train_client(mock.clone());

        let d = datum(vec![5, 6, 7]).with_input(
            "weights",
            TensorData::from_f32(vec![1.0, 1.0, 1.0], Some(vec![3])).unwrap(),
        );
        client
            .forward_backward(vec![d], LossKind::ImportanceSampling)
            .await
            .unwrap();

        let body = &mock.bodies_for("forward_backward")[0];
        assert_eq!(body["model_id"], "sess-1:train:0");
        assert_eq!(body["seq_id"], 0);
        assert_eq!(body["loss_fn"], "importance_sampling");
        assert_eq!(body["data"][0]["model_input"]["chunks"][0]["tokens"], json!([5, 6, 7]));
        assert_eq!(body["data"][0]["loss_fn_inputs"]["weights"]["dtype"], "float32");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mixed_operations_share_one_counter() {
        let mock = Arc::new(MockTransport::new());
        for i in 0..4 {
            mock.push_ok(json!({"request_id": format!("R-{i}")}));
        }
        let client = train_client(mock.clone());

        client
            .forward_backward(vec![datum(vec![1])], LossKind::CrossEntropy)
            .await
            .unwrap();
        client.optim_step(AdamParams::default()).await.unwrap();
        client.save_state("ckpt-1").await.unwrap();
        client
            .load_state(
                TinkerPath::new("run-1", ArtifactKind::Weights, "ckpt-1"),
                true,
            )
            .await
            .unwrap();

        assert_eq!(mock.bodies_for("forward_backward")[0]["seq_id"], 0);
        assert_eq!(mock.bodies_for("optim_step")[0]["seq_id"], 1);
        assert_eq!(mock.bodies_for("save_weights")[0]["seq_id"], 2);
        assert_eq!(mock.bodies_for("load_weights")[0]["seq_id"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_optim_step_wire_shape() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({"request_id": "R"}));
        let client = train_client(mock.clone());

        client
            .optim_step(AdamParams::default().with_learning_rate(3e-5))
            .await
            .unwrap();

        let body = &mock.bodies_for("optim_step")[0];
        assert_eq!(body["adam_params"]["learning_rate"], 3e-5);
        assert_eq!(body["adam_params"]["beta1"], 0.9);
        assert_eq!(body["adam_params"]["beta2"], 0.95);
        assert!(body["adam_params"].get("eps").is_some());
        assert!(body["adam_params"].get("epsilon").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_state_wire_shape() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({"request_id": "R"}));
        let client = train_client(mock.clone());

        client
            .load_state(
                TinkerPath::new("run-9", ArtifactKind::Weights, "ckpt-3"),
                false,
            )
            .await
            .unwrap();

        let body = &mock.bodies_for("load_weights")[0];
        assert_eq!(body["path"], "tinker://run-9/weights/ckpt-3");
        assert_eq!(body["optimizer"], false);
        assert!(body.get("load_optimizer_state").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_save_weights_for_sampler() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({"request_id": "R"}));
        mock.push_ok(json!({"status": "completed", "result": {
            "path": "tinker://run-1/sampler_weights/ckpt-5"
        }}));
        let client = train_client(mock.clone());

        let future = client.save_weights_for_sampler().await.unwrap();
        let response = future.result().await.unwrap();
        assert_eq!(response.path, "tinker://run-1/sampler_weights/ckpt-5");
        let parsed: TinkerPath = response.path.parse().unwrap();
        assert_eq!(parsed.kind, ArtifactKind::SamplerWeights);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_info_direct_reply_and_no_seq() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({
            "arch": "llama",
            "model_name": "llama-3-8b",
            "tokenizer_id": "llama-3",
            "is_lora": true,
            "lora_rank": 16,
        }));
        mock.push_ok(json!({"request_id": "R"}));
        let client = train_client(mock.clone());

        let info = client.get_info().await.unwrap();
        assert_eq!(info.model_name, "llama-3-8b");
        assert!(info.is_lora);
        assert!(mock.bodies_for("get_info")[0].get("seq_id").is_none());

        // The counter was untouched by the read.
        client
            .forward_backward(vec![datum(vec![1])], LossKind::CrossEntropy)
            .await
            .unwrap();
        assert_eq!(mock.bodies_for("forward_backward")[0]["seq_id"], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_data_rejected_without_consuming_seq() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({"request_id": "R"}));
        let client = train_client(mock.clone());

        let err = client
            .forward_backward(vec![], LossKind::CrossEntropy)
            .await
            .unwrap_err();
        assert!(matches!(err, TinkerError::Validation(_)));

        client
            .forward_backward(vec![datum(vec![1])], LossKind::CrossEntropy)
            .await
            .unwrap();
        assert_eq!(mock.bodies_for("forward_backward")[0]["seq_id"], 0);
    }

    #[test]
    fn test_chunk_batches_flush_on_limit() {
        // Three data of weight 10; limit 25 → [10+10], [10].
        let data = vec![datum(vec![1; 10]), datum(vec![2; 10]), datum(vec![3; 10])];
        let batches = chunk_batches(data, 25);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_chunk_batches_oversized_datum_travels_alone() {
        let data = vec![datum(vec![1; 100]), datum(vec![2; 5])];
        let batches = chunk_batches(data, 50);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_chunk_batches_counts_loss_inputs() {
        // 10 tokens + 40 bytes of f32 = 50; limit 60 → one per batch.
        let make = || {
            datum(vec![1; 10]).with_input(
                "advantages",
                TensorData::from_f32(vec![0.0; 10], Some(vec![10])).unwrap(),
            )
        };
        let batches = chunk_batches(vec![make(), make()], 60);
        assert_eq!(batches.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_multi_batch_outputs_merge() {
        let mock = Arc::new(MockTransport::new());
        // Two batch submissions...
        mock.push_ok(json!({"request_id": "R-0"}));
        mock.push_ok(json!({"request_id": "R-1"}));
        // ...then two polls.
        mock.push_ok(json!({"status": "completed", "result": {
            "loss_fn_outputs": [{"logprobs": {"dtype": "float32", "shape": [2], "data": [-0.5, -0.5]}}],
            "metrics": {"loss:sum": 1.0},
        }}));
        mock.push_ok(json!({"status": "completed", "result": {
            "loss_fn_outputs": [{"logprobs": {"dtype": "float32", "shape": [2], "data": [-0.25, -0.25]}}],
            "metrics": {"loss:sum": 0.5},
        }}));

        let (ctx, _rx) = mock_ctx(mock.clone(), RetryConfig::default().no_jitter());
        let mut worker = TrainWorker {
            ctx,
            model_id: "sess-1:train:0".into(),
            seq: 0,
        };
        let data: Vec<Datum> = (0..2).map(|_| datum(vec![1; 300_000])).collect();
        let future = worker
            .forward_backward(data, LossKind::CrossEntropy, true)
            .await
            .unwrap();
        assert_eq!(future.request_ids().len(), 2);

        let output = future.result().await.unwrap();
        assert_eq!(output.loss_fn_outputs.len(), 2);
        assert_eq!(output.metrics["loss:sum"], 1.5);
    }

    #[test]
    fn test_merge_outputs_sums_metrics() {
        let mut a = ForwardBackwardOutput::default();
        a.metrics.insert("loss:sum".into(), 2.0);
        a.loss_fn_outputs.push(HashMap::new());
        let mut b = ForwardBackwardOutput::default();
        b.metrics.insert("loss:sum".into(), 3.0);
        b.metrics.insert("grad_norm".into(), 1.0);
        b.loss_fn_outputs.push(HashMap::new());

        let merged = merge_outputs(vec![a, b]);
        assert_eq!(merged.metrics["loss:sum"], 5.0);
        assert_eq!(merged.metrics["grad_norm"], 1.0);
        assert_eq!(merged.loss_fn_outputs.len(), 2);
    }
}
