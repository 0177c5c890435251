//! Custom-loss pipeline: compute gradients locally, train remotely.
//!
//! `forward_backward_custom` runs a forward-only pass, hands the returned
//! per-datum logprobs to a caller-supplied loss function through a
//! [`TensorAdapter`], and submits `d(loss)/d(logprobs)` back to the server
//! as the gradients of the backward half. Regularizers are the caller's
//! business: compose extra terms into the loss function itself.
//!
//! Caller callbacks run outside any retry scope. A failing loss function
//! surfaces as a user-category failure and is never retried.

use crate::error::{Result, TinkerError};
use crate::tensor::{TensorAdapter, TensorData, TensorDtype};
use crate::training::TrainingClient;
use crate::types::{Datum, ForwardBackwardOutput, LossKind};
use std::cell::RefCell;
use std::collections::HashMap;

/// Scalar metrics returned by a custom loss function.
pub type LossMetrics = HashMap<String, f64>;

/// Loss-fn input key under which the locally computed gradients travel back
/// to the server.
pub const LOGPROB_GRADS_KEY: &str = "logprob_grads";

impl TrainingClient {
    /// Forward pass, local loss, gradient submission.
    ///
    /// `loss_fn` receives the original data and one local logprobs tensor
    /// per datum, and returns the scalar loss plus its own metrics. The
    /// returned output carries the forward pass's `loss_fn_outputs` and the
    /// server's backward metrics merged with the caller's.
    pub async fn forward_backward_custom<A, F>(
        &self,
        adapter: &A,
        data: Vec<Datum>,
        loss_fn: F,
    ) -> Result<ForwardBackwardOutput>
    where
        A: TensorAdapter,
        F: Fn(&[Datum], &[A::Tensor]) -> anyhow::Result<(f64, LossMetrics)>,
    {
        let forward = self.forward(data.clone(), LossKind::Custom).await?;
        let forward_output = forward.result().await?;

        if forward_output.loss_fn_outputs.len() != data.len() {
            return Err(TinkerError::Validation(format!(
                "forward returned {} outputs for {} data",
                forward_output.loss_fn_outputs.len(),
                data.len()
            )));
        }
        let logprobs: Vec<&TensorData> = forward_output
            .loss_fn_outputs
            .iter()
            .map(|outputs| {
                outputs.get("logprobs").ok_or_else(|| {
                    TinkerError::Validation("forward output missing logprobs tensor".into())
                })
            })
            .collect::<Result<_>>()?;
        let local: Vec<A::Tensor> = logprobs
            .iter()
            .map(|td| adapter.from_wire(td))
            .collect::<Result<_>>()?;

        // The adapter may evaluate the closure more than once (tape replay,
        // finite differences); the caller's metrics come from the first,
        // unperturbed evaluation.
        let captured: RefCell<Option<LossMetrics>> = RefCell::new(None);
        let (loss, grads) = adapter.loss_and_grad(&local, &|inputs| {
            let (loss, metrics) = loss_fn(&data, inputs)?;
            captured.borrow_mut().get_or_insert(metrics);
            Ok(loss)
        })?;
        let caller_metrics = captured.into_inner().unwrap_or_default();
        tracing::debug!(loss, data = data.len(), "custom loss computed locally");

        if grads.len() != data.len() {
            return Err(TinkerError::Validation(format!(
                "adapter returned {} gradients for {} data",
                grads.len(),
                data.len()
            )));
        }
        for (grad, lp) in grads.iter().zip(&logprobs) {
            if grad.dtype != TensorDtype::Float32 {
                return Err(TinkerError::Validation(
                    "gradient tensors must be float32".into(),
                ));
            }
            if grad.shape != lp.shape {
                return Err(TinkerError::Validation(format!(
                    "gradient shape {:?} does not match logprobs shape {:?}",
                    grad.shape, lp.shape
                )));
            }
        }

        let backward_data: Vec<Datum> = data
            .into_iter()
            .zip(grads)
            .map(|(datum, grad)| datum.with_input(LOGPROB_GRADS_KEY, grad))
            .collect();
        let backward = self
            .forward_backward(backward_data, LossKind::Custom)
            .await?;
        let backward_output = backward.result().await?;

        let mut metrics = backward_output.metrics;
        for (key, value) in forward_output.metrics {
            metrics.entry(key).or_insert(value);
        }
        metrics.extend(caller_metrics);

        Ok(ForwardBackwardOutput {
            loss_fn_outputs: forward_output.loss_fn_outputs,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::test_support::mock_ctx;
    use crate::error::ErrorCategory;
    use crate::retry::RetryConfig;
    use crate::transport::MockTransport;
    use crate::types::ModelInput;
    use serde_json::json;
    use std::sync::Arc;

    /// Central finite differences over `Vec<f64>`. Exact for linear losses
    /// like negative mean, which is all these tests need.
    struct FiniteDiffAdapter;

    impl TensorAdapter for FiniteDiffAdapter {
        type Tensor = Vec<f64>;

        fn from_wire(&self, data: &TensorData) -> crate::error::Result<Vec<f64>> {
            Ok(data.as_f32()?.iter().map(|&x| x as f64).collect())
        }

        fn to_wire(&self, tensor: &Vec<f64>) -> crate::error::Result<TensorData> {
            TensorData::from_f64_lossy(tensor.clone(), Some(vec![tensor.len() as u64]))
        }

        fn loss_and_grad(
            &self,
            inputs: &[Vec<f64>],
            loss_fn: &dyn Fn(&[Vec<f64>]) -> anyhow::Result<f64>,
        ) -> crate::error::Result<(f64, Vec<TensorData>)> {
            let base = loss_fn(inputs)?;
            let eps = 1e-5;
            let mut grads = Vec::with_capacity(inputs.len());
            for i in 0..inputs.len() {
                let mut grad = Vec::with_capacity(inputs[i].len());
                for j in 0..inputs[i].len() {
                    let mut plus = inputs.to_vec();
                    plus[i][j] += eps;
                    let mut minus = inputs.to_vec();
                    minus[i][j] -= eps;
                    grad.push(((loss_fn(&plus)? - loss_fn(&minus)?) / (2.0 * eps)) as f32);
                }
                let len = grad.len() as u64;
                grads.push(TensorData::from_f32(grad, Some(vec![len]))?);
            }
            Ok((base, grads))
        }
    }

    fn mock_with_forward(logprobs: Vec<f32>) -> Arc<MockTransport> {
        let mock = Arc::new(MockTransport::new());
        let n = logprobs.len();
        mock.push_ok(json!({"request_id": "F"}));
        mock.push_ok(json!({"status": "completed", "result": {
            "loss_fn_outputs": [{"logprobs": {"dtype": "float32", "shape": [n], "data": logprobs}}],
            "metrics": {},
        }}));
        mock
    }

    fn train_client(mock: Arc<MockTransport>) -> TrainingClient {
        let (ctx, _rx) = mock_ctx(mock, RetryConfig::default().no_jitter());
        TrainingClient::spawn(ctx, "sess-1:train:0".into(), "llama-3-8b".into(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_loss_round_trip() {
        let mock = mock_with_forward(vec![-0.5; 10]);
        mock.push_ok(json!({"request_id": "B"}));
        mock.push_ok(json!({"status": "completed", "result": {
            "loss_fn_outputs": [],
            "metrics": {"loss:sum": 5.0},
        }}));
        let client = train_client(mock.clone());

        let data = vec![Datum::new(ModelInput::from_tokens(vec![1; 10]))];
        let output = client
            .forward_backward_custom(&FiniteDiffAdapter, data, |_data, lps| {
                let lp = &lps[0];
                let mean = lp.iter().sum::<f64>() / lp.len() as f64;
                let mut metrics = LossMetrics::new();
                metrics.insert("ppx".into(), (-mean).exp());
                Ok((-mean, metrics))
            })
            .await
            .unwrap();

        // One forward, then one backward submission.
        assert_eq!(mock.bodies_for("forward").len(), 1);
        let backward = mock.bodies_for("forward_backward");
        assert_eq!(backward.len(), 1);

        // The gradient travels as a float32 tensor shaped like the logprobs.
        let grad = &backward[0]["data"][0]["loss_fn_inputs"]["logprob_grads"];
        assert_eq!(grad["dtype"], "float32");
        assert_eq!(grad["shape"], json!([10]));
        for value in grad["data"].as_array().unwrap() {
            // d(-mean)/d(lp_i) = -1/10
            assert!((value.as_f64().unwrap() + 0.1).abs() < 1e-3);
        }

        // Metrics merge the caller's with the server's.
        assert!((output.metrics["ppx"] - 0.5f64.exp()).abs() < 1e-6);
        assert_eq!(output.metrics["loss:sum"], 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_loss_fn_is_user_error_and_skips_backward() {
        let mock = mock_with_forward(vec![-1.0; 4]);
        let client = train_client(mock.clone());

        let data = vec![Datum::new(ModelInput::from_tokens(vec![1; 4]))];
        let err = client
            .forward_backward_custom(&FiniteDiffAdapter, data, |_, _| {
                anyhow::bail!("nan in loss")
            })
            .await
            .unwrap_err();

        match err {
            TinkerError::RequestFailed { category, .. } => {
                assert_eq!(category, ErrorCategory::User);
            }
            other => panic!("unexpected: {other:?}"),
        }
        // No gradient submission went out.
        assert!(mock.bodies_for("forward_backward").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_logprobs_rejected() {
        let mock = Arc::new(MockTransport::new());
        mock.push_ok(json!({"request_id": "F"}));
        mock.push_ok(json!({"status": "completed", "result": {
            "loss_fn_outputs": [{"scores": {"dtype": "float32", "shape": [2], "data": [0.0, 0.0]}}],
            "metrics": {},
        }}));
        let client = train_client(mock);

        let data = vec![Datum::new(ModelInput::from_tokens(vec![1, 2]))];
        let err = client
            .forward_backward_custom(&FiniteDiffAdapter, data, |_, _| Ok((0.0, LossMetrics::new())))
            .await
            .unwrap_err();
        assert!(matches!(err, TinkerError::Validation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_and_backward_consume_sequential_seq_ids() {
        let mock = mock_with_forward(vec![-0.5; 3]);
        mock.push_ok(json!({"request_id": "B"}));
        mock.push_ok(json!({"status": "completed", "result": {"loss_fn_outputs": [], "metrics": {}}}));
        let client = train_client(mock.clone());

        let data = vec![Datum::new(ModelInput::from_tokens(vec![1; 3]))];
        client
            .forward_backward_custom(&FiniteDiffAdapter, data, |_, lps| {
                let mean = lps[0].iter().sum::<f64>() / lps[0].len() as f64;
                Ok((-mean, LossMetrics::new()))
            })
            .await
            .unwrap();

        assert_eq!(mock.bodies_for("forward")[0]["seq_id"], 0);
        assert_eq!(mock.bodies_for("forward_backward")[0]["seq_id"], 1);
        // Both legs declare the custom loss on the wire.
        assert_eq!(mock.bodies_for("forward")[0]["loss_fn"], "custom");
        assert_eq!(mock.bodies_for("forward_backward")[0]["loss_fn"], "custom");
    }
}
