//! Shared client context.
//!
//! [`ClientCtx`] carries the config, transport, rate limiter, retry executor,
//! and telemetry handle. Built once per service client and shared by every
//! session, training run, sampler, and future poller.

use crate::config::{ClientConfig, Destination};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryExecutor;
use crate::telemetry::TelemetryHandle;
use crate::transport::Transport;
use std::sync::Arc;

/// Everything a subsystem needs from the runtime environment.
pub struct ClientCtx {
    pub config: ClientConfig,
    pub dest: Destination,
    pub transport: Arc<dyn Transport>,
    pub limiter: Arc<RateLimiter>,
    pub executor: RetryExecutor,
    pub telemetry: TelemetryHandle,
}

impl ClientCtx {
    /// Assemble a context. The executor is built from the config's retry
    /// defaults and shares the given limiter and telemetry handle.
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        telemetry: TelemetryHandle,
    ) -> Arc<Self> {
        let dest = config.destination();
        let executor = RetryExecutor::new(config.retry.clone(), limiter.clone(), telemetry.clone());
        Arc::new(Self {
            config,
            dest,
            transport,
            limiter,
            executor,
            telemetry,
        })
    }
}

impl std::fmt::Debug for ClientCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCtx")
            .field("dest", &self.dest.base_url)
            .field("transport", &self.transport.name())
            .field("telemetry_enabled", &self.telemetry.is_enabled())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::retry::RetryConfig;
    use crate::telemetry::TelemetryEvent;
    use crate::transport::MockTransport;
    use tokio::sync::mpsc;

    /// A context over a [`MockTransport`] with a fresh limiter, a private
    /// admission table, captured telemetry, and deterministic (jitter-free)
    /// retries.
    pub(crate) fn mock_ctx(
        mock: Arc<MockTransport>,
        retry: RetryConfig,
    ) -> (Arc<ClientCtx>, mpsc::UnboundedReceiver<TelemetryEvent>) {
        mock_ctx_with(mock, retry, Arc::new(RateLimiter::new()), "tk-test")
    }

    /// Like [`mock_ctx`] but with a shared limiter and chosen API key, for
    /// multi-tenant scenarios.
    pub(crate) fn mock_ctx_with(
        mock: Arc<MockTransport>,
        retry: RetryConfig,
        limiter: Arc<RateLimiter>,
        api_key: &str,
    ) -> (Arc<ClientCtx>, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (telemetry, rx) = TelemetryHandle::test_pair();
        let config = ClientConfig::builder()
            .base_url("https://mock.example.com/svc")
            .api_key(api_key)
            .retry(retry.clone())
            .build();
        let dest = config.destination();
        let executor = RetryExecutor::new(retry, limiter.clone(), telemetry.clone())
            .with_private_admission();
        (
            Arc::new(ClientCtx {
                config,
                dest,
                transport: mock,
                limiter,
                executor,
                telemetry,
            }),
            rx,
        )
    }
}
