//! Abstract HTTP request primitive.
//!
//! The [`Transport`] trait is the only thing in the crate that touches the
//! network. [`HttpTransport`] speaks JSON over reqwest with one connection
//! pool per operation class, so cold telemetry traffic never head-of-line
//! blocks hot sampling traffic. [`MockTransport`] returns scripted replies
//! and records every request, allowing downstream consumers to write
//! deterministic tests against this crate.
//!
//! Transports never retry. Retry decisions belong to the
//! [`RetryExecutor`](crate::retry::RetryExecutor) so they can interleave with
//! rate-limiter updates.

use crate::config::{redact, ClientConfig};
use crate::error::{Result, TinkerError};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Operation classes, each with its own HTTP connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Session,
    Training,
    Sampling,
    Futures,
    Telemetry,
}

impl PoolKind {
    const ALL: [PoolKind; 5] = [
        PoolKind::Session,
        PoolKind::Training,
        PoolKind::Sampling,
        PoolKind::Futures,
        PoolKind::Telemetry,
    ];

    fn index(self) -> usize {
        match self {
            PoolKind::Session => 0,
            PoolKind::Training => 1,
            PoolKind::Sampling => 2,
            PoolKind::Futures => 3,
            PoolKind::Telemetry => 4,
        }
    }
}

/// HTTP request primitive. Object-safe; shared as `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST a JSON body to `{base_url}/api/v1/{path}` and decode the JSON
    /// reply.
    async fn post_json(&self, pool: PoolKind, path: &str, body: &Value) -> Result<Value>;

    /// GET `{base_url}/api/v1/{path}` and decode the JSON reply.
    async fn get_json(&self, pool: PoolKind, path: &str) -> Result<Value>;

    /// Human-readable name for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    base_url: String,
    pools: [reqwest::Client; 5],
    debug_dump_headers: bool,
}

impl HttpTransport {
    /// Build per-pool clients from the config. Zero transport-level retries.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let headers = Self::default_headers(config)?;
        let mut pools = Vec::with_capacity(PoolKind::ALL.len());
        for _ in PoolKind::ALL {
            let mut builder = reqwest::Client::builder()
                .timeout(config.request_timeout)
                .default_headers(headers.clone());
            if let Some(ref proxy_url) = config.proxy_url {
                let mut proxy = reqwest::Proxy::all(proxy_url)
                    .map_err(|e| TinkerError::Validation(format!("bad proxy url: {e}")))?;
                if !config.proxy_headers.is_empty() {
                    let mut proxy_headers = HeaderMap::new();
                    for (name, value) in &config.proxy_headers {
                        proxy_headers.insert(parse_header_name(name)?, parse_header_value(value)?);
                    }
                    proxy = proxy.headers(proxy_headers);
                }
                builder = builder.proxy(proxy);
            }
            pools.push(builder.build()?);
        }
        Ok(Self {
            base_url: config.base_url.clone(),
            pools: pools
                .try_into()
                .unwrap_or_else(|_| unreachable!("pool count is fixed")),
            debug_dump_headers: config.debug_dump_headers,
        })
    }

    fn default_headers(config: &ClientConfig) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        if !config.api_key.is_empty() {
            let mut auth = parse_header_value(&format!("Bearer {}", config.api_key))?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }
        if let (Some(id), Some(secret)) =
            (&config.tunnel_client_id, &config.tunnel_client_secret)
        {
            headers.insert("CF-Access-Client-Id", parse_header_value(id)?);
            let mut secret = parse_header_value(secret)?;
            secret.set_sensitive(true);
            headers.insert("CF-Access-Client-Secret", secret);
        }
        if config.debug_dump_headers {
            tracing::debug!(
                api_key = %redact(&config.api_key),
                tunnel_client_id = ?config.tunnel_client_id,
                "outgoing default headers configured"
            );
        }
        Ok(headers)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn decode(&self, path: &str, resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        if self.debug_dump_headers {
            tracing::debug!(path, status = status.as_u16(), headers = ?resp.headers(), "response");
        }
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            // Some handlers put the advisory delay in the body instead.
            let retry_after = retry_after.or_else(|| {
                serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|v| v.get("retry_after_ms").and_then(Value::as_u64))
                    .map(Duration::from_millis)
            });
            return Err(TinkerError::ApiStatus {
                status: status.as_u16(),
                body,
                retry_after,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(&self, pool: PoolKind, path: &str, body: &Value) -> Result<Value> {
        let url = self.url(path);
        let resp = self.pools[pool.index()].post(&url).json(body).send().await?;
        self.decode(path, resp).await
    }

    async fn get_json(&self, pool: PoolKind, path: &str) -> Result<Value> {
        let url = self.url(path);
        let resp = self.pools[pool.index()].get(&url).send().await?;
        self.decode(path, resp).await
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    name.parse()
        .map_err(|_| TinkerError::Validation(format!("bad header name: {name}")))
}

fn parse_header_value(value: &str) -> Result<HeaderValue> {
    value
        .parse()
        .map_err(|_| TinkerError::Validation("bad header value".into()))
}

/// One recorded request made through a [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub pool: PoolKind,
    pub path: String,
    pub body: Value,
}

/// A test transport that returns scripted replies in order and records every
/// request for assertions.
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<Value>>>,
    recorded: Mutex<Vec<RecordedCall>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful JSON reply.
    pub fn push_ok(&self, value: Value) {
        self.script.lock().unwrap().push_back(Ok(value));
    }

    /// Queue an HTTP status error.
    pub fn push_status(&self, status: u16, retry_after: Option<Duration>) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(TinkerError::ApiStatus {
                status,
                body: format!("mock status {status}"),
                retry_after,
            }));
    }

    /// Queue a transport-level connection failure.
    pub fn push_connection_err(&self) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(TinkerError::Connection("mock connection error".into())));
    }

    /// All requests made so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.recorded.lock().unwrap().clone()
    }

    /// All request bodies sent to a given path, in order.
    pub fn bodies_for(&self, path: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter(|c| c.path == path)
            .map(|c| c.body)
            .collect()
    }

    fn next_reply(&self) -> Result<Value> {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TinkerError::Connection("mock script exhausted".into())))
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn post_json(&self, pool: PoolKind, path: &str, body: &Value) -> Result<Value> {
        self.recorded.lock().unwrap().push(RecordedCall {
            pool,
            path: path.to_string(),
            body: body.clone(),
        });
        self.next_reply()
    }

    async fn get_json(&self, pool: PoolKind, path: &str) -> Result<Value> {
        self.recorded.lock().unwrap().push(RecordedCall {
            pool,
            path: path.to_string(),
            body: Value::Null,
        });
        self.next_reply()
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
