//! Client configuration and destination identity.
//!
//! [`ClientConfig`] carries everything a client needs to reach the service:
//! base URL, API key, timeouts, retry defaults, optional proxy and
//! access-tunnel headers, and telemetry switches. Built once, immutable,
//! shared by reference into every call.
//!
//! Resolution precedence for every knob: explicit builder value, then the
//! `TINKER_*` environment, then the built-in default.

use crate::retry::RetryConfig;
use std::env;
use std::time::Duration;

/// Default production service URL.
pub const DEFAULT_BASE_URL: &str = "https://tinker-prod.thinkingmachines.dev/services/tinker-prod";

/// Connection parameters for the service.
///
/// # Example
///
/// ```
/// use tinker_client::ClientConfig;
///
/// let config = ClientConfig::builder()
///     .api_key("tk-secret")
///     .base_url("https://staging.example.com/services/tinker")
///     .build();
/// assert_eq!(config.base_url, "https://staging.example.com/services/tinker");
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Service base URL (normalized, no trailing slash).
    pub base_url: String,
    /// API key sent in the `Authorization` header.
    pub api_key: String,
    /// Per-request HTTP timeout.
    pub request_timeout: Duration,
    /// Retry defaults applied by the retry executor.
    pub retry: RetryConfig,
    /// Session heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Consecutive heartbeat failures tolerated before the session is
    /// treated as lost.
    pub heartbeat_failure_window: Duration,
    /// Whether the telemetry reporter ships events. Default: on.
    pub telemetry_enabled: bool,
    /// Log-level directive for the host's tracing subscriber (e.g. `info`,
    /// `tinker_client=debug`). The crate only carries it; installing a
    /// subscriber is the application's business.
    pub log_level: Option<String>,
    /// Free-form tags attached to session telemetry.
    pub session_tags: Vec<String>,
    /// Feature gate names forwarded to the server at session creation.
    pub feature_gates: Vec<String>,
    /// Dump outgoing request headers at debug level. Secrets stay redacted.
    pub debug_dump_headers: bool,
    /// Optional HTTP proxy URL.
    pub proxy_url: Option<String>,
    /// Extra headers forwarded to the proxy.
    pub proxy_headers: Vec<(String, String)>,
    /// Access-tunnel client id header value, when tunneling.
    pub tunnel_client_id: Option<String>,
    /// Access-tunnel client secret. Redacted from `Debug` and dumps.
    pub tunnel_client_secret: Option<String>,
}

impl ClientConfig {
    /// Start building a config. Unset fields resolve from the environment,
    /// then from built-in defaults.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Build a config entirely from the environment and defaults.
    pub fn from_env() -> Self {
        Self::builder().build()
    }

    /// The rate-limiter / admission-control identity of this config.
    pub fn destination(&self) -> Destination {
        Destination {
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &redact(&self.api_key))
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("telemetry_enabled", &self.telemetry_enabled)
            .field("session_tags", &self.session_tags)
            .field("proxy_url", &self.proxy_url)
            .field("tunnel_client_id", &self.tunnel_client_id)
            .field(
                "tunnel_client_secret",
                &self.tunnel_client_secret.as_deref().map(redact),
            )
            .finish()
    }
}

/// Identity of one `(base_url, api_key)` pair. Backoff and admission state
/// are shared process-wide per destination so tenants do not interfere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    /// Normalized base URL.
    pub base_url: String,
    /// API key of the tenant.
    pub api_key: String,
}

impl Destination {
    /// Stable map key for limiter and admission tables.
    pub fn key(&self) -> String {
        format!("{}\u{0}{}", normalize_base_url(&self.base_url), self.api_key)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    base_url: Option<String>,
    api_key: Option<String>,
    request_timeout: Option<Duration>,
    retry: Option<RetryConfig>,
    heartbeat_interval: Option<Duration>,
    heartbeat_failure_window: Option<Duration>,
    telemetry_enabled: Option<bool>,
    log_level: Option<String>,
    session_tags: Option<Vec<String>>,
    feature_gates: Option<Vec<String>>,
    debug_dump_headers: Option<bool>,
    proxy_url: Option<String>,
    proxy_headers: Vec<(String, String)>,
    tunnel_client_id: Option<String>,
    tunnel_client_secret: Option<String>,
}

impl ClientConfigBuilder {
    /// Set the service base URL.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Set the API key.
    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the per-request HTTP timeout. Default: 60 seconds.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the retry defaults.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Set the heartbeat cadence. Default: 10 seconds.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Enable or disable telemetry shipping.
    pub fn telemetry_enabled(mut self, enabled: bool) -> Self {
        self.telemetry_enabled = Some(enabled);
        self
    }

    /// Set the log-level directive surfaced to the host application.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    /// Set session tags.
    pub fn session_tags(mut self, tags: Vec<String>) -> Self {
        self.session_tags = Some(tags);
        self
    }

    /// Set feature gates.
    pub fn feature_gates(mut self, gates: Vec<String>) -> Self {
        self.feature_gates = Some(gates);
        self
    }

    /// Dump outgoing headers at debug level.
    pub fn debug_dump_headers(mut self, enabled: bool) -> Self {
        self.debug_dump_headers = Some(enabled);
        self
    }

    /// Route requests through an HTTP proxy.
    pub fn proxy_url(mut self, url: impl Into<String>) -> Self {
        self.proxy_url = Some(url.into());
        self
    }

    /// Add a header forwarded to the proxy.
    pub fn proxy_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.proxy_headers.push((name.into(), value.into()));
        self
    }

    /// Set the access-tunnel client id and secret.
    pub fn tunnel_credentials(
        mut self,
        client_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        self.tunnel_client_id = Some(client_id.into());
        self.tunnel_client_secret = Some(secret.into());
        self
    }

    /// Resolve every field: explicit value, then `TINKER_*` env, then default.
    pub fn build(self) -> ClientConfig {
        let base_url = self
            .base_url
            .or_else(|| env_string("TINKER_BASE_URL"))
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut proxy_headers = self.proxy_headers;
        if proxy_headers.is_empty() {
            proxy_headers = env_string("TINKER_PROXY_HEADERS")
                .map(|raw| parse_header_list(&raw))
                .unwrap_or_default();
        }
        ClientConfig {
            base_url: normalize_base_url(&base_url),
            api_key: self
                .api_key
                .or_else(|| env_string("TINKER_API_KEY"))
                .unwrap_or_default(),
            request_timeout: self.request_timeout.unwrap_or(Duration::from_secs(60)),
            retry: self.retry.unwrap_or_default(),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(Duration::from_secs(10)),
            heartbeat_failure_window: self
                .heartbeat_failure_window
                .unwrap_or(Duration::from_secs(120)),
            telemetry_enabled: self
                .telemetry_enabled
                .or_else(|| env_bool("TINKER_TELEMETRY"))
                .unwrap_or(true),
            log_level: self.log_level.or_else(|| env_string("TINKER_LOG_LEVEL")),
            session_tags: self
                .session_tags
                .or_else(|| env_string("TINKER_SESSION_TAGS").map(|s| parse_list(&s)))
                .unwrap_or_default(),
            feature_gates: self
                .feature_gates
                .or_else(|| env_string("TINKER_FEATURE_GATES").map(|s| parse_list(&s)))
                .unwrap_or_default(),
            debug_dump_headers: self
                .debug_dump_headers
                .or_else(|| env_bool("TINKER_DEBUG_DUMP_HEADERS"))
                .unwrap_or(false),
            proxy_url: self.proxy_url.or_else(|| env_string("TINKER_PROXY_URL")),
            proxy_headers,
            tunnel_client_id: self
                .tunnel_client_id
                .or_else(|| env_string("TINKER_TUNNEL_CLIENT_ID")),
            tunnel_client_secret: self
                .tunnel_client_secret
                .or_else(|| env_string("TINKER_TUNNEL_CLIENT_SECRET")),
        }
    }
}

/// Strip trailing slashes so path joins never double up.
pub(crate) fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Redact a secret for logs and dumps, keeping a short recognizable prefix.
pub(crate) fn redact(secret: &str) -> String {
    if secret.len() <= 4 {
        "****".to_string()
    } else {
        format!("{}****", &secret[..4])
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_bool(name: &str) -> Option<bool> {
    env_string(name).map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "off"))
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_header_list(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let (name, value) = pair.split_once(':')?;
            Some((name.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::builder().build();
        assert_eq!(config.request_timeout, Duration::from_secs(60));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
        assert!(config.telemetry_enabled);
        assert!(!config.debug_dump_headers);
        assert_eq!(config.heartbeat_failure_window, Duration::from_secs(120));
    }

    #[test]
    fn test_normalize_base_url_strips_trailing_slash() {
        assert_eq!(
            normalize_base_url("https://example.com/services/tinker/"),
            "https://example.com/services/tinker"
        );
        assert_eq!(
            normalize_base_url("https://example.com/services/tinker"),
            "https://example.com/services/tinker"
        );
    }

    #[test]
    fn test_explicit_overrides_default() {
        let config = ClientConfig::builder()
            .base_url("https://staging.example.com/svc/")
            .api_key("tk-123")
            .telemetry_enabled(false)
            .build();
        assert_eq!(config.base_url, "https://staging.example.com/svc");
        assert_eq!(config.api_key, "tk-123");
        assert!(!config.telemetry_enabled);
    }

    #[test]
    fn test_destination_key_separates_tenants() {
        let a = Destination {
            base_url: "https://x.example.com".into(),
            api_key: "key-a".into(),
        };
        let b = Destination {
            base_url: "https://x.example.com".into(),
            api_key: "key-b".into(),
        };
        assert_ne!(a.key(), b.key());
        let a2 = Destination {
            base_url: "https://x.example.com/".into(),
            api_key: "key-a".into(),
        };
        assert_eq!(a.key(), a2.key());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = ClientConfig::builder()
            .api_key("tk-supersecret")
            .tunnel_credentials("client-1", "hunter2hunter2")
            .build();
        let dump = format!("{config:?}");
        assert!(!dump.contains("supersecret"));
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains("client-1"));
    }

    #[test]
    fn test_redact_keeps_short_prefix() {
        assert_eq!(redact("tk-supersecret"), "tk-s****");
        assert_eq!(redact("abc"), "****");
    }

    #[test]
    fn test_parse_header_list() {
        let parsed = parse_header_list("X-One: a, X-Two: b");
        assert_eq!(
            parsed,
            vec![
                ("X-One".to_string(), "a".to_string()),
                ("X-Two".to_string(), "b".to_string())
            ]
        );
    }
}
