//! Error taxonomy for the client.
//!
//! Every public operation returns [`Result`]. Errors carry a human-readable
//! message, a structured variant, an optional server-assigned
//! [`ErrorCategory`], and an optional machine-parseable data map.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

/// Who is responsible for a failure, as reported by the server or assigned
/// locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ErrorCategory {
    /// Caller-supplied input or callback is at fault. Never retried.
    User,
    /// The server or the network is at fault.
    Server,
    /// The server did not say. Treated as retryable.
    #[default]
    #[serde(other)]
    Unknown,
}

/// Errors produced by the client and its subsystems.
#[derive(Error, Debug)]
pub enum TinkerError {
    /// Caller-supplied input failed local checks.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The server returned a non-success HTTP status.
    ///
    /// `retry_after` is populated from the `Retry-After` header or a
    /// `retry_after_ms` body field when present.
    #[error("HTTP {status}: {body}")]
    ApiStatus {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Server-advised delay before retrying, if any.
        retry_after: Option<Duration>,
    },

    /// Transport-layer failure (connection refused, DNS, local timeout).
    #[error("connection failed: {0}")]
    Connection(String),

    /// A local deadline or the progress timeout expired.
    #[error("timed out after {}ms: {context}", elapsed.as_millis())]
    Timeout {
        /// How long the operation ran before giving up.
        elapsed: Duration,
        /// What was being waited on.
        context: String,
    },

    /// The server reported a failure envelope through `retrieve_future`, or a
    /// user callback failed locally.
    #[error("request failed ({category:?}): {message}")]
    RequestFailed {
        /// Human-readable failure description.
        message: String,
        /// Server-assigned (or locally assigned) responsibility.
        category: ErrorCategory,
        /// Structured failure details, if any.
        data: Option<Value>,
    },

    /// JSON encoding or decoding failed at the serde level.
    #[error("JSON codec failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for TinkerError {
    fn from(err: reqwest::Error) -> Self {
        TinkerError::Connection(err.to_string())
    }
}

impl From<anyhow::Error> for TinkerError {
    fn from(err: anyhow::Error) -> Self {
        // User callbacks (loss fns, tensor adapters) surface here: category
        // user, full chain preserved as structured data, never retried.
        let chain: Vec<String> = err.chain().map(|c| c.to_string()).collect();
        TinkerError::RequestFailed {
            message: err.to_string(),
            category: ErrorCategory::User,
            data: Some(serde_json::json!({ "chain": chain })),
        }
    }
}

impl TinkerError {
    /// Whether the retry executor may re-attempt an operation that failed
    /// with this error.
    ///
    /// Retryable: transport failures, and server statuses 408, 409, 429, 5xx.
    /// `request_failed` envelopes retry only when the server blamed itself
    /// (or declined to assign blame).
    pub fn is_retryable(&self) -> bool {
        match self {
            TinkerError::Connection(_) => true,
            TinkerError::ApiStatus { status, .. } => {
                matches!(status, 408 | 409 | 429) || *status >= 500
            }
            TinkerError::RequestFailed { category, .. } => {
                matches!(category, ErrorCategory::Server | ErrorCategory::Unknown)
            }
            _ => false,
        }
    }

    /// Server-advised retry delay, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TinkerError::ApiStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Whether this error is a 429 rate-limit push-back.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TinkerError::ApiStatus { status: 429, .. })
    }
}

pub type Result<T> = std::result::Result<T, TinkerError>;
