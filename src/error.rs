//! Classified errors for the RPC transport, providers, and collaborators.
//!
//! The split matters for control flow: transport-level failures are retried,
//! HTTP and JSON-RPC errors propagate immediately so callers can special-case
//! statuses such as 401, and tool-call failures are surfaced as structured
//! results rather than errors.

use serde_json::Value;
use thiserror::Error;

/// Failure of a single JSON-RPC call after retry policy has been applied.
#[derive(Debug, Error)]
pub enum RpcCallError {
    /// Network-level failure: connection refused, DNS, broken stream.
    #[error("transport failure after {attempts} attempt(s): {message}")]
    Transport { message: String, attempts: u32 },

    /// The per-call deadline elapsed.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The caller's cancellation token fired while waiting. The remote side
    /// may still complete the request; cancellation only stops the wait.
    #[error("request cancelled while waiting")]
    Cancelled,

    /// The server answered with a non-2xx status. Never retried.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// A well-formed JSON-RPC error object. Never retried.
    #[error("JSON-RPC error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl RpcCallError {
    /// Whether the retry loop may issue another attempt for this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcCallError::Transport { .. } | RpcCallError::Timeout { .. }
        )
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RpcCallError::Http { status: 401, .. })
    }
}

/// Opaque backend failure surfaced to the orchestrator as a stream `Error`
/// event; it ends the turn.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned an error payload: {0}")]
    Api(String),

    #[error("provider response could not be decoded: {0}")]
    Decode(String),
}

/// Failure reported by the persistence collaborator.
#[derive(Debug, Error)]
#[error("conversation store failure: {0}")]
pub struct StoreError(pub String);

/// Failure reported by the authorization-link collaborator.
#[derive(Debug, Error)]
#[error("authorization link generation failed: {0}")]
pub struct AuthLinkError(pub String);

/// Top-level orchestration faults. Tool and provider failures never surface
/// here; they are converted into structured results or stream events.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("message content is required")]
    EmptyMessage,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration parsing failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Parse(String),
}
