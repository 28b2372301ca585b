//! JSON-RPC-over-HTTP request executor.
//!
//! One call builds the 2.0 envelope, applies a per-call timeout through a
//! cancellation signal, and retries transport-level failures with linear
//! backoff. Received HTTP error statuses and well-formed JSON-RPC error
//! objects are never retried; they classify and propagate immediately so
//! callers can special-case them (e.g. a 401 on the scoped endpoint).

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RpcCallError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(1000);

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    id: u64,
    params: Value,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

/// Per-call knobs. The cancellation token is request-scoped: firing it stops
/// the wait for this call only, not the remote execution.
#[derive(Clone)]
pub struct RpcCallOptions {
    pub timeout: Duration,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub cancel: CancellationToken,
}

impl Default for RpcCallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            cancel: CancellationToken::new(),
        }
    }
}

/// Seam for issuing one JSON-RPC call against an endpoint URL.
#[async_trait]
pub trait CallEndpoint: Send + Sync {
    async fn call(
        &self,
        url: &str,
        method: &str,
        params: Value,
        headers: &[(String, String)],
        options: &RpcCallOptions,
    ) -> Result<Value, RpcCallError>;
}

/// Retries `attempt_fn` on retryable failures with linearly increasing
/// backoff (`base * attempt_number`). Non-retryable classifications return
/// right away.
pub(crate) async fn call_with_retry<F, Fut>(
    retry_attempts: u32,
    retry_base_delay: Duration,
    cancel: &CancellationToken,
    mut attempt_fn: F,
) -> Result<Value, RpcCallError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Value, RpcCallError>>,
{
    let attempts = retry_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Err(RpcCallError::Cancelled);
        }

        match attempt_fn(attempt).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_retryable() && attempt < attempts => {
                debug!(attempt, error = %err, "Retrying RPC call after transport failure");
                let delay = retry_base_delay.saturating_mul(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => {
                        return Err(RpcCallError::Cancelled);
                    }
                }
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(RpcCallError::Transport {
        message: "no attempt executed".to_string(),
        attempts,
    }))
}

/// Production executor backed by a shared `reqwest` client. Holds no state
/// beyond the connection pool and a monotonically increasing request id.
pub struct HttpRpc {
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpRpc {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            next_id: AtomicU64::new(1),
        }
    }

    async fn execute_once(
        &self,
        url: &str,
        method: &str,
        params: Value,
        headers: &[(String, String)],
        options: &RpcCallOptions,
        attempts: u32,
    ) -> Result<Value, RpcCallError> {
        let envelope = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            params,
        };

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let request = request.json(&envelope);

        let timeout_ms = options.timeout.as_millis() as u64;
        let send = async {
            let response = request.send().await.map_err(|err| RpcCallError::Transport {
                message: err.to_string(),
                attempts,
            })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(RpcCallError::Http {
                    status: status.as_u16(),
                    body,
                });
            }

            let decoded: JsonRpcResponse =
                response.json().await.map_err(|err| RpcCallError::Transport {
                    message: format!("invalid response body: {err}"),
                    attempts,
                })?;

            if let Some(error) = decoded.error {
                return Err(RpcCallError::Rpc {
                    code: error.code,
                    message: error.message,
                    data: error.data,
                });
            }
            Ok(decoded.result.unwrap_or(Value::Null))
        };

        tokio::select! {
            result = send => result,
            _ = tokio::time::sleep(options.timeout) => {
                Err(RpcCallError::Timeout { timeout_ms })
            }
            _ = options.cancel.cancelled() => {
                Err(RpcCallError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl CallEndpoint for HttpRpc {
    async fn call(
        &self,
        url: &str,
        method: &str,
        params: Value,
        headers: &[(String, String)],
        options: &RpcCallOptions,
    ) -> Result<Value, RpcCallError> {
        let attempts = options.retry_attempts.max(1);
        call_with_retry(
            options.retry_attempts,
            options.retry_base_delay,
            &options.cancel,
            |attempt| {
                let params = params.clone();
                async move {
                    debug!(url, method, attempt, "Issuing JSON-RPC call");
                    self.execute_once(url, method, params, headers, options, attempts)
                        .await
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[test]
    fn envelope_serializes_to_jsonrpc_two() {
        let envelope = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "tools/list",
            id: 7,
            params: serde_json::json!({}),
        };
        let encoded = serde_json::to_value(&envelope).expect("envelope");
        assert_eq!(
            encoded,
            serde_json::json!({
                "jsonrpc": "2.0",
                "method": "tools/list",
                "id": 7,
                "params": {}
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_then_success_returns_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_retry(
            3,
            Duration::from_millis(1000),
            &CancellationToken::new(),
            move |_attempt| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(RpcCallError::Transport {
                            message: "connection refused".to_string(),
                            attempts: 3,
                        })
                    } else {
                        Ok(serde_json::json!({"tools": []}))
                    }
                }
            },
        )
        .await;
        assert_eq!(result.expect("result"), serde_json::json!({"tools": []}));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_surface_the_transport_error() {
        let result = call_with_retry(
            3,
            Duration::from_millis(1000),
            &CancellationToken::new(),
            |_attempt| async {
                Err(RpcCallError::Transport {
                    message: "connection refused".to_string(),
                    attempts: 3,
                })
            },
        )
        .await;
        assert!(matches!(result, Err(RpcCallError::Transport { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn http_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = call_with_retry(
            3,
            Duration::from_millis(1000),
            &CancellationToken::new(),
            move |_attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(RpcCallError::Http {
                        status: 401,
                        body: "unauthorized".to_string(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(RpcCallError::Http { status: 401, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_waiting_between_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = call_with_retry(
            3,
            Duration::from_millis(1000),
            &cancel,
            |_attempt| async {
                Ok(Value::Null)
            },
        )
        .await;
        assert!(matches!(result, Err(RpcCallError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_backoff_is_classified_as_cancelled() {
        let cancel = CancellationToken::new();
        let fire = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fire.cancel();
        });
        let result = call_with_retry(
            3,
            Duration::from_millis(1000),
            &cancel,
            |_attempt| async {
                Err(RpcCallError::Transport {
                    message: "connection refused".to_string(),
                    attempts: 3,
                })
            },
        )
        .await;
        assert!(matches!(result, Err(RpcCallError::Cancelled)));
    }
}
