//! Streaming response adapters for the supported generative backends.
//!
//! Each backend speaks a different streaming shape; the adapters normalize
//! all of them into one tagged [`StreamEvent`] sequence delivered over an
//! unbounded channel. A stream is finite and not restartable; a new call to
//! [`ChatProvider::stream`] produces a new sequence.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::{TurnRequest, Usage};
use crate::error::ProviderError;

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod schema;
pub mod sse;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;

/// Immutable backend selection, decided at construction time. There is no
/// ambient override; concurrent sessions under different providers cannot
/// interfere with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
    Gemini,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// One tagged unit of incremental model output.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Content(String),
    ToolCalls(Vec<ToolCallRequest>),
    Done {
        text: String,
        usage: Option<Usage>,
    },
    Error(String),
    Status(String),
}

/// Complete (non-streaming) response from a backend.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub usage: Option<Usage>,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn generate(&self, request: TurnRequest) -> Result<TurnResponse, ProviderError>;

    /// Starts one model turn and returns the event sequence for it.
    fn stream(&self, request: TurnRequest) -> mpsc::UnboundedReceiver<StreamEvent>;
}

/// Backend connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub base_url: Option<String>,
}

pub fn build_provider(
    kind: ProviderKind,
    config: ProviderConfig,
    http: reqwest::Client,
) -> Arc<dyn ChatProvider> {
    match kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::new(config, http)),
        ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(config, http)),
        ProviderKind::Gemini => Arc::new(GeminiProvider::new(config, http)),
    }
}

/// Parses a raw tool-argument payload, substituting an empty object when the
/// backend produced nothing resolvable. A malformed argument string must not
/// fail the turn.
pub(crate) fn arguments_or_empty(raw: Option<&str>) -> Value {
    raw.filter(|text| !text.trim().is_empty())
        .and_then(|text| serde_json::from_str(text).ok())
        .unwrap_or_else(|| Value::Object(Default::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn provider_kind_round_trips_through_serde() {
        let kind: ProviderKind = serde_json::from_str("\"anthropic\"").expect("kind");
        assert_eq!(kind, ProviderKind::Anthropic);
        assert_eq!(
            serde_json::to_string(&ProviderKind::Gemini).expect("json"),
            "\"gemini\""
        );
    }

    #[test]
    fn unresolvable_arguments_become_empty_object() {
        assert_eq!(arguments_or_empty(None), json!({}));
        assert_eq!(arguments_or_empty(Some("")), json!({}));
        assert_eq!(arguments_or_empty(Some("not json")), json!({}));
        assert_eq!(
            arguments_or_empty(Some("{\"query\":\"jacket\"}")),
            json!({"query": "jacket"})
        );
    }
}
