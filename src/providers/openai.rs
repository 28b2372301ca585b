//! OpenAI Chat Completions adapter.
//!
//! This backend's completion surface is callback-shaped rather than a
//! pollable sequence, so no incremental deltas can be obtained without
//! blocking the whole turn. The adapter buffers the complete response and
//! emits it as a single `Content` event followed immediately by `Done`.
//! That is a documented capability limitation of this backend, not a bug;
//! intermediate chunks are never fabricated.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::api::{ChatMessage, TurnRequest, Usage};
use crate::error::ProviderError;

use super::schema::filter_tool_schema;
use super::{
    arguments_or_empty, ChatProvider, ProviderConfig, ProviderKind, StreamEvent, ToolCallRequest,
    TurnResponse,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OpenAiTool>,
}

#[derive(Serialize)]
struct OpenAiTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: OpenAiFunction,
}

#[derive(Serialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<CompletionToolCall>>,
}

#[derive(Deserialize)]
struct CompletionToolCall {
    #[serde(default)]
    id: Option<String>,
    function: CompletionFunctionCall,
}

#[derive(Deserialize)]
struct CompletionFunctionCall {
    name: String,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct CompletionUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn response_to_turn(decoded: CompletionResponse) -> TurnResponse {
    let usage = decoded.usage.map(|usage| Usage {
        input_tokens: usage.prompt_tokens,
        output_tokens: usage.completion_tokens,
    });
    let Some(choice) = decoded.choices.into_iter().next() else {
        return TurnResponse {
            content: String::new(),
            tool_calls: Vec::new(),
            usage,
        };
    };
    let tool_calls = choice
        .message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| ToolCallRequest {
            id: call.id,
            name: call.function.name,
            arguments: arguments_or_empty(call.function.arguments.as_deref()),
        })
        .collect();
    TurnResponse {
        content: choice.message.content.unwrap_or_default(),
        tool_calls,
        usage,
    }
}

/// Emits the buffered completion as the normalized event sequence.
fn emit_turn(turn: TurnResponse, tx: &mpsc::UnboundedSender<StreamEvent>) {
    if !turn.content.is_empty() {
        let _ = tx.send(StreamEvent::Content(turn.content.clone()));
    }
    if !turn.tool_calls.is_empty() {
        let _ = tx.send(StreamEvent::ToolCalls(turn.tool_calls));
    }
    let _ = tx.send(StreamEvent::Done {
        text: turn.content,
        usage: turn.usage,
    });
}

impl OpenAiProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn completions_url(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }

    fn build_request(&self, request: &TurnRequest) -> CompletionRequest {
        let mut messages = Vec::new();
        if let Some(system) = &request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.extend(request.messages.iter().cloned());

        CompletionRequest {
            model: self.config.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools: request
                .tools
                .iter()
                .map(|tool| OpenAiTool {
                    kind: "function",
                    function: OpenAiFunction {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: filter_tool_schema(&tool.input_schema),
                    },
                })
                .collect(),
        }
    }

    async fn fetch_completion(&self, request: &TurnRequest) -> Result<TurnResponse, ProviderError> {
        let body = self.build_request(request);
        let response = self
            .http
            .post(self.completions_url())
            .header("Content-Type", "application/json")
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{status}: {body}")));
        }

        let decoded: CompletionResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        Ok(response_to_turn(decoded))
    }
}

#[async_trait]
impl ChatProvider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn generate(&self, request: TurnRequest) -> Result<TurnResponse, ProviderError> {
        self.fetch_completion(&request).await
    }

    fn stream(&self, request: TurnRequest) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let http = self.http.clone();

        tokio::spawn(async move {
            let provider = OpenAiProvider { config, http };
            match provider.fetch_completion(&request).await {
                Ok(turn) => emit_turn(turn, &tx),
                Err(err) => {
                    let _ = tx.send(StreamEvent::Error(err.to_string()));
                }
            }
        });

        rx
    }
}
