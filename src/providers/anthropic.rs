//! Anthropic Messages API adapter.
//!
//! This backend streams token deltas natively over SSE. Text deltas are
//! forwarded as `Content` events the moment they arrive; tool_use blocks
//! accumulate their `input_json_delta` fragments until the block closes.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use crate::api::{ChatMessage, TurnRequest, Usage};
use crate::error::ProviderError;

use super::schema::filter_tool_schema;
use super::sse::SseDecoder;
use super::{
    arguments_or_empty, ChatProvider, ProviderConfig, ProviderKind, StreamEvent, ToolCallRequest,
    TurnResponse,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
    stream: bool,
}

#[derive(Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: Value,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum StreamPayload {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: u64, content_block: ContentBlock },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u64, delta: BlockDelta },
    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u64 },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<DeltaUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "error")]
    ApiError { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageStart {
    #[serde(default)]
    usage: Option<StartUsage>,
}

#[derive(Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: u64,
}

#[derive(Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum BlockDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },
    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: String,
}

struct PendingToolUse {
    id: Option<String>,
    name: String,
    partial_json: String,
}

/// Accumulates one streamed message; payloads arrive one SSE data line at a
/// time and tool blocks close in model order.
#[derive(Default)]
struct StreamAggregator {
    text: String,
    usage: Usage,
    open_tools: BTreeMap<u64, PendingToolUse>,
    tool_calls: Vec<ToolCallRequest>,
}

impl StreamAggregator {
    /// Returns true once the stream is terminal (message_stop or API error).
    fn handle_payload(&mut self, payload: &str, tx: &mpsc::UnboundedSender<StreamEvent>) -> bool {
        let event = match serde_json::from_str::<StreamPayload>(payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(error = %err, "Skipping undecodable stream payload");
                return false;
            }
        };

        match event {
            StreamPayload::MessageStart { message } => {
                if let Some(usage) = message.usage {
                    self.usage.input_tokens = usage.input_tokens;
                }
                false
            }
            StreamPayload::ContentBlockStart {
                index,
                content_block,
            } => {
                if let ContentBlock::ToolUse { id, name } = content_block {
                    self.open_tools.insert(
                        index,
                        PendingToolUse {
                            id,
                            name,
                            partial_json: String::new(),
                        },
                    );
                }
                false
            }
            StreamPayload::ContentBlockDelta { index, delta } => {
                match delta {
                    BlockDelta::TextDelta { text } => {
                        self.text.push_str(&text);
                        let _ = tx.send(StreamEvent::Content(text));
                    }
                    BlockDelta::InputJsonDelta { partial_json } => {
                        if let Some(pending) = self.open_tools.get_mut(&index) {
                            pending.partial_json.push_str(&partial_json);
                        }
                    }
                    BlockDelta::Other => {}
                }
                false
            }
            StreamPayload::ContentBlockStop { index } => {
                if let Some(pending) = self.open_tools.remove(&index) {
                    self.tool_calls.push(ToolCallRequest {
                        id: pending.id,
                        name: pending.name,
                        arguments: arguments_or_empty(Some(&pending.partial_json)),
                    });
                }
                false
            }
            StreamPayload::MessageDelta { usage } => {
                if let Some(usage) = usage {
                    self.usage.output_tokens = usage.output_tokens;
                }
                false
            }
            StreamPayload::MessageStop => {
                self.finish(tx);
                true
            }
            StreamPayload::ApiError { error } => {
                let _ = tx.send(StreamEvent::Error(error.message));
                true
            }
            StreamPayload::Ping | StreamPayload::Other => false,
        }
    }

    fn finish(&mut self, tx: &mpsc::UnboundedSender<StreamEvent>) {
        // Blocks that never saw a stop still owe a tool call; flush them in
        // index order so history stays coherent.
        for (_, pending) in std::mem::take(&mut self.open_tools) {
            self.tool_calls.push(ToolCallRequest {
                id: pending.id,
                name: pending.name,
                arguments: arguments_or_empty(Some(&pending.partial_json)),
            });
        }
        if !self.tool_calls.is_empty() {
            let _ = tx.send(StreamEvent::ToolCalls(std::mem::take(&mut self.tool_calls)));
        }
        let _ = tx.send(StreamEvent::Done {
            text: std::mem::take(&mut self.text),
            usage: Some(self.usage),
        });
    }
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ResponseContent>,
    #[serde(default)]
    usage: Option<ResponseUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ResponseContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        input: Option<Value>,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ResponseUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn messages_url(&self) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1/messages")
    }

    fn build_request(&self, request: &TurnRequest, stream: bool) -> MessagesRequest {
        MessagesRequest {
            model: self.config.model.clone(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            system: request.system_prompt.clone(),
            messages: request.messages.clone(),
            tools: request
                .tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: filter_tool_schema(&tool.input_schema),
                })
                .collect(),
            stream,
        }
    }

    fn request_builder(&self, body: &MessagesRequest) -> reqwest::RequestBuilder {
        self.http
            .post(self.messages_url())
            .header("Content-Type", "application/json")
            .header("x-api-key", self.config.api_key.clone())
            .header("anthropic-version", API_VERSION)
            .json(body)
    }
}

#[async_trait]
impl ChatProvider for AnthropicProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    async fn generate(&self, request: TurnRequest) -> Result<TurnResponse, ProviderError> {
        let body = self.build_request(&request, false);
        let response = self
            .request_builder(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{status}: {body}")));
        }

        let decoded: MessagesResponse = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        let mut content = String::new();
        let mut tool_calls = Vec::new();
        for item in decoded.content {
            match item {
                ResponseContent::Text { text } => content.push_str(&text),
                ResponseContent::ToolUse { id, name, input } => tool_calls.push(ToolCallRequest {
                    id,
                    name,
                    arguments: input.unwrap_or_else(|| Value::Object(Default::default())),
                }),
                ResponseContent::Other => {}
            }
        }
        Ok(TurnResponse {
            content,
            tool_calls,
            usage: decoded.usage.map(|usage| Usage {
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
            }),
        })
    }

    fn stream(&self, request: TurnRequest) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = self.build_request(&request, true);
        let builder = self.request_builder(&body);

        tokio::spawn(async move {
            let response = match builder.send().await {
                Ok(response) => response,
                Err(err) => {
                    let _ = tx.send(StreamEvent::Error(err.to_string()));
                    return;
                }
            };

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                let _ = tx.send(StreamEvent::Error(format!("{status}: {body}")));
                return;
            }

            let mut stream = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut aggregator = StreamAggregator::default();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(StreamEvent::Error(err.to_string()));
                        return;
                    }
                };
                for payload in decoder.feed(&chunk) {
                    if aggregator.handle_payload(&payload, &tx) {
                        return;
                    }
                }
            }

            if let Some(payload) = decoder.finish() {
                if aggregator.handle_payload(&payload, &tx) {
                    return;
                }
            }

            // Stream ended without message_stop; flush what we have.
            aggregator.finish(&tx);
        });

        rx
    }
}
