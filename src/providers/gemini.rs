//! Google Gemini adapter.
//!
//! Gemini streams chunked `GenerateContentResponse` payloads over SSE and is
//! the one backend that occasionally fails mid-iteration. When that happens
//! the adapter falls back to the aggregate assembled from the payloads
//! already received; only when nothing was received does it emit an `Error`
//! event and terminate.

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{TurnRequest, Usage};
use crate::error::ProviderError;

use super::schema::filter_tool_schema;
use super::sse::SseDecoder;
use super::{ChatProvider, ProviderConfig, ProviderKind, StreamEvent, ToolCallRequest, TurnResponse};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    config: ProviderConfig,
    http: reqwest::Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDeclarations>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<FunctionCall>,
}

#[derive(Serialize, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolDeclarations {
    function_declarations: Vec<crate::api::FunctionDeclaration>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// Aggregate view of the chunks received so far; doubles as the fallback
/// "complete response" when iteration fails partway.
#[derive(Default)]
struct ChunkAggregator {
    text: String,
    tool_calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    received_any: bool,
}

impl ChunkAggregator {
    fn handle_payload(&mut self, payload: &str, tx: &mpsc::UnboundedSender<StreamEvent>) {
        match serde_json::from_str::<GenerateChunk>(payload) {
            Ok(chunk) => {
                for fragment in self.absorb_chunk(chunk) {
                    let _ = tx.send(StreamEvent::Content(fragment));
                }
            }
            Err(err) => {
                debug!(error = %err, "Skipping undecodable Gemini chunk");
            }
        }
    }

    /// Pure accumulation; returns the text fragments this chunk added so the
    /// streaming path can forward them. The single-shot path ignores them.
    fn absorb_chunk(&mut self, chunk: GenerateChunk) -> Vec<String> {
        self.received_any = true;

        if let Some(usage) = chunk.usage_metadata {
            self.usage = Some(Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            });
        }

        let mut fragments = Vec::new();
        for candidate in chunk.candidates {
            let Some(content) = candidate.content else {
                continue;
            };
            for part in content.parts {
                if let Some(text) = part.text {
                    if !text.is_empty() {
                        self.text.push_str(&text);
                        fragments.push(text);
                    }
                }
                if let Some(call) = part.function_call {
                    self.tool_calls.push(ToolCallRequest {
                        id: None,
                        name: call.name,
                        arguments: call
                            .args
                            .filter(|args| !args.is_null())
                            .unwrap_or_else(|| Value::Object(Default::default())),
                    });
                }
            }
        }
        fragments
    }

    fn into_response(self) -> TurnResponse {
        TurnResponse {
            content: self.text,
            tool_calls: self.tool_calls,
            usage: self.usage,
        }
    }

    fn finish(&mut self, tx: &mpsc::UnboundedSender<StreamEvent>) {
        if !self.tool_calls.is_empty() {
            let _ = tx.send(StreamEvent::ToolCalls(std::mem::take(&mut self.tool_calls)));
        }
        let _ = tx.send(StreamEvent::Done {
            text: std::mem::take(&mut self.text),
            usage: self.usage,
        });
    }

    /// Mid-iteration failure path: the aggregate stands in for the complete
    /// response when any payload made it through.
    fn fail(&mut self, message: String, tx: &mpsc::UnboundedSender<StreamEvent>) {
        if self.received_any {
            warn!(error = %message, "Gemini stream failed mid-iteration; using aggregate response");
            self.finish(tx);
        } else {
            let _ = tx.send(StreamEvent::Error(message));
        }
    }
}

impl GeminiProvider {
    pub fn new(config: ProviderConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    fn url(&self, operation: &str) -> String {
        let base = self
            .config
            .base_url
            .as_deref()
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/');
        format!("{base}/v1beta/models/{}:{operation}", self.config.model)
    }

    fn build_request(&self, request: &TurnRequest) -> GenerateRequest {
        let contents = request
            .messages
            .iter()
            .map(|message| Content {
                role: Some(if message.role == "assistant" {
                    "model".to_string()
                } else {
                    "user".to_string()
                }),
                parts: vec![Part {
                    text: Some(message.content.clone()),
                    function_call: None,
                }],
            })
            .collect();

        let declarations: Vec<_> = request
            .tools
            .iter()
            .map(|tool| tool.to_function_declaration(filter_tool_schema))
            .collect();

        GenerateRequest {
            contents,
            system_instruction: request.system_prompt.as_ref().map(|text| Content {
                role: None,
                parts: vec![Part {
                    text: Some(text.clone()),
                    function_call: None,
                }],
            }),
            tools: if declarations.is_empty() {
                Vec::new()
            } else {
                vec![ToolDeclarations {
                    function_declarations: declarations,
                }]
            },
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens,
                temperature: request.temperature,
            },
        }
    }

    fn request_builder(&self, operation: &str, body: &GenerateRequest) -> reqwest::RequestBuilder {
        self.http
            .post(self.url(operation))
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", self.config.api_key.clone())
            .json(body)
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    async fn generate(&self, request: TurnRequest) -> Result<TurnResponse, ProviderError> {
        let body = self.build_request(&request);
        let response = self
            .request_builder("generateContent", &body)
            .send()
            .await
            .map_err(|err| ProviderError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api(format!("{status}: {body}")));
        }

        let chunk: GenerateChunk = response
            .json()
            .await
            .map_err(|err| ProviderError::Decode(err.to_string()))?;

        // The single-shot response has the same shape as one stream chunk.
        let mut aggregator = ChunkAggregator::default();
        aggregator.absorb_chunk(chunk);
        Ok(aggregator.into_response())
    }

    fn stream(&self, request: TurnRequest) -> mpsc::UnboundedReceiver<StreamEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let body = self.build_request(&request);
        let builder = self.request_builder("streamGenerateContent?alt=sse", &body);

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
            let mut aggregator = ChunkAggregator::default();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        aggregator.fail(err.to_string(), &tx);
                        return;
                    }
                };
                for payload in decoder.feed(&chunk) {
                    aggregator.handle_payload(&payload, &tx);
                }
            }

            if let Some(payload) = decoder.finish() {
                aggregator.handle_payload(&payload, &tx);
            }

            aggregator.finish(&tx);
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn drain(rx: &mut mpsc::UnboundedReceiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn streams_text_parts_and_finishes_with_done() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = ChunkAggregator::default();

        aggregator.handle_payload(
            r#"{"candidates":[{"content":{"parts":[{"text":"Red "}],"role":"model"}}]}"#,
            &tx,
        );
        aggregator.handle_payload(
            r#"{"candidates":[{"content":{"parts":[{"text":"jackets"}],"role":"model"}}],"usageMetadata":{"promptTokenCount":8,"candidatesTokenCount":2}}"#,
            &tx,
        );
        aggregator.finish(&tx);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], StreamEvent::Content(text) if text == "Red "));
        assert!(matches!(&events[1], StreamEvent::Content(text) if text == "jackets"));
        match &events[2] {
            StreamEvent::Done { text, usage } => {
                assert_eq!(text, "Red jackets");
                assert_eq!(
                    *usage,
                    Some(Usage {
                        input_tokens: 8,
                        output_tokens: 2
                    })
                );
            }
            other => panic!("expected done, got {other:?}"),
        }
    }

    #[test]
    fn mid_iteration_failure_falls_back_to_aggregate() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = ChunkAggregator::default();

        aggregator.handle_payload(
            r#"{"candidates":[{"content":{"parts":[{"text":"Partial answer"}]}}]}"#,
            &tx,
        );
        aggregator.fail("connection reset".to_string(), &tx);

        let events = drain(&mut rx);
        assert!(matches!(&events[0], StreamEvent::Content(_)));
        assert!(matches!(&events[1], StreamEvent::Done { text, .. } if text == "Partial answer"));
    }

    #[test]
    fn failure_with_nothing_received_emits_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = ChunkAggregator::default();

        aggregator.fail("connection reset".to_string(), &tx);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], StreamEvent::Error(message) if message == "connection reset"));
    }

    #[test]
    fn single_shot_chunk_converts_without_a_channel() {
        let chunk: GenerateChunk = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[
                {"text":"One jacket found."},
                {"functionCall":{"name":"search_shop_catalog","args":{"query":"jacket"}}}
            ],"role":"model"}}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":4}}"#,
        )
        .expect("chunk");

        let mut aggregator = ChunkAggregator::default();
        let fragments = aggregator.absorb_chunk(chunk);
        assert_eq!(fragments, vec!["One jacket found."]);

        let response = aggregator.into_response();
        assert_eq!(response.content, "One jacket found.");
        assert_eq!(response.tool_calls[0].name, "search_shop_catalog");
        assert_eq!(response.tool_calls[0].arguments, json!({"query": "jacket"}));
        assert_eq!(
            response.usage,
            Some(Usage {
                input_tokens: 5,
                output_tokens: 4
            })
        );
    }

    #[test]
    fn function_calls_without_args_get_empty_objects() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut aggregator = ChunkAggregator::default();

        aggregator.handle_payload(
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_cart"}}]}}]}"#,
            &tx,
        );
        aggregator.finish(&tx);

        let events = drain(&mut rx);
        match &events[0] {
            StreamEvent::ToolCalls(calls) => {
                assert_eq!(calls[0].name, "get_cart");
                assert_eq!(calls[0].arguments, json!({}));
            }
            other => panic!("expected tool calls, got {other:?}"),
        }
    }
}
