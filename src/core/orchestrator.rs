//! Conversation orchestrator.
//!
//! Drives one model turn: forwards content as it streams, executes any tool
//! batch through the capability client in the exact order the model emitted
//! it, appends structured results to history, then re-enters the model once
//! with the extended context before terminating the turn.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::{ChatMessage, ToolDescriptor, TurnRequest, Usage};
use crate::core::message::Role;
use crate::core::persistence::ConversationStore;
use crate::error::OrchestratorError;
use crate::mcp::client::{CapabilityClient, ToolCallOutcome};
use crate::providers::{ChatProvider, StreamEvent, ToolCallRequest};

/// Known tool that requires a context hint; the model frequently omits it,
/// so a missing value is filled in rather than failing the call.
const SEARCH_SHOP_CATALOG_TOOL: &str = "search_shop_catalog";
const DEFAULT_SEARCH_CONTEXT: &str = "The shopper is browsing the storefront chat.";

pub const DEFAULT_MAX_TOKENS: u32 = 1024;
pub const DEFAULT_TEMPERATURE: f32 = 1.0;

/// Turn lifecycle. `Done` and `Error` are terminal; the orchestrator makes a
/// single pass back to `AwaitingModel` after a tool batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    AwaitingModel,
    ProcessingToolCalls,
    Done,
    Error,
}

/// Events forwarded to the caller's output channel during a turn.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Content(String),
    ToolCallStarted { name: String },
    MessageAppended,
    Status(String),
    Done { text: String, usage: Option<Usage> },
    Error(String),
}

/// Seam between the orchestrator and the dual capability client. Injected at
/// construction; the orchestrator never reaches into ambient scope for it.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    fn tool_descriptors(&self) -> Vec<ToolDescriptor>;

    async fn dispatch(&self, name: &str, arguments: Value) -> ToolCallOutcome;
}

#[async_trait]
impl ToolDispatcher for CapabilityClient {
    fn tool_descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools()
    }

    async fn dispatch(&self, name: &str, arguments: Value) -> ToolCallOutcome {
        self.call_tool(name, arguments).await
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

pub struct ConversationOrchestrator {
    provider: Arc<dyn ChatProvider>,
    tools: Arc<dyn ToolDispatcher>,
    store: Arc<dyn ConversationStore>,
    settings: OrchestratorSettings,
}

/// Fills in documented defaults for known tools when the model omitted a
/// required argument.
fn inject_default_arguments(name: &str, mut arguments: Value) -> Value {
    if name == SEARCH_SHOP_CATALOG_TOOL {
        if !arguments.is_object() {
            arguments = Value::Object(Default::default());
        }
        if let Some(map) = arguments.as_object_mut() {
            map.entry("context")
                .or_insert_with(|| json!(DEFAULT_SEARCH_CONTEXT));
        }
    }
    arguments
}

/// Serializes a tool outcome into the history entry the next model pass
/// consumes.
fn tool_result_entry(name: &str, outcome: &ToolCallOutcome) -> String {
    let entry = match outcome {
        ToolCallOutcome::Success(data) => json!({
            "type": "tool_result",
            "tool": name,
            "status": "success",
            "data": data,
        }),
        ToolCallOutcome::Failure(failure) => json!({
            "type": "tool_result",
            "tool": name,
            "status": "error",
            "error": {
                "type": failure.kind(),
                "data": failure.data(),
            },
        }),
    };
    entry.to_string()
}

impl ConversationOrchestrator {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        tools: Arc<dyn ToolDispatcher>,
        store: Arc<dyn ConversationStore>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            settings,
        }
    }

    /// Runs one conversation turn.
    ///
    /// History writes are not transactional with tool execution; a process
    /// failure between executing a tool and saving its result loses that
    /// result (at-most-once).
    pub async fn run_turn(
        &self,
        conversation_id: &str,
        user_message: &str,
        output: &mpsc::UnboundedSender<TurnEvent>,
    ) -> Result<TurnState, OrchestratorError> {
        if user_message.trim().is_empty() {
            return Err(OrchestratorError::EmptyMessage);
        }

        self.store
            .save(conversation_id, Role::User, user_message)
            .await?;
        let mut messages: Vec<ChatMessage> = self
            .store
            .history(conversation_id)
            .await?
            .into_iter()
            .map(|message| ChatMessage {
                role: message.role.as_str().to_string(),
                content: message.content,
            })
            .collect();

        let mut turn_text = String::new();
        let mut continuation = false;

        loop {
            let mut stream = self.provider.stream(TurnRequest {
                messages: messages.clone(),
                tools: self.tools.tool_descriptors(),
                system_prompt: self.settings.system_prompt.clone(),
                max_tokens: self.settings.max_tokens,
                temperature: self.settings.temperature,
            });

            let mut pass_text = String::new();
            let mut pending: Option<Vec<ToolCallRequest>> = None;
            let mut completed: Option<(String, Option<Usage>)> = None;

            while let Some(event) = stream.recv().await {
                match event {
                    StreamEvent::Content(text) => {
                        pass_text.push_str(&text);
                        let _ = output.send(TurnEvent::Content(text));
                    }
                    StreamEvent::Status(text) => {
                        let _ = output.send(TurnEvent::Status(text));
                    }
                    StreamEvent::ToolCalls(calls) => {
                        if continuation {
                            // Single-continuation contract: a second tool
                            // batch is surfaced, not executed.
                            warn!(
                                count = calls.len(),
                                "Model requested tools after the continuation pass"
                            );
                            let _ = output.send(TurnEvent::Status(
                                "Further tool requests were deferred; finishing the turn."
                                    .to_string(),
                            ));
                        } else {
                            // A pass may emit more than one batch; keep them
                            // all, in emission order.
                            pending.get_or_insert_with(Vec::new).extend(calls);
                        }
                    }
                    StreamEvent::Done { text, usage } => {
                        completed = Some((text, usage));
                    }
                    StreamEvent::Error(message) => {
                        let _ = output.send(TurnEvent::Error(message));
                        return Ok(TurnState::Error);
                    }
                }
            }

            let (done_text, usage) = completed.unwrap_or_default();
            let pass_output = if pass_text.is_empty() {
                done_text
            } else {
                pass_text
            };
            turn_text.push_str(&pass_output);

            if let Some(calls) = pending {
                debug!(count = calls.len(), "Processing tool call batch");
                if !pass_output.is_empty() {
                    messages.push(ChatMessage::assistant(pass_output));
                }
                // Strictly sequential, in model order: interleaving would
                // scramble the history the continuation pass reads.
                for call in calls {
                    let _ = output.send(TurnEvent::ToolCallStarted {
                        name: call.name.clone(),
                    });
                    let arguments = inject_default_arguments(&call.name, call.arguments);
                    let outcome = self.tools.dispatch(&call.name, arguments).await;
                    let entry = tool_result_entry(&call.name, &outcome);
                    self.store
                        .save(conversation_id, Role::User, &entry)
                        .await?;
                    messages.push(ChatMessage::user(entry));
                    let _ = output.send(TurnEvent::MessageAppended);
                }
                continuation = true;
                continue;
            }

            if !turn_text.is_empty() {
                self.store
                    .save(conversation_id, Role::Assistant, &turn_text)
                    .await?;
            }
            let _ = output.send(TurnEvent::Done {
                text: turn_text,
                usage,
            });
            return Ok(TurnState::Done);
        }
    }
}
