//! Provider-agnostic chat wire types shared by the backends and the
//! orchestrator.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// One named, schema-described capability as exchanged with callers.
///
/// Capability servers send the camelCase MCP field name on the wire; both
/// spellings are accepted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(alias = "inputSchema")]
    pub input_schema: Value,
}

/// The function-call declaration shape backends consume.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDescriptor {
    /// Converts to a backend declaration, passing the schema through the
    /// given compatibility filter.
    pub fn to_function_declaration(&self, filter: impl Fn(&Value) -> Value) -> FunctionDeclaration {
        FunctionDeclaration {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: filter(&self.input_schema),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One model turn as handed to a backend.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    pub system_prompt: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}
