//! MCP capability-server integration: JSON-RPC transport, the dual
//! capability client, and its typed event surface.

use serde::{Deserialize, Serialize};

pub mod client;
pub mod events;
pub mod rpc;

pub const TOOLS_LIST_METHOD: &str = "tools/list";
pub const TOOLS_CALL_METHOD: &str = "tools/call";

/// The two configured capability endpoints of a session.
///
/// The scoped endpoint is authorization-bound (customer-scoped); the primary
/// endpoint is unscoped (storefront). On tool-name collisions the scoped
/// endpoint wins routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    Primary,
    Scoped,
}

impl EndpointRole {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointRole::Primary => "primary",
            EndpointRole::Scoped => "scoped",
        }
    }
}

/// Connection state of one endpoint. Legal transitions are
/// disconnected → connecting → {ready | failed | requires-auth}; `Ready`
/// implies the tool listing for that endpoint was fetched successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Ready,
    RequiresAuth,
    Failed,
}

impl EndpointState {
    pub fn as_str(self) -> &'static str {
        match self {
            EndpointState::Disconnected => "disconnected",
            EndpointState::Connecting => "connecting",
            EndpointState::Ready => "ready",
            EndpointState::RequiresAuth => "requires-auth",
            EndpointState::Failed => "failed",
        }
    }
}
