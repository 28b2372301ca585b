//! Shopchat is a resilient tool-calling client for storefront assistants.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp`] speaks JSON-RPC to a pair of capability endpoints (a public
//!   storefront endpoint and a token-scoped customer endpoint), with retry,
//!   timeout, and cancellation handling plus a unified tool registry.
//! - [`providers`] adapts three AI backend streaming shapes (Anthropic,
//!   OpenAI-compatible, Gemini) into one internal event protocol.
//! - [`core`] owns conversation history, the authorization-link seam, and the
//!   turn orchestrator that feeds tool results back to the model.
//! - [`api`] defines the shared request/response payloads those layers
//!   exchange.
//!
//! Embedders construct a [`core::orchestrator::ConversationOrchestrator`] from
//! a provider, a connected [`mcp::client::CapabilityClient`], and a
//! [`core::persistence::ConversationStore`], then drive turns through it.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod mcp;
pub mod providers;

pub use crate::config::AgentConfig;
pub use crate::core::orchestrator::{ConversationOrchestrator, TurnEvent, TurnState};
pub use crate::error::{OrchestratorError, ProviderError, RpcCallError};
pub use crate::mcp::client::{CapabilityClient, ToolCallFailure, ToolCallOutcome};
pub use crate::providers::{build_provider, ChatProvider, ProviderKind, StreamEvent};
