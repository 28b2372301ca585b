//! Persistence collaborator interface.
//!
//! History is an ordered, append-only sequence per conversation. Writes are
//! not transactional with tool execution: a process failure between running
//! a tool and saving its result loses that result (at-most-once). That gap
//! is accepted and documented rather than papered over.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::core::message::{ConversationMessage, Role};
use crate::error::StoreError;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn save(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<ConversationMessage, StoreError>;

    async fn history(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError>;
}

/// Store backed by process memory; used in tests and by embedders that do
/// not need durable history.
#[derive(Default)]
pub struct InMemoryStore {
    conversations: Mutex<HashMap<String, Vec<ConversationMessage>>>,
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    async fn save(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
    ) -> Result<ConversationMessage, StoreError> {
        let message = ConversationMessage::new(role, content);
        self.conversations
            .lock()
            .map_err(|_| StoreError("store mutex poisoned".to_string()))?
            .entry(conversation_id.to_string())
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn history(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, StoreError> {
        Ok(self
            .conversations
            .lock()
            .map_err(|_| StoreError("store mutex poisoned".to_string()))?
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}
