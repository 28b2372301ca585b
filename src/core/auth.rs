//! Authorization-link collaborator interface.
//!
//! When the scoped endpoint rejects a call with 401, the capability client
//! asks this collaborator for a recovery URL the shopper can follow to grant
//! access, and surfaces it as a structured `auth_required` result instead of
//! failing the turn.

use async_trait::async_trait;

use crate::error::AuthLinkError;

#[async_trait]
pub trait AuthLinkGenerator: Send + Sync {
    async fn generate(
        &self,
        conversation_id: &str,
        subject_id: &str,
    ) -> Result<String, AuthLinkError>;
}
