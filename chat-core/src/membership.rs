//! Interfaces to collaborators explicitly out of scope for this core (spec
//! §1): authentication/session issuance and channel membership. The core
//! consumes only *authenticated user identity*, *channel membership
//! lookup*, and *tenant id for a channel* from these.

use async_trait::async_trait;

use crate::error::ChatError;
use crate::ids::{ChannelId, TenantId, UserId};

/// Resolves a bearer token to an authenticated identity. Implemented by an
/// external auth/session service; this core only ever calls it, never
/// issues tokens itself.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, ChatError>;
}

/// Read-only membership lookups. Owned by an external CRUD service; the
/// core treats `ChannelMembership` as foreign state (spec §3 "Ownership").
#[async_trait]
pub trait MembershipProvider: Send + Sync {
    /// Is `user` currently a member of `channel`? Used to enforce I4.
    async fn is_member(&self, channel: ChannelId, user: UserId) -> Result<bool, ChatError>;

    /// All current members of a channel.
    async fn members(&self, channel: ChannelId) -> Result<Vec<UserId>, ChatError>;

    /// The tenant a channel belongs to.
    async fn tenant_of(&self, channel: ChannelId) -> Result<TenantId, ChatError>;
}

/// An in-memory stand-in used by tests and local development, where there
/// is no real auth/session service to call out to. Production deployments
/// plug in a real `AuthProvider` backed by the session service (spec §1:
/// "authentication and session issuance" is an external collaborator).
#[derive(Default)]
pub struct StaticAuth {
    pub tokens: std::collections::HashMap<String, UserId>,
}

#[async_trait]
impl AuthProvider for StaticAuth {
    async fn authenticate(&self, token: &str) -> Result<UserId, ChatError> {
        self.tokens.get(token).copied().ok_or(ChatError::Unauthenticated)
    }
}

/// An in-memory stand-in used by tests and local development, where there
/// is no real membership service to call out to.
#[derive(Default)]
pub struct StaticMembership {
    pub members_by_channel: std::collections::HashMap<ChannelId, Vec<UserId>>,
    pub tenant_by_channel: std::collections::HashMap<ChannelId, TenantId>,
}

#[async_trait]
impl MembershipProvider for StaticMembership {
    async fn is_member(&self, channel: ChannelId, user: UserId) -> Result<bool, ChatError> {
        Ok(self.members_by_channel.get(&channel).map(|m| m.contains(&user)).unwrap_or(false))
    }

    async fn members(&self, channel: ChannelId) -> Result<Vec<UserId>, ChatError> {
        Ok(self.members_by_channel.get(&channel).cloned().unwrap_or_default())
    }

    async fn tenant_of(&self, channel: ChannelId) -> Result<TenantId, ChatError> {
        self.tenant_by_channel.get(&channel).copied().ok_or(ChatError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_auth_rejects_unknown_tokens() {
        let auth = StaticAuth::default();
        assert_eq!(auth.authenticate("nope").await, Err(ChatError::Unauthenticated));
    }

    #[tokio::test]
    async fn static_membership_reports_containment() {
        let user = UserId::new_v4();
        let channel = ChannelId::new_v4();
        let mut m = StaticMembership::default();
        m.members_by_channel.insert(channel, vec![user]);

        assert!(m.is_member(channel, user).await.unwrap());
        assert!(!m.is_member(channel, UserId::new_v4()).await.unwrap());
    }
}
