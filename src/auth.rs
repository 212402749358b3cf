//! Token verification and the role capability predicates.
//!
//! Real deployments put an external verifier behind [`AuthProvider`];
//! [`StaticTokenAuth`] serves development setups and tests from tokens
//! listed in the configuration file.

use async_trait::async_trait;
use constant_time_eq::constant_time_eq;
use thiserror::Error;

use crate::types::{Role, UserId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("the bearer token was rejected")]
    InvalidToken,
    #[error("auth provider unavailable: {0}")]
    Unavailable(String),
}

/// What a verified bearer token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}

/// Verifies against a fixed token table. Comparison is constant-time so the
/// verifier does not leak token prefixes through timing.
pub struct StaticTokenAuth {
    tokens: Vec<(String, Identity)>,
}

impl StaticTokenAuth {
    pub fn new(tokens: Vec<(String, Identity)>) -> Self {
        Self { tokens }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenAuth {
    async fn verify(&self, token: &str) -> Result<Identity, AuthError> {
        self.tokens
            .iter()
            .find(|(candidate, _)| constant_time_eq(candidate.as_bytes(), token.as_bytes()))
            .map(|(_, identity)| identity.clone())
            .ok_or(AuthError::InvalidToken)
    }
}

pub fn can_edit(role: Role) -> bool {
    matches!(role, Role::Owner | Role::Editor)
}

pub fn can_admin(role: Role) -> bool {
    role == Role::Owner
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: UserId::new(user),
            display_name: user.to_string(),
            avatar_url: None,
        }
    }

    #[tokio::test]
    async fn known_token_resolves_to_its_identity() {
        let auth = StaticTokenAuth::new(vec![
            ("secret-a".into(), identity("alice")),
            ("secret-b".into(), identity("bob")),
        ]);
        assert_eq!(auth.verify("secret-b").await, Ok(identity("bob")));
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let auth = StaticTokenAuth::new(vec![("secret-a".into(), identity("alice"))]);
        assert_eq!(auth.verify("secret-x").await, Err(AuthError::InvalidToken));
        assert_eq!(auth.verify("").await, Err(AuthError::InvalidToken));
    }

    #[test]
    fn capability_predicates() {
        assert!(can_edit(Role::Owner));
        assert!(can_edit(Role::Editor));
        assert!(!can_edit(Role::Viewer));

        assert!(can_admin(Role::Owner));
        assert!(!can_admin(Role::Editor));
        assert!(!can_admin(Role::Viewer));
    }
}
