//! Session-token retrieval.
//!
//! The client asks a [`SessionTokenProvider`] for the current user's session
//! token every time it sends `connect` or `subscribe`, so a login or logout
//! between reconnects is picked up automatically.

use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;

/// Supplies the session token attached to outbound operations.
#[async_trait]
pub trait SessionTokenProvider: Send + Sync + fmt::Debug {
    /// Current token, or `None` for an anonymous session.
    async fn current_session_token(&self) -> Result<Option<String>>;
}

/// In-memory token that can be swapped at runtime.
#[derive(Debug, Default)]
pub struct StaticSessionToken {
    token: RwLock<Option<String>>,
}

impl StaticSessionToken {
    /// Provider returning `token`.
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: RwLock::new(token),
        }
    }

    /// Provider for an anonymous session.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replace the token (e.g. after login or logout).
    pub fn set(&self, token: Option<String>) {
        *self.token.write() = token;
    }
}

#[async_trait]
impl SessionTokenProvider for StaticSessionToken {
    async fn current_session_token(&self) -> Result<Option<String>> {
        Ok(self.token.read().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_token_can_be_replaced() {
        let provider = StaticSessionToken::anonymous();
        assert_eq!(provider.current_session_token().await.unwrap(), None);

        provider.set(Some("r:abc".to_string()));
        assert_eq!(
            provider.current_session_token().await.unwrap().as_deref(),
            Some("r:abc")
        );
    }
}
