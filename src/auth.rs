use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

/// Identity attached to a live feed connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscriber {
    pub id: String,
    pub name: String,
    /// Only privileged subscribers may open the live feed.
    pub privileged: bool,
}

impl Subscriber {
    pub fn new(id: impl Into<String>, name: impl Into<String>, privileged: bool) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            privileged,
        }
    }
}

/// Validates the short-lived credential presented when subscribing.
#[async_trait]
pub trait StreamAuthenticator: Send + Sync {
    /// `None` when the token is unknown or expired.
    async fn authenticate(&self, token: &str) -> Option<Subscriber>;
}

/// Fixed token table. Rejects everything when empty.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, Subscriber>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, subscriber: Subscriber) -> Self {
        self.tokens.insert(token.into(), subscriber);
        self
    }
}

#[async_trait]
impl StreamAuthenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Option<Subscriber> {
        if token.is_empty() {
            return None;
        }
        self.tokens.get(token).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_tokens() {
        let auth = StaticTokenAuthenticator::new()
            .with_token("admin-token", Subscriber::new("1", "admin", true))
            .with_token("viewer-token", Subscriber::new("2", "viewer", false));

        assert!(auth.authenticate("admin-token").await.unwrap().privileged);
        assert!(!auth.authenticate("viewer-token").await.unwrap().privileged);
        assert!(auth.authenticate("nope").await.is_none());
        assert!(auth.authenticate("").await.is_none());
        assert!(StaticTokenAuthenticator::new().authenticate("admin-token").await.is_none());
    }
}
