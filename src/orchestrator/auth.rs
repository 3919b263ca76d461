use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::config::UserConfig;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// Resolves a caller credential (already extracted from the transport) to a
/// user. `None` means unauthenticated.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, credential: &str) -> Option<Principal>;
}

/// Fixed token table, loaded from configuration. Disabled users are left out.
#[derive(Clone, Default)]
pub struct StaticTokenAuthenticator {
    users_by_token: HashMap<String, String>,
}

impl fmt::Debug for StaticTokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenAuthenticator")
            .field("users", &self.users_by_token.len())
            .finish()
    }
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.users_by_token.insert(token.into(), user_id.into());
        self
    }

    pub fn from_users(users: &[UserConfig]) -> Self {
        users
            .iter()
            .filter(|user| user.enabled)
            .fold(Self::new(), |auth, user| {
                auth.with_user(user.id.clone(), user.token.clone())
            })
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, credential: &str) -> Option<Principal> {
        let credential = credential.trim();
        if credential.is_empty() {
            return None;
        }
        self.users_by_token
            .get(credential)
            .map(|user_id| Principal::new(user_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_users_cannot_authenticate() {
        let auth = StaticTokenAuthenticator::from_users(&[
            UserConfig {
                id: "alice".to_string(),
                token: "tok-a".to_string(),
                enabled: true,
            },
            UserConfig {
                id: "bob".to_string(),
                token: "tok-b".to_string(),
                enabled: false,
            },
        ]);

        assert_eq!(auth.authenticate("tok-a").await, Some(Principal::new("alice")));
        assert_eq!(auth.authenticate("tok-b").await, None);
        assert_eq!(auth.authenticate("").await, None);
        assert!(!format!("{auth:?}").contains("tok-a"));
    }
}
