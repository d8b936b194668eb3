//! Security store consumed by the connect processor.
//!
//! The broker core never inspects credential storage; it only asks the store
//! whether a user/credential pair is valid, once per login attempt, and
//! records the resulting identity on the session. The production deployment
//! plugs in a database-backed store; [`StaticSecurityStore`] is the
//! config-driven implementation the broker ships with, and tests substitute
//! their own fakes through the same trait.

use crate::config::UserCredential;
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

#[async_trait]
pub trait SecurityStore: Send + Sync {
    async fn authenticate(&self, user: &str, credential: &str) -> bool;
}

/// In-memory user/credential table loaded from configuration.
pub struct StaticSecurityStore {
    users: HashMap<String, String>,
    allow_anonymous: bool,
}

impl StaticSecurityStore {
    pub fn new(users: &[UserCredential], allow_anonymous: bool) -> Self {
        Self {
            users: users
                .iter()
                .map(|u| (u.user.clone(), u.credential.clone()))
                .collect(),
            allow_anonymous,
        }
    }
}

#[async_trait]
impl SecurityStore for StaticSecurityStore {
    async fn authenticate(&self, user: &str, credential: &str) -> bool {
        match self.users.get(user) {
            Some(expected) => expected == credential,
            None => {
                if self.allow_anonymous {
                    debug!(user, "accepting unknown user (anonymous access enabled)");
                    true
                } else {
                    false
                }
            }
        }
    }
}
