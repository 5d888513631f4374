// Session accessor injected into the HTTP client.
// Deep request logic never reaches for ambient auth state; everything goes
// through this trait, which also makes tests trivial to wire with a fake.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::storage::{StateStorage, AUTH_STORAGE_KEY};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub surname: String,
    #[serde(default)]
    pub middle_name: Option<String>,
    pub email: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub country: String,
}

pub trait SessionStore: Send + Sync {
    fn token(&self) -> Option<String>;
    fn set_token(&self, token: String);
    fn user(&self) -> Option<User>;
    fn set_user(&self, user: User);
    fn is_authenticated(&self) -> bool {
        self.token().is_some()
    }
    /// Drops both token and user (logout / failed refresh).
    fn clear(&self);
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct SessionState {
    token: Option<String>,
    user: Option<User>,
}

/// Session state persisted under [`AUTH_STORAGE_KEY`], separately from the
/// booking snapshot so a booking reset never logs the user out.
pub struct MemorySession {
    state: RwLock<SessionState>,
    storage: Option<Arc<dyn StateStorage>>,
}

impl MemorySession {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(SessionState::default()),
            storage: None,
        }
    }

    /// Restores any persisted session and writes back on every mutation.
    pub fn with_storage(storage: Arc<dyn StateStorage>) -> Self {
        let state = storage
            .load(AUTH_STORAGE_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            state: RwLock::new(state),
            storage: Some(storage),
        }
    }

    fn persist(&self) {
        if let Some(storage) = &self.storage {
            let state = self.state.read();
            match serde_json::to_string(&*state) {
                Ok(raw) => storage.save(AUTH_STORAGE_KEY, &raw),
                Err(err) => tracing::warn!(%err, "failed to serialize session state"),
            }
        }
    }
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionStore for MemorySession {
    fn token(&self) -> Option<String> {
        self.state.read().token.clone()
    }

    fn set_token(&self, token: String) {
        self.state.write().token = Some(token);
        self.persist();
    }

    fn user(&self) -> Option<User> {
        self.state.read().user.clone()
    }

    fn set_user(&self, user: User) {
        self.state.write().user = Some(user);
        self.persist();
    }

    fn clear(&self) {
        {
            let mut state = self.state.write();
            state.token = None;
            state.user = None;
        }
        self.persist();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn sample_user() -> User {
        User {
            id: "u-1".into(),
            name: "Anna".into(),
            surname: "Keller".into(),
            middle_name: None,
            email: "anna@example.com".into(),
            phone: "+4915200000000".into(),
            country: "DE".into(),
        }
    }

    #[test]
    fn clear_drops_token_and_user() {
        let session = MemorySession::new();
        session.set_token("t1".into());
        session.set_user(sample_user());
        assert!(session.is_authenticated());

        session.clear();
        assert_eq!(session.token(), None);
        assert_eq!(session.user(), None);
        assert!(!session.is_authenticated());
    }

    #[test]
    fn session_survives_reconstruction_via_storage() {
        let storage = MemoryStorage::shared();
        let session = MemorySession::with_storage(storage.clone());
        session.set_token("t1".into());
        session.set_user(sample_user());

        let restored = MemorySession::with_storage(storage);
        assert_eq!(restored.token().as_deref(), Some("t1"));
        assert_eq!(restored.user().map(|u| u.id), Some("u-1".to_string()));
    }
}
