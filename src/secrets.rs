//! SecretStore - credential indirection
//!
//! Device descriptors never carry usernames/passwords; they carry an opaque
//! [`SecretHandle`] resolved against this store at the point of use. Composed
//! URIs containing credentials are transient and must never be logged or
//! persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Opaque reference to a stored credential pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretHandle(Uuid);

/// Username/password pair. Debug output redacts the password.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// In-memory credential store keyed by opaque handles
pub struct SecretStore {
    entries: RwLock<HashMap<Uuid, Credentials>>,
}

impl SecretStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Store a credential pair and return its handle
    pub async fn insert(&self, credentials: Credentials) -> SecretHandle {
        let id = Uuid::new_v4();
        self.entries.write().await.insert(id, credentials);
        SecretHandle(id)
    }

    /// Resolve a handle to the stored credentials
    pub async fn resolve(&self, handle: &SecretHandle) -> Option<Credentials> {
        self.entries.read().await.get(&handle.0).cloned()
    }

    /// Drop stored credentials (e.g., when a device is removed)
    pub async fn revoke(&self, handle: &SecretHandle) {
        self.entries.write().await.remove(&handle.0);
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_resolve_revoke() {
        let store = SecretStore::new();
        let handle = store
            .insert(Credentials {
                username: "admin".to_string(),
                password: "secret".to_string(),
            })
            .await;

        let creds = store.resolve(&handle).await.unwrap();
        assert_eq!(creds.username, "admin");

        store.revoke(&handle).await;
        assert!(store.resolve(&handle).await.is_none());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials {
            username: "admin".to_string(),
            password: "hunter2".to_string(),
        };
        let dump = format!("{:?}", creds);
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains("<redacted>"));
    }
}
