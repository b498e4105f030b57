// Device session persistence over a StorageBackend

use super::{DeviceIdentity, IdentitySource};
use crate::store::{StorageBackend, StoreError};
use parking_lot::Mutex;
use std::sync::Arc;

const DEVICE_ID_KEY: &[u8] = b"session/device_id";
const DEVICE_TOKEN_KEY: &[u8] = b"session/device_auth_token";
const IS_BOUND_KEY: &[u8] = b"session/is_bound";
const USER_JWT_KEY: &[u8] = b"session/user_jwt";
const USERNAME_KEY: &[u8] = b"session/username";

/// Persisted device identity and account binding
///
/// The device id is generated once and survives logout. The device token is
/// written only by the external binding flow (`save_device_binding`) and
/// cleared by `logout`; the connection and capture paths only read it.
pub struct SessionStore {
    backend: Arc<dyn StorageBackend>,
    /// Serializes first-use id generation
    id_guard: Mutex<()>,
}

impl SessionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            id_guard: Mutex::new(()),
        }
    }

    /// Stable device id, generated and persisted on first use
    pub fn device_id(&self) -> Result<String, StoreError> {
        let _guard = self.id_guard.lock();
        if let Some(id) = self.get_string(DEVICE_ID_KEY)? {
            return Ok(id);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.put_string(DEVICE_ID_KEY, &id)?;
        tracing::info!(device_id = %id, "Generated new device id");
        Ok(id)
    }

    pub fn device_token(&self) -> Result<Option<String>, StoreError> {
        self.get_string(DEVICE_TOKEN_KEY)
    }

    pub fn is_bound(&self) -> Result<bool, StoreError> {
        Ok(self.get_string(IS_BOUND_KEY)?.as_deref() == Some("true"))
    }

    /// Record the credential issued when the device is bound to an account
    pub fn save_device_binding(&self, device_token: &str) -> Result<(), StoreError> {
        self.put_string(DEVICE_TOKEN_KEY, device_token)?;
        self.put_string(IS_BOUND_KEY, "true")?;
        self.flush()
    }

    pub fn save_user_session(&self, jwt: &str, username: &str) -> Result<(), StoreError> {
        self.put_string(USER_JWT_KEY, jwt)?;
        self.put_string(USERNAME_KEY, username)?;
        self.flush()
    }

    pub fn user_jwt(&self) -> Result<Option<String>, StoreError> {
        self.get_string(USER_JWT_KEY)
    }

    pub fn username(&self) -> Result<Option<String>, StoreError> {
        self.get_string(USERNAME_KEY)
    }

    pub fn is_logged_in(&self) -> Result<bool, StoreError> {
        Ok(self.user_jwt()?.is_some_and(|jwt| !jwt.is_empty()))
    }

    /// Drop the user session and the device binding; the device id stays
    pub fn logout(&self) -> Result<(), StoreError> {
        for key in [USER_JWT_KEY, USERNAME_KEY, DEVICE_TOKEN_KEY, IS_BOUND_KEY] {
            self.backend
                .remove(key)
                .map_err(StoreError::Backend)?;
        }
        self.flush()
    }

    fn get_string(&self, key: &[u8]) -> Result<Option<String>, StoreError> {
        match self.backend.get(key).map_err(StoreError::Backend)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| StoreError::Corrupt {
                    key: String::from_utf8_lossy(key).into_owned(),
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    fn put_string(&self, key: &[u8], value: &str) -> Result<(), StoreError> {
        self.backend
            .put(key, value.as_bytes())
            .map_err(StoreError::Backend)
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.backend.flush().map_err(StoreError::Backend)
    }
}

impl IdentitySource for SessionStore {
    fn identity(&self) -> Result<DeviceIdentity, StoreError> {
        let device_id = self.device_id()?;
        let device_token = if self.is_bound()? {
            self.device_token()?
        } else {
            None
        };
        Ok(DeviceIdentity {
            device_id,
            device_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStorage, SledStorage};
    use tempfile::tempdir;

    fn memory_store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_device_id_is_stable() {
        let store = memory_store();
        let first = store.device_id().unwrap();
        let second = store.device_id().unwrap();
        assert_eq!(first, second);
        assert!(uuid::Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_unbound_identity_has_no_token() {
        let store = memory_store();
        let identity = store.identity().unwrap();
        assert!(identity.device_token.is_none());
        assert!(!store.is_bound().unwrap());
    }

    #[test]
    fn test_binding_sets_token() {
        let store = memory_store();
        store.save_device_binding("tok-1").unwrap();

        assert!(store.is_bound().unwrap());
        let identity = store.identity().unwrap();
        assert_eq!(identity.device_token.as_deref(), Some("tok-1"));
        assert!(identity.has_token());
    }

    #[test]
    fn test_logout_keeps_device_id() {
        let store = memory_store();
        let id = store.device_id().unwrap();
        store.save_user_session("jwt", "alice").unwrap();
        store.save_device_binding("tok").unwrap();
        assert!(store.is_logged_in().unwrap());

        store.logout().unwrap();

        assert!(!store.is_logged_in().unwrap());
        assert!(!store.is_bound().unwrap());
        assert!(store.device_token().unwrap().is_none());
        assert!(store.username().unwrap().is_none());
        assert_eq!(store.device_id().unwrap(), id);
    }

    #[test]
    fn test_session_persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session").to_str().unwrap().to_string();

        let id = {
            let backend = Arc::new(SledStorage::new(&path).unwrap());
            let store = SessionStore::new(backend);
            store.save_device_binding("persisted").unwrap();
            store.device_id().unwrap()
        };

        let backend = Arc::new(SledStorage::new(&path).unwrap());
        let store = SessionStore::new(backend);
        let identity = store.identity().unwrap();
        assert_eq!(identity.device_id, id);
        assert_eq!(identity.device_token.as_deref(), Some("persisted"));
    }
}
