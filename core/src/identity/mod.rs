// Identity: the device id and bearer token presented to the backend

mod store;

pub use store::SessionStore;

use crate::store::StoreError;

/// Snapshot of the device credentials at the time of use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    /// Present only while the device is bound to a backend account
    pub device_token: Option<String>,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, device_token: Option<String>) -> Self {
        Self {
            device_id: device_id.into(),
            device_token,
        }
    }

    pub fn has_token(&self) -> bool {
        self.device_token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Read-only access to the current device identity
///
/// Implementations are queried at each use so a re-binding performed by the
/// host is picked up by the next connect or upload.
pub trait IdentitySource: Send + Sync {
    fn identity(&self) -> Result<DeviceIdentity, StoreError>;
}

/// Fixed identity, for hosts that manage credentials themselves
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub DeviceIdentity);

impl IdentitySource for StaticIdentity {
    fn identity(&self) -> Result<DeviceIdentity, StoreError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_is_not_a_credential() {
        assert!(!DeviceIdentity::new("d", Some(String::new())).has_token());
        assert!(!DeviceIdentity::new("d", None).has_token());
        assert!(DeviceIdentity::new("d", Some("t".into())).has_token());
    }
}
