//! Agent settings
//!
//! Settings the host edits and the core reads at use time:
//! - Capture interval (minimum 5 seconds)
//! - Camera preference, orientation policy and convergence gate
//! - Local storage visibility and capture acknowledgment
//! - Backend URL and reconnect tuning

use crate::capture::{CaptureParams, ConvergenceGate, ForcedOrientation, OrientationPolicy};
use crate::connection::{BackoffConfig, BackoffStrategy};
use crate::store::StorageBackend;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shortest allowed capture interval
pub const MIN_CAPTURE_INTERVAL_SECS: u32 = 5;
pub const DEFAULT_CAPTURE_INTERVAL_SECS: u32 = 30;
pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8081/";

/// Settings shared between the service and the capture path
pub type SharedSettings = Arc<RwLock<AgentSettings>>;

const SETTINGS_KEY: &[u8] = b"settings/agent";
const WEBSOCKET_PATH: &str = "/ws/websocket";
const UPLOAD_PATH: &str = "/api/v1/photos/upload";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Capture interval must be at least {min}s, got {got}s")]
    IntervalTooShort { got: u32, min: u32 },

    #[error("Server URL must start with http:// or https://, got '{0}'")]
    InvalidServerUrl(String),

    #[error("Unknown setting '{0}'")]
    UnknownKey(String),

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Settings storage error: {0}")]
    Storage(String),

    #[error("Settings serialization error: {0}")]
    Serialization(String),
}

// ============================================================================
// AGENT SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSettings {
    /// Seconds between scheduled captures
    pub capture_interval_secs: u32,

    /// Preferred camera; falls back to the first rear camera when absent
    pub selected_camera_id: Option<String>,

    /// Save local copies to the shared gallery instead of app-private storage
    pub storage_public: bool,

    /// Show a user-visible acknowledgment after each successful capture
    pub show_acknowledgment: bool,

    /// Derive JPEG orientation from sensor and device rotation
    pub auto_rotate: bool,

    /// Orientation used when auto-rotation is off
    pub forced_orientation: ForcedOrientation,

    pub convergence_gate: ConvergenceGate,

    /// HTTP(S) base URL of the backend
    pub server_url: String,

    pub reconnect: BackoffConfig,
}

impl AgentSettings {
    /// Names accepted by `get`/`set`
    pub const KEYS: [&'static str; 11] = [
        "capture_interval",
        "selected_camera_id",
        "storage_public",
        "show_acknowledgment",
        "auto_rotate",
        "forced_orientation",
        "convergence_gate",
        "server_url",
        "reconnect_strategy",
        "reconnect_base_ms",
        "reconnect_max_ms",
    ];

    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.capture_interval_secs < MIN_CAPTURE_INTERVAL_SECS {
            return Err(SettingsError::IntervalTooShort {
                got: self.capture_interval_secs,
                min: MIN_CAPTURE_INTERVAL_SECS,
            });
        }

        let url = self.server_url.trim();
        let host = url
            .strip_prefix("https://")
            .or_else(|| url.strip_prefix("http://"));
        if host.map_or(true, |h| h.trim_end_matches('/').is_empty()) {
            return Err(SettingsError::InvalidServerUrl(self.server_url.clone()));
        }

        if self.reconnect.base_ms == 0 || self.reconnect.max_ms < self.reconnect.base_ms {
            return Err(SettingsError::InvalidValue {
                key: "reconnect".to_string(),
                value: format!("{}..{}", self.reconnect.base_ms, self.reconnect.max_ms),
                reason: "base must be non-zero and not above max".to_string(),
            });
        }

        Ok(())
    }

    pub fn capture_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.capture_interval_secs))
    }

    /// Socket URL: HTTP scheme swapped for its WS equivalent, fixed path appended
    pub fn websocket_url(&self) -> String {
        let base = self.base_url();
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}{}", ws, WEBSOCKET_PATH)
    }

    pub fn upload_url(&self) -> String {
        format!("{}{}", self.base_url(), UPLOAD_PATH)
    }

    pub fn orientation_policy(&self) -> OrientationPolicy {
        OrientationPolicy {
            auto_rotate: self.auto_rotate,
            forced: self.forced_orientation,
        }
    }

    pub fn capture_params(&self) -> CaptureParams {
        CaptureParams {
            preferred_camera: self.selected_camera_id.clone(),
            orientation: self.orientation_policy(),
            gate: self.convergence_gate,
        }
    }

    /// Read a setting by name, formatted for display
    pub fn get(&self, key: &str) -> Result<String, SettingsError> {
        let value = match key {
            "capture_interval" => self.capture_interval_secs.to_string(),
            "selected_camera_id" => self.selected_camera_id.clone().unwrap_or_default(),
            "storage_public" => self.storage_public.to_string(),
            "show_acknowledgment" => self.show_acknowledgment.to_string(),
            "auto_rotate" => self.auto_rotate.to_string(),
            "forced_orientation" => self.forced_orientation.to_string(),
            "convergence_gate" => match self.convergence_gate {
                ConvergenceGate::FocusLock => "focus_lock".to_string(),
                ConvergenceGate::Precapture => "precapture".to_string(),
            },
            "server_url" => self.server_url.clone(),
            "reconnect_strategy" => match self.reconnect.strategy {
                BackoffStrategy::Linear => "linear".to_string(),
                BackoffStrategy::Exponential => "exponential".to_string(),
            },
            "reconnect_base_ms" => self.reconnect.base_ms.to_string(),
            "reconnect_max_ms" => self.reconnect.max_ms.to_string(),
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        };
        Ok(value)
    }

    /// Update a setting by name. The change is only applied if the result
    /// still validates.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), SettingsError> {
        let mut next = self.clone();
        let invalid = |reason: &str| SettingsError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
        };

        match key {
            "capture_interval" => {
                next.capture_interval_secs = value.parse().map_err(|_| invalid("not a number"))?
            }
            "selected_camera_id" => {
                next.selected_camera_id = Some(value.trim())
                    .filter(|v| !v.is_empty())
                    .map(str::to_string)
            }
            "storage_public" => {
                next.storage_public = parse_bool(value).ok_or_else(|| invalid("expected true/false"))?
            }
            "show_acknowledgment" => {
                next.show_acknowledgment =
                    parse_bool(value).ok_or_else(|| invalid("expected true/false"))?
            }
            "auto_rotate" => {
                next.auto_rotate = parse_bool(value).ok_or_else(|| invalid("expected true/false"))?
            }
            "forced_orientation" => {
                next.forced_orientation = value.parse().map_err(|e: String| invalid(&e))?
            }
            "convergence_gate" => {
                next.convergence_gate = match value {
                    "focus_lock" => ConvergenceGate::FocusLock,
                    "precapture" => ConvergenceGate::Precapture,
                    _ => return Err(invalid("expected focus_lock or precapture")),
                }
            }
            "server_url" => next.server_url = value.trim().to_string(),
            "reconnect_strategy" => {
                next.reconnect.strategy = match value {
                    "linear" => BackoffStrategy::Linear,
                    "exponential" => BackoffStrategy::Exponential,
                    _ => return Err(invalid("expected linear or exponential")),
                }
            }
            "reconnect_base_ms" => {
                next.reconnect.base_ms = value.parse().map_err(|_| invalid("not a number"))?
            }
            "reconnect_max_ms" => {
                next.reconnect.max_ms = value.parse().map_err(|_| invalid("not a number"))?
            }
            other => return Err(SettingsError::UnknownKey(other.to_string())),
        }

        next.validate()?;
        *self = next;
        Ok(())
    }

    fn base_url(&self) -> &str {
        self.server_url.trim().trim_end_matches('/')
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            capture_interval_secs: DEFAULT_CAPTURE_INTERVAL_SECS,
            selected_camera_id: None,
            storage_public: false,
            show_acknowledgment: false,
            auto_rotate: true,
            forced_orientation: ForcedOrientation::Portrait,
            convergence_gate: ConvergenceGate::FocusLock,
            server_url: DEFAULT_SERVER_URL.to_string(),
            reconnect: BackoffConfig::default(),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

// ============================================================================
// PERSISTENCE
// ============================================================================

/// Loads and saves `AgentSettings` as one JSON value
pub struct SettingsStore {
    backend: Arc<dyn StorageBackend>,
}

impl SettingsStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Stored settings, or defaults when nothing was saved yet
    pub fn load(&self) -> Result<AgentSettings, SettingsError> {
        match self.backend.get(SETTINGS_KEY).map_err(SettingsError::Storage)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| SettingsError::Serialization(e.to_string())),
            None => Ok(AgentSettings::default()),
        }
    }

    pub fn save(&self, settings: &AgentSettings) -> Result<(), SettingsError> {
        settings.validate()?;
        let bytes =
            serde_json::to_vec(settings).map_err(|e| SettingsError::Serialization(e.to_string()))?;
        self.backend
            .put(SETTINGS_KEY, &bytes)
            .map_err(SettingsError::Storage)?;
        self.backend.flush().map_err(SettingsError::Storage)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStorage;

    #[test]
    fn test_default_settings_valid() {
        let settings = AgentSettings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.capture_interval(), Duration::from_secs(30));
        assert!(settings.auto_rotate);
        assert!(!settings.show_acknowledgment);
    }

    #[test]
    fn test_interval_minimum_enforced() {
        let mut settings = AgentSettings::default();
        settings.capture_interval_secs = 4;
        assert_eq!(
            settings.validate(),
            Err(SettingsError::IntervalTooShort { got: 4, min: 5 })
        );

        settings.capture_interval_secs = 5;
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_server_url_scheme_required() {
        let mut settings = AgentSettings::default();
        settings.server_url = "ftp://host".to_string();
        assert!(settings.validate().is_err());

        settings.server_url = "https://".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_websocket_url_derivation() {
        let mut settings = AgentSettings::default();
        settings.server_url = "http://10.0.2.2:8081/".to_string();
        assert_eq!(settings.websocket_url(), "ws://10.0.2.2:8081/ws/websocket");

        settings.server_url = "https://cam.example.com".to_string();
        assert_eq!(settings.websocket_url(), "wss://cam.example.com/ws/websocket");
        assert_eq!(
            settings.upload_url(),
            "https://cam.example.com/api/v1/photos/upload"
        );
    }

    #[test]
    fn test_set_and_get_by_key() {
        let mut settings = AgentSettings::default();
        settings.set("capture_interval", "60").unwrap();
        settings.set("auto_rotate", "false").unwrap();
        settings.set("forced_orientation", "landscape_reversed").unwrap();
        settings.set("selected_camera_id", "2").unwrap();

        assert_eq!(settings.get("capture_interval").unwrap(), "60");
        assert_eq!(settings.get("forced_orientation").unwrap(), "landscape_reversed");
        let params = settings.capture_params();
        assert_eq!(params.preferred_camera.as_deref(), Some("2"));
        assert!(!params.orientation.auto_rotate);

        settings.set("selected_camera_id", "").unwrap();
        assert!(settings.selected_camera_id.is_none());
    }

    #[test]
    fn test_invalid_set_leaves_settings_unchanged() {
        let mut settings = AgentSettings::default();
        assert!(settings.set("capture_interval", "2").is_err());
        assert!(settings.set("auto_rotate", "maybe").is_err());
        assert!(matches!(
            settings.set("volume", "11"),
            Err(SettingsError::UnknownKey(_))
        ));
        assert_eq!(settings, AgentSettings::default());
    }

    #[test]
    fn test_every_key_readable() {
        let settings = AgentSettings::default();
        for key in AgentSettings::KEYS {
            assert!(settings.get(key).is_ok(), "{}", key);
        }
    }

    #[test]
    fn test_store_round_trip() {
        let store = SettingsStore::new(Arc::new(MemoryStorage::new()));
        assert_eq!(store.load().unwrap(), AgentSettings::default());

        let mut settings = AgentSettings::default();
        settings.set("storage_public", "true").unwrap();
        settings.set("reconnect_strategy", "linear").unwrap();
        store.save(&settings).unwrap();

        assert_eq!(store.load().unwrap(), settings);
    }

    #[test]
    fn test_store_rejects_invalid() {
        let store = SettingsStore::new(Arc::new(MemoryStorage::new()));
        let settings = AgentSettings {
            capture_interval_secs: 1,
            ..Default::default()
        };
        assert!(store.save(&settings).is_err());
    }
}
