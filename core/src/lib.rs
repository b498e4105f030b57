// Backcam Core: background capture agent
//
// A device keeps one authenticated session open to the backend, takes a
// still photo on a schedule or on remote command, and reports its status.
// Hosts (the Android app, the desktop CLI) supply the camera hardware and
// drive the `AgentService` lifecycle.

pub mod capture;
pub mod connection;
pub mod dispatch;
pub mod identity;
pub mod protocol;
pub mod service;
pub mod settings;
pub mod store;
pub mod upload;

use thiserror::Error;

pub use capture::{
    CameraBackend, CameraError, CameraEvent, CameraEventSender, CameraInfo, CaptureCoordinator,
    CaptureEngine, CaptureResult, CaptureTrigger, DirectoryImageSink, ForcedOrientation,
    LensFacing,
};
pub use connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, StatusListener, WebSocketTransport,
};
pub use dispatch::{CommandDispatcher, RemoteCommand};
pub use identity::{DeviceIdentity, IdentitySource, SessionStore, StaticIdentity};
pub use service::{AgentService, AgentServiceBuilder, ServiceLifecycle};
pub use settings::{AgentSettings, SettingsError, SettingsStore};
pub use store::{MemoryStorage, SledStorage, StorageBackend, StoreError};
pub use upload::{HttpPhotoUploader, PhotoUploader, UploadError};

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors surfaced by the agent service to its host
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentError {
    #[error("Settings error: {0}")]
    Settings(#[from] SettingsError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),
}
