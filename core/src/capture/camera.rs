// Camera hardware abstraction
//
// Every backend call only submits work; outcomes arrive later as
// `CameraEvent`s on the sender handed to `open_device`/`create_image_reader`.
// Backends may emit from any thread.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("No camera available")]
    NoCamera,

    #[error("Camera access failed: {0}")]
    Access(String),

    #[error("Camera device error: {0}")]
    Device(String),

    #[error("Session configuration failed: {0}")]
    Configure(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Close failed: {0}")]
    Close(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LensFacing {
    Back,
    Front,
    External,
}

/// One enumerated camera
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraInfo {
    pub id: String,
    pub facing: LensFacing,
    /// Clockwise mounting angle of the sensor, degrees
    pub sensor_orientation: u32,
}

impl CameraInfo {
    pub fn new(id: impl Into<String>, facing: LensFacing, sensor_orientation: u32) -> Self {
        Self {
            id: id.into(),
            facing,
            sensor_orientation,
        }
    }
}

impl fmt::Display for CameraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let facing = match self.facing {
            LensFacing::Back => "back",
            LensFacing::Front => "front",
            LensFacing::External => "external",
        };
        write!(f, "{} ({}, sensor {}°)", self.id, facing, self.sensor_orientation)
    }
}

/// Opaque handles minted by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderHandle(pub u64);

/// Auto-focus state reported in capture metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfState {
    Inactive,
    PassiveScan,
    PassiveFocused,
    PassiveUnfocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
}

impl AfState {
    /// AF has finished its sweep, whether or not it found focus
    pub fn is_settled(self) -> bool {
        matches!(self, AfState::FocusedLocked | AfState::NotFocusedLocked)
    }
}

/// Auto-exposure state reported in capture metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

/// Hardware callback, funnelled to the capture dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CameraEvent {
    DeviceOpened,
    DeviceDisconnected,
    DeviceError(String),
    SessionConfigured(SessionHandle),
    SessionConfigureFailed(String),
    /// Partial or complete metadata for a focus/precapture request
    CaptureProgress {
        af_state: Option<AfState>,
        ae_state: Option<AeState>,
    },
    StillCaptureCompleted,
    StillCaptureFailed(String),
    /// Encoded still from the image reader; `None` if the frame was unavailable
    ImageAvailable(Option<Vec<u8>>),
}

impl CameraEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CameraEvent::DeviceOpened => "device_opened",
            CameraEvent::DeviceDisconnected => "device_disconnected",
            CameraEvent::DeviceError(_) => "device_error",
            CameraEvent::SessionConfigured(_) => "session_configured",
            CameraEvent::SessionConfigureFailed(_) => "session_configure_failed",
            CameraEvent::CaptureProgress { .. } => "capture_progress",
            CameraEvent::StillCaptureCompleted => "still_capture_completed",
            CameraEvent::StillCaptureFailed(_) => "still_capture_failed",
            CameraEvent::ImageAvailable(_) => "image_available",
        }
    }
}

/// Thread-safe sink for hardware callbacks of one capture request
#[derive(Debug, Clone)]
pub struct CameraEventSender {
    tx: mpsc::UnboundedSender<CameraEvent>,
}

impl CameraEventSender {
    pub fn new(tx: mpsc::UnboundedSender<CameraEvent>) -> Self {
        Self { tx }
    }

    /// Deliver an event; returns false once the request has finished
    pub fn emit(&self, event: CameraEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Camera hardware as seen by the capture state machine
pub trait CameraBackend: Send + Sync {
    fn cameras(&self) -> Result<Vec<CameraInfo>, CameraError>;

    /// Current display rotation of the device, degrees (0/90/180/270)
    fn device_rotation(&self) -> u32 {
        0
    }

    /// Single-image JPEG reader sized for `camera`; emits `ImageAvailable`
    fn create_image_reader(
        &self,
        camera: &CameraInfo,
        events: CameraEventSender,
    ) -> Result<ReaderHandle, CameraError>;

    /// Emits `DeviceOpened`, later `DeviceDisconnected`/`DeviceError`
    fn open_device(
        &self,
        camera_id: &str,
        events: CameraEventSender,
    ) -> Result<DeviceHandle, CameraError>;

    /// Single-surface session; emits `SessionConfigured`/`SessionConfigureFailed`
    fn create_session(&self, device: DeviceHandle, reader: ReaderHandle) -> Result<(), CameraError>;

    /// AF trigger; emits `CaptureProgress`
    fn submit_focus_lock(&self, session: SessionHandle) -> Result<(), CameraError>;

    /// AE precapture trigger; emits `CaptureProgress`
    fn submit_precapture(&self, session: SessionHandle) -> Result<(), CameraError>;

    /// Emits `StillCaptureCompleted`/`StillCaptureFailed` and `ImageAvailable`
    fn submit_still_capture(
        &self,
        session: SessionHandle,
        reader: ReaderHandle,
        jpeg_orientation: u32,
    ) -> Result<(), CameraError>;

    fn close_session(&self, session: SessionHandle) -> Result<(), CameraError>;
    fn close_device(&self, device: DeviceHandle) -> Result<(), CameraError>;
    fn close_reader(&self, reader: ReaderHandle) -> Result<(), CameraError>;
}

/// Preferred id if enumerated, else first rear camera, else first camera
pub fn select_camera(cameras: &[CameraInfo], preferred: Option<&str>) -> Option<CameraInfo> {
    preferred
        .and_then(|id| cameras.iter().find(|c| c.id == id))
        .or_else(|| cameras.iter().find(|c| c.facing == LensFacing::Back))
        .or_else(|| cameras.first())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cameras() -> Vec<CameraInfo> {
        vec![
            CameraInfo::new("1", LensFacing::Front, 270),
            CameraInfo::new("0", LensFacing::Back, 90),
            CameraInfo::new("2", LensFacing::Back, 90),
        ]
    }

    #[test]
    fn test_select_preferred_camera() {
        assert_eq!(select_camera(&cameras(), Some("2")).unwrap().id, "2");
    }

    #[test]
    fn test_unknown_preference_falls_back_to_rear() {
        assert_eq!(select_camera(&cameras(), Some("9")).unwrap().id, "0");
        assert_eq!(select_camera(&cameras(), None).unwrap().id, "0");
    }

    #[test]
    fn test_falls_back_to_first_without_rear() {
        let list = vec![
            CameraInfo::new("5", LensFacing::External, 0),
            CameraInfo::new("1", LensFacing::Front, 270),
        ];
        assert_eq!(select_camera(&list, None).unwrap().id, "5");
    }

    #[test]
    fn test_empty_enumeration_selects_nothing() {
        assert!(select_camera(&[], Some("0")).is_none());
    }

    #[test]
    fn test_af_settled_states() {
        assert!(AfState::FocusedLocked.is_settled());
        assert!(AfState::NotFocusedLocked.is_settled());
        assert!(!AfState::ActiveScan.is_settled());
    }
}
