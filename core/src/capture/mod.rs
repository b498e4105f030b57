//! Still capture pipeline
//!
//! - `camera`: hardware backend trait and callback events
//! - `orientation`: JPEG orientation policy
//! - `session`: the per-request state machine and exclusivity lock
//! - `coordinator`: post-capture steps shared by every trigger

pub mod camera;
pub mod coordinator;
pub mod orientation;
pub mod session;

pub use camera::{
    select_camera, AeState, AfState, CameraBackend, CameraError, CameraEvent, CameraEventSender,
    CameraInfo, DeviceHandle, LensFacing, ReaderHandle, SessionHandle,
};
pub use coordinator::{
    CaptureAcknowledger, CaptureCoordinator, CaptureTrigger, DirectoryImageSink, ImageSink,
    StatusReporter,
};
pub use orientation::{compute_jpeg_orientation, snap_rotation, ForcedOrientation, OrientationPolicy};
pub use session::{
    CaptureConfig, CaptureEngine, CaptureParams, CaptureResult, CaptureState, ConvergenceGate,
};
