// backcam-mobile: native bindings for the Android host
//
// Exposes the agent through UniFFI. The host implements `MobileCameraBridge`
// on top of the platform camera API and feeds hardware callbacks back through
// the `CameraEventSink` it receives. Everything else (connection, capture
// state machine, scheduling, upload) runs in Rust.

use backcam_core::capture::{
    snap_rotation, AeState, AfState, CaptureAcknowledger, ConvergenceGate, DeviceHandle,
    ReaderHandle, SessionHandle,
};
use backcam_core::{
    AgentError, AgentService, AgentSettings, CameraBackend, CameraError, CameraEvent,
    CameraEventSender, CameraInfo, CaptureResult, CaptureTrigger, ConnectionState,
    ConnectionStatus, DirectoryImageSink, ForcedOrientation, HttpPhotoUploader, LensFacing,
    SessionStore, SettingsStore, SledStorage, StatusListener, StorageBackend,
};
use std::sync::Arc;
use thiserror::Error;

uniffi::setup_scaffolding!();

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, uniffi::Error)]
#[uniffi(flat_error)]
pub enum MobileError {
    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Host callback failed: {0}")]
    Callback(String),
}

impl From<AgentError> for MobileError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Settings(e) => MobileError::InvalidSettings(e.to_string()),
            AgentError::Store(e) => MobileError::Storage(e.to_string()),
            AgentError::Camera(e) => MobileError::Camera(e.to_string()),
        }
    }
}

impl From<uniffi::UnexpectedUniFFICallbackError> for MobileError {
    fn from(err: uniffi::UnexpectedUniFFICallbackError) -> Self {
        MobileError::Callback(err.reason)
    }
}

// ============================================================================
// RECORDS & ENUMS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileLensFacing {
    Back,
    Front,
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct MobileCameraInfo {
    pub id: String,
    pub facing: MobileLensFacing,
    pub sensor_orientation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileOrientation {
    Portrait,
    PortraitReversed,
    Landscape,
    LandscapeReversed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileConvergenceGate {
    FocusLock,
    Precapture,
}

/// Host-editable settings; reconnect tuning stays on the Rust side
#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct MobileSettings {
    pub capture_interval_secs: u32,
    pub selected_camera_id: Option<String>,
    pub storage_public: bool,
    pub show_acknowledgment: bool,
    pub auto_rotate: bool,
    pub forced_orientation: MobileOrientation,
    pub convergence_gate: MobileConvergenceGate,
    pub server_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct MobileConnectionStatus {
    pub state: MobileConnectionState,
    /// Seconds until the next reconnect attempt, if one is scheduled
    pub retry_in_secs: Option<u64>,
    pub label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileCaptureTrigger {
    Scheduled,
    Remote,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, uniffi::Record)]
pub struct MobileCaptureResult {
    pub success: bool,
    pub image: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileAfState {
    Inactive,
    PassiveScan,
    PassiveFocused,
    PassiveUnfocused,
    ActiveScan,
    FocusedLocked,
    NotFocusedLocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, uniffi::Enum)]
pub enum MobileAeState {
    Inactive,
    Searching,
    Converged,
    Locked,
    FlashRequired,
    Precapture,
}

// ===== Conversions =====

impl From<LensFacing> for MobileLensFacing {
    fn from(facing: LensFacing) -> Self {
        match facing {
            LensFacing::Back => Self::Back,
            LensFacing::Front => Self::Front,
            LensFacing::External => Self::External,
        }
    }
}

impl From<MobileLensFacing> for LensFacing {
    fn from(facing: MobileLensFacing) -> Self {
        match facing {
            MobileLensFacing::Back => Self::Back,
            MobileLensFacing::Front => Self::Front,
            MobileLensFacing::External => Self::External,
        }
    }
}

impl From<CameraInfo> for MobileCameraInfo {
    fn from(info: CameraInfo) -> Self {
        Self {
            id: info.id,
            facing: info.facing.into(),
            sensor_orientation: info.sensor_orientation,
        }
    }
}

impl From<MobileCameraInfo> for CameraInfo {
    fn from(info: MobileCameraInfo) -> Self {
        CameraInfo::new(info.id, info.facing.into(), info.sensor_orientation)
    }
}

impl From<ForcedOrientation> for MobileOrientation {
    fn from(orientation: ForcedOrientation) -> Self {
        match orientation {
            ForcedOrientation::Portrait => Self::Portrait,
            ForcedOrientation::PortraitReversed => Self::PortraitReversed,
            ForcedOrientation::Landscape => Self::Landscape,
            ForcedOrientation::LandscapeReversed => Self::LandscapeReversed,
        }
    }
}

impl From<MobileOrientation> for ForcedOrientation {
    fn from(orientation: MobileOrientation) -> Self {
        match orientation {
            MobileOrientation::Portrait => Self::Portrait,
            MobileOrientation::PortraitReversed => Self::PortraitReversed,
            MobileOrientation::Landscape => Self::Landscape,
            MobileOrientation::LandscapeReversed => Self::LandscapeReversed,
        }
    }
}

impl From<ConvergenceGate> for MobileConvergenceGate {
    fn from(gate: ConvergenceGate) -> Self {
        match gate {
            ConvergenceGate::FocusLock => Self::FocusLock,
            ConvergenceGate::Precapture => Self::Precapture,
        }
    }
}

impl From<MobileConvergenceGate> for ConvergenceGate {
    fn from(gate: MobileConvergenceGate) -> Self {
        match gate {
            MobileConvergenceGate::FocusLock => Self::FocusLock,
            MobileConvergenceGate::Precapture => Self::Precapture,
        }
    }
}

impl From<&AgentSettings> for MobileSettings {
    fn from(settings: &AgentSettings) -> Self {
        Self {
            capture_interval_secs: settings.capture_interval_secs,
            selected_camera_id: settings.selected_camera_id.clone(),
            storage_public: settings.storage_public,
            show_acknowledgment: settings.show_acknowledgment,
            auto_rotate: settings.auto_rotate,
            forced_orientation: settings.forced_orientation.into(),
            convergence_gate: settings.convergence_gate.into(),
            server_url: settings.server_url.clone(),
        }
    }
}

impl MobileSettings {
    /// Overlay onto `base`, keeping fields the host does not edit
    fn apply_to(self, base: &AgentSettings) -> AgentSettings {
        AgentSettings {
            capture_interval_secs: self.capture_interval_secs,
            selected_camera_id: self.selected_camera_id.filter(|id| !id.is_empty()),
            storage_public: self.storage_public,
            show_acknowledgment: self.show_acknowledgment,
            auto_rotate: self.auto_rotate,
            forced_orientation: self.forced_orientation.into(),
            convergence_gate: self.convergence_gate.into(),
            server_url: self.server_url,
            reconnect: base.reconnect,
        }
    }
}

impl From<ConnectionStatus> for MobileConnectionStatus {
    fn from(status: ConnectionStatus) -> Self {
        let state = match status.state {
            ConnectionState::Disconnected => MobileConnectionState::Disconnected,
            ConnectionState::Connecting => MobileConnectionState::Connecting,
            ConnectionState::Connected => MobileConnectionState::Connected,
        };
        Self {
            state,
            retry_in_secs: status.retry_in.map(|d| d.as_secs()),
            label: status.label(),
        }
    }
}

impl From<MobileCaptureTrigger> for CaptureTrigger {
    fn from(trigger: MobileCaptureTrigger) -> Self {
        match trigger {
            MobileCaptureTrigger::Scheduled => Self::Scheduled,
            MobileCaptureTrigger::Remote => Self::Remote,
            MobileCaptureTrigger::Manual => Self::Manual,
        }
    }
}

impl From<CaptureTrigger> for MobileCaptureTrigger {
    fn from(trigger: CaptureTrigger) -> Self {
        match trigger {
            CaptureTrigger::Scheduled => Self::Scheduled,
            CaptureTrigger::Remote => Self::Remote,
            CaptureTrigger::Manual => Self::Manual,
        }
    }
}

impl From<CaptureResult> for MobileCaptureResult {
    fn from(result: CaptureResult) -> Self {
        Self {
            success: result.success,
            image: result.image,
        }
    }
}

impl From<MobileAfState> for AfState {
    fn from(state: MobileAfState) -> Self {
        match state {
            MobileAfState::Inactive => Self::Inactive,
            MobileAfState::PassiveScan => Self::PassiveScan,
            MobileAfState::PassiveFocused => Self::PassiveFocused,
            MobileAfState::PassiveUnfocused => Self::PassiveUnfocused,
            MobileAfState::ActiveScan => Self::ActiveScan,
            MobileAfState::FocusedLocked => Self::FocusedLocked,
            MobileAfState::NotFocusedLocked => Self::NotFocusedLocked,
        }
    }
}

impl From<MobileAeState> for AeState {
    fn from(state: MobileAeState) -> Self {
        match state {
            MobileAeState::Inactive => Self::Inactive,
            MobileAeState::Searching => Self::Searching,
            MobileAeState::Converged => Self::Converged,
            MobileAeState::Locked => Self::Locked,
            MobileAeState::FlashRequired => Self::FlashRequired,
            MobileAeState::Precapture => Self::Precapture,
        }
    }
}

// ============================================================================
// CAMERA BRIDGE
// ============================================================================

/// Camera hardware implemented by the host.
///
/// Every call only submits work; outcomes go to the `CameraEventSink`
/// passed to `create_image_reader` and `open_device`, from any thread.
#[uniffi::export(with_foreign)]
pub trait MobileCameraBridge: Send + Sync {
    fn cameras(&self) -> Vec<MobileCameraInfo>;
    /// Current orientation-sensor reading in degrees, negative when unknown
    fn device_rotation(&self) -> i32;
    fn create_image_reader(
        &self,
        camera: MobileCameraInfo,
        sink: Arc<CameraEventSink>,
    ) -> Result<u64, MobileError>;
    fn open_device(&self, camera_id: String, sink: Arc<CameraEventSink>) -> Result<u64, MobileError>;
    fn create_session(&self, device: u64, reader: u64) -> Result<(), MobileError>;
    fn submit_focus_lock(&self, session: u64) -> Result<(), MobileError>;
    fn submit_precapture(&self, session: u64) -> Result<(), MobileError>;
    fn submit_still_capture(
        &self,
        session: u64,
        reader: u64,
        jpeg_orientation: u32,
    ) -> Result<(), MobileError>;
    fn close_session(&self, session: u64) -> Result<(), MobileError>;
    fn close_device(&self, device: u64) -> Result<(), MobileError>;
    fn close_reader(&self, reader: u64) -> Result<(), MobileError>;
}

/// Hardware callbacks of one capture request
#[derive(uniffi::Object)]
pub struct CameraEventSink {
    sender: CameraEventSender,
}

impl CameraEventSink {
    fn new(sender: CameraEventSender) -> Arc<Self> {
        Arc::new(Self { sender })
    }

    fn emit(&self, event: CameraEvent) -> bool {
        let name = event.name();
        let delivered = self.sender.emit(event);
        if !delivered {
            tracing::debug!("Late camera callback {} dropped", name);
        }
        delivered
    }
}

/// Each method returns false once the request has already finished
#[uniffi::export]
impl CameraEventSink {
    pub fn device_opened(&self) -> bool {
        self.emit(CameraEvent::DeviceOpened)
    }

    pub fn device_disconnected(&self) -> bool {
        self.emit(CameraEvent::DeviceDisconnected)
    }

    pub fn device_error(&self, reason: String) -> bool {
        self.emit(CameraEvent::DeviceError(reason))
    }

    pub fn session_configured(&self, session: u64) -> bool {
        self.emit(CameraEvent::SessionConfigured(SessionHandle(session)))
    }

    pub fn session_configure_failed(&self, reason: String) -> bool {
        self.emit(CameraEvent::SessionConfigureFailed(reason))
    }

    pub fn capture_progress(
        &self,
        af_state: Option<MobileAfState>,
        ae_state: Option<MobileAeState>,
    ) -> bool {
        self.emit(CameraEvent::CaptureProgress {
            af_state: af_state.map(Into::into),
            ae_state: ae_state.map(Into::into),
        })
    }

    pub fn still_capture_completed(&self) -> bool {
        self.emit(CameraEvent::StillCaptureCompleted)
    }

    pub fn still_capture_failed(&self, reason: String) -> bool {
        self.emit(CameraEvent::StillCaptureFailed(reason))
    }

    pub fn image_available(&self, image: Option<Vec<u8>>) -> bool {
        self.emit(CameraEvent::ImageAvailable(image))
    }
}

/// Adapts the host bridge to the core camera backend
struct BridgeCamera {
    bridge: Arc<dyn MobileCameraBridge>,
}

fn camera_error(err: MobileError) -> CameraError {
    CameraError::Device(err.to_string())
}

impl CameraBackend for BridgeCamera {
    fn cameras(&self) -> Result<Vec<CameraInfo>, CameraError> {
        Ok(self.bridge.cameras().into_iter().map(Into::into).collect())
    }

    fn device_rotation(&self) -> u32 {
        snap_rotation(self.bridge.device_rotation())
    }

    fn create_image_reader(
        &self,
        camera: &CameraInfo,
        events: CameraEventSender,
    ) -> Result<ReaderHandle, CameraError> {
        self.bridge
            .create_image_reader(camera.clone().into(), CameraEventSink::new(events))
            .map(ReaderHandle)
            .map_err(camera_error)
    }

    fn open_device(
        &self,
        camera_id: &str,
        events: CameraEventSender,
    ) -> Result<DeviceHandle, CameraError> {
        self.bridge
            .open_device(camera_id.to_string(), CameraEventSink::new(events))
            .map(DeviceHandle)
            .map_err(|e| CameraError::Access(e.to_string()))
    }

    fn create_session(&self, device: DeviceHandle, reader: ReaderHandle) -> Result<(), CameraError> {
        self.bridge
            .create_session(device.0, reader.0)
            .map_err(|e| CameraError::Configure(e.to_string()))
    }

    fn submit_focus_lock(&self, session: SessionHandle) -> Result<(), CameraError> {
        self.bridge.submit_focus_lock(session.0).map_err(camera_error)
    }

    fn submit_precapture(&self, session: SessionHandle) -> Result<(), CameraError> {
        self.bridge.submit_precapture(session.0).map_err(camera_error)
    }

    fn submit_still_capture(
        &self,
        session: SessionHandle,
        reader: ReaderHandle,
        jpeg_orientation: u32,
    ) -> Result<(), CameraError> {
        self.bridge
            .submit_still_capture(session.0, reader.0, jpeg_orientation)
            .map_err(|e| CameraError::Capture(e.to_string()))
    }

    fn close_session(&self, session: SessionHandle) -> Result<(), CameraError> {
        self.bridge
            .close_session(session.0)
            .map_err(|e| CameraError::Close(e.to_string()))
    }

    fn close_device(&self, device: DeviceHandle) -> Result<(), CameraError> {
        self.bridge
            .close_device(device.0)
            .map_err(|e| CameraError::Close(e.to_string()))
    }

    fn close_reader(&self, reader: ReaderHandle) -> Result<(), CameraError> {
        self.bridge
            .close_reader(reader.0)
            .map_err(|e| CameraError::Close(e.to_string()))
    }
}

// ============================================================================
// STATUS LISTENER
// ============================================================================

/// Host callbacks for the service notification and capture feedback
#[uniffi::export(with_foreign)]
pub trait MobileStatusListener: Send + Sync {
    fn on_connection_status(&self, status: MobileConnectionStatus);
    /// Only called when acknowledgments are enabled in settings
    fn on_photo_captured(&self, trigger: MobileCaptureTrigger);
}

struct ListenerAdapter(Arc<dyn MobileStatusListener>);

impl StatusListener for ListenerAdapter {
    fn on_status(&self, status: ConnectionStatus) {
        self.0.on_connection_status(status.into());
    }
}

impl CaptureAcknowledger for ListenerAdapter {
    fn acknowledge(&self, trigger: CaptureTrigger) {
        self.0.on_photo_captured(trigger.into());
    }
}

// ============================================================================
// AGENT
// ============================================================================

/// Install a `tracing` subscriber; later calls are no-ops
#[uniffi::export]
pub fn init_logging(filter: String) {
    let env_filter = tracing_subscriber::EnvFilter::try_new(&filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(false)
        .try_init()
        .ok();
}

/// The agent as seen from the host's foreground service
#[derive(uniffi::Object)]
pub struct MobileAgent {
    runtime: tokio::runtime::Runtime,
    service: AgentService,
    sessions: Arc<SessionStore>,
}

#[uniffi::export]
impl MobileAgent {
    /// Open persistent state under `storage_path`; captured photos go to
    /// `private_dir` or `public_dir` per the storage setting.
    #[uniffi::constructor]
    pub fn new(
        storage_path: String,
        private_dir: String,
        public_dir: String,
        camera: Arc<dyn MobileCameraBridge>,
        listener: Option<Arc<dyn MobileStatusListener>>,
    ) -> Result<Arc<Self>, MobileError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .thread_name("backcam-agent")
            .build()
            .map_err(|e| MobileError::Runtime(e.to_string()))?;

        let backend: Arc<dyn StorageBackend> =
            Arc::new(SledStorage::new(&storage_path).map_err(MobileError::Storage)?);
        let sessions = Arc::new(SessionStore::new(backend.clone()));
        let settings_store = SettingsStore::new(backend.clone());
        let settings = settings_store
            .load()
            .map_err(|e| MobileError::InvalidSettings(e.to_string()))?;

        let uploader = {
            // The HTTP client binds to the runtime it is created in
            let _guard = runtime.enter();
            HttpPhotoUploader::new().map_err(|e| MobileError::Runtime(e.to_string()))?
        };

        let mut builder = AgentService::builder(
            settings,
            sessions.clone(),
            Arc::new(BridgeCamera { bridge: camera }),
        )
        .settings_store(SettingsStore::new(backend))
        .uploader(Arc::new(uploader))
        .image_sink(Arc::new(DirectoryImageSink::new(private_dir, public_dir)));
        if let Some(listener) = listener {
            let adapter = Arc::new(ListenerAdapter(listener));
            builder = builder
                .status_listener(adapter.clone())
                .acknowledger(adapter);
        }
        let service = builder.build()?;

        Ok(Arc::new(Self {
            runtime,
            service,
            sessions,
        }))
    }

    // ===== Identity =====

    pub fn device_id(&self) -> Result<String, MobileError> {
        self.sessions
            .device_id()
            .map_err(|e| MobileError::Storage(e.to_string()))
    }

    pub fn is_bound(&self) -> bool {
        self.sessions.is_bound().unwrap_or(false)
    }

    /// Record the token from the binding flow and reconnect with it
    pub fn save_device_binding(&self, device_token: String) -> Result<(), MobileError> {
        self.sessions
            .save_device_binding(&device_token)
            .map_err(|e| MobileError::Storage(e.to_string()))?;
        self.reconnect();
        Ok(())
    }

    pub fn save_user_session(&self, jwt: String, username: String) -> Result<(), MobileError> {
        self.sessions
            .save_user_session(&jwt, &username)
            .map_err(|e| MobileError::Storage(e.to_string()))
    }

    pub fn username(&self) -> Option<String> {
        self.sessions.username().ok().flatten()
    }

    /// Forget the account and binding, then drop the connection
    pub fn logout(&self) -> Result<(), MobileError> {
        self.sessions
            .logout()
            .map_err(|e| MobileError::Storage(e.to_string()))?;
        self.service.disconnect();
        Ok(())
    }

    // ===== Lifecycle =====

    pub fn initialize(&self) {
        let _guard = self.runtime.enter();
        self.service.initialize();
    }

    pub fn start_monitoring(&self) {
        let _guard = self.runtime.enter();
        self.service.start_monitoring();
    }

    pub fn stop_monitoring(&self) {
        let _guard = self.runtime.enter();
        self.service.stop_monitoring();
    }

    pub fn is_monitoring(&self) -> bool {
        self.service.lifecycle().is_monitoring()
    }

    pub fn is_running(&self) -> bool {
        self.service.lifecycle().is_running()
    }

    pub fn reconnect(&self) {
        let _guard = self.runtime.enter();
        self.service.reconnect();
    }

    pub fn disconnect(&self) {
        self.service.disconnect();
    }

    pub fn request_status(&self) -> MobileConnectionStatus {
        self.service.request_status().into()
    }

    pub fn shutdown(&self) {
        let _guard = self.runtime.enter();
        self.service.shutdown();
    }

    // ===== Settings =====

    pub fn settings(&self) -> MobileSettings {
        MobileSettings::from(&self.service.settings())
    }

    pub fn update_settings(&self, settings: MobileSettings) -> Result<(), MobileError> {
        let _guard = self.runtime.enter();
        let updated = settings.apply_to(&self.service.settings());
        self.service.settings_updated(updated)?;
        Ok(())
    }

    // ===== Capture =====

    pub fn cameras(&self) -> Result<Vec<MobileCameraInfo>, MobileError> {
        Ok(self
            .service
            .cameras()?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    /// Blocks the calling thread until the capture finishes; call it off the
    /// main thread.
    pub fn trigger_capture(&self, trigger: MobileCaptureTrigger) -> MobileCaptureResult {
        self.runtime
            .block_on(self.service.trigger_capture(trigger.into()))
            .into()
    }
}
