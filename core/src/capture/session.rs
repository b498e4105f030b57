// Capture Session State Machine
//
// One `CaptureSession` per request, driven by a single task that consumes
// hardware callbacks from a channel. The engine's binary semaphore admits at
// most one session process-wide; the permit travels with the session task
// and is released only after teardown.

use super::camera::{
    select_camera, AeState, AfState, CameraBackend, CameraError, CameraEvent, CameraEventSender,
    CameraInfo, DeviceHandle, ReaderHandle, SessionHandle,
};
use super::orientation::{compute_jpeg_orientation, OrientationPolicy};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;

/// Which metadata gates the final still capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceGate {
    /// Capture once auto-focus has settled (locked or failed to lock)
    #[default]
    FocusLock,
    /// After focus, run the AE precapture sequence unless AE already converged
    Precapture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    OpeningDevice,
    ConfiguringSession,
    LockingFocus,
    AwaitingPrecapture,
    AwaitingNonPrecapture,
    CapturingStill,
    Complete,
}

/// What to capture and how
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureParams {
    pub preferred_camera: Option<String>,
    pub orientation: OrientationPolicy,
    pub gate: ConvergenceGate,
}

/// Outcome of one capture request; failures carry no detail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub success: bool,
    pub image: Option<Vec<u8>>,
}

impl CaptureResult {
    pub fn captured(image: Vec<u8>) -> Self {
        Self {
            success: true,
            image: Some(image),
        }
    }

    pub fn failed() -> Self {
        Self {
            success: false,
            image: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Longest wait for the exclusivity lock before rejecting
    pub lock_timeout: Duration,
    /// Longest the whole hardware sequence may run
    pub hardware_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(3),
            hardware_timeout: Duration::from_secs(15),
        }
    }
}

/// Entry point for still captures; cheap to clone
#[derive(Clone)]
pub struct CaptureEngine {
    backend: Arc<dyn CameraBackend>,
    lock: Arc<Semaphore>,
    config: CaptureConfig,
}

impl CaptureEngine {
    pub fn new(backend: Arc<dyn CameraBackend>, config: CaptureConfig) -> Self {
        Self {
            backend,
            lock: Arc::new(Semaphore::new(1)),
            config,
        }
    }

    pub fn cameras(&self) -> Result<Vec<CameraInfo>, CameraError> {
        self.backend.cameras()
    }

    /// True while a capture holds the exclusivity lock
    pub fn is_busy(&self) -> bool {
        self.lock.available_permits() == 0
    }

    /// Run one capture to completion.
    ///
    /// Rejected with a failed result if another capture still holds the lock
    /// after `lock_timeout`. The hardware sequence runs on its own task, so
    /// dropping this future does not abandon acquired resources.
    pub async fn begin_capture(&self, params: CaptureParams) -> CaptureResult {
        let acquire = Arc::clone(&self.lock).acquire_owned();
        let permit = match tokio::time::timeout(self.config.lock_timeout, acquire).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                tracing::error!("Capture lock closed");
                return CaptureResult::failed();
            }
            Err(_) => {
                tracing::warn!(
                    "Capture already in progress, rejected after {:?}",
                    self.config.lock_timeout
                );
                return CaptureResult::failed();
            }
        };

        let session = CaptureSession::new(
            Arc::clone(&self.backend),
            params,
            self.config.hardware_timeout,
        );
        let (result_tx, result_rx) = oneshot::channel();
        tokio::spawn(async move {
            let result = session.run().await;
            drop(permit);
            let _ = result_tx.send(result);
        });

        result_rx.await.unwrap_or_else(|_| {
            tracing::error!("Capture task ended without a result");
            CaptureResult::failed()
        })
    }
}

/// Hardware resources of one request, closed in session → device → reader
/// order. Dropping releases anything still open.
struct Resources {
    backend: Arc<dyn CameraBackend>,
    session: Option<SessionHandle>,
    device: Option<DeviceHandle>,
    reader: Option<ReaderHandle>,
}

impl Resources {
    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = self.backend.close_session(session) {
                tracing::warn!("Failed to close capture session: {}", e);
            }
        }
        if let Some(device) = self.device.take() {
            if let Err(e) = self.backend.close_device(device) {
                tracing::warn!("Failed to close camera device: {}", e);
            }
        }
        if let Some(reader) = self.reader.take() {
            if let Err(e) = self.backend.close_reader(reader) {
                tracing::warn!("Failed to close image reader: {}", e);
            }
        }
    }
}

impl Drop for Resources {
    fn drop(&mut self) {
        self.release();
    }
}

struct CaptureSession {
    backend: Arc<dyn CameraBackend>,
    params: CaptureParams,
    hardware_timeout: Duration,
    state: CaptureState,
    camera: Option<CameraInfo>,
    resources: Resources,
    still_completed: bool,
    image: Option<Vec<u8>>,
}

impl CaptureSession {
    fn new(backend: Arc<dyn CameraBackend>, params: CaptureParams, hardware_timeout: Duration) -> Self {
        let resources = Resources {
            backend: Arc::clone(&backend),
            session: None,
            device: None,
            reader: None,
        };
        Self {
            backend,
            params,
            hardware_timeout,
            state: CaptureState::Idle,
            camera: None,
            resources,
            still_completed: false,
            image: None,
        }
    }

    async fn run(mut self) -> CaptureResult {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = match self.start(CameraEventSender::new(tx)) {
            Ok(()) => self.drive(&mut rx).await,
            Err(e) => Err(e),
        };

        let failed_in = self.state;
        self.resources.release();
        self.transition(CaptureState::Complete);
        rx.close();

        match outcome {
            Ok(image) => {
                tracing::info!("Capture complete ({} bytes)", image.len());
                CaptureResult::captured(image)
            }
            Err(e) => {
                tracing::warn!("Capture failed in {:?}: {}", failed_in, e);
                CaptureResult::failed()
            }
        }
    }

    fn start(&mut self, events: CameraEventSender) -> Result<(), CameraError> {
        let cameras = self.backend.cameras()?;
        let camera = select_camera(&cameras, self.params.preferred_camera.as_deref())
            .ok_or(CameraError::NoCamera)?;
        tracing::info!(camera_id = %camera.id, "Starting capture on {}", camera);

        self.resources.reader = Some(self.backend.create_image_reader(&camera, events.clone())?);
        self.transition(CaptureState::OpeningDevice);
        self.resources.device = Some(self.backend.open_device(&camera.id, events)?);
        self.camera = Some(camera);
        Ok(())
    }

    async fn drive(
        &mut self,
        rx: &mut mpsc::UnboundedReceiver<CameraEvent>,
    ) -> Result<Vec<u8>, CameraError> {
        let deadline = Instant::now() + self.hardware_timeout;
        loop {
            let event = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(CameraError::Device("backend dropped the event channel".into()))
                }
                Err(_) => {
                    return Err(CameraError::Device(format!(
                        "no hardware response within {:?}",
                        self.hardware_timeout
                    )))
                }
            };
            if let Some(image) = self.on_event(event)? {
                return Ok(image);
            }
        }
    }

    fn on_event(&mut self, event: CameraEvent) -> Result<Option<Vec<u8>>, CameraError> {
        use CaptureState::*;

        match (self.state, event) {
            (_, CameraEvent::DeviceDisconnected) => {
                Err(CameraError::Device("camera disconnected".into()))
            }
            (_, CameraEvent::DeviceError(reason)) => Err(CameraError::Device(reason)),

            (OpeningDevice, CameraEvent::DeviceOpened) => {
                let (Some(device), Some(reader)) = (self.resources.device, self.resources.reader)
                else {
                    return Err(CameraError::Device("device opened without handles".into()));
                };
                self.transition(ConfiguringSession);
                self.backend.create_session(device, reader)?;
                Ok(None)
            }

            (ConfiguringSession, CameraEvent::SessionConfigured(session)) => {
                self.resources.session = Some(session);
                self.transition(LockingFocus);
                self.backend.submit_focus_lock(session)?;
                Ok(None)
            }
            (ConfiguringSession, CameraEvent::SessionConfigureFailed(reason)) => {
                Err(CameraError::Configure(reason))
            }

            (LockingFocus, CameraEvent::CaptureProgress { af_state, ae_state }) => {
                self.on_focus_progress(af_state, ae_state)
            }
            (AwaitingPrecapture, CameraEvent::CaptureProgress { ae_state, .. }) => {
                if matches!(
                    ae_state,
                    None | Some(AeState::Precapture) | Some(AeState::FlashRequired)
                ) {
                    self.transition(AwaitingNonPrecapture);
                }
                Ok(None)
            }
            (AwaitingNonPrecapture, CameraEvent::CaptureProgress { ae_state, .. }) => {
                if ae_state != Some(AeState::Precapture) {
                    self.capture_still()?;
                }
                Ok(None)
            }

            (CapturingStill, CameraEvent::StillCaptureCompleted) => {
                self.still_completed = true;
                Ok(self.try_finish())
            }
            (CapturingStill, CameraEvent::StillCaptureFailed(reason)) => {
                Err(CameraError::Capture(reason))
            }
            (CapturingStill, CameraEvent::ImageAvailable(Some(image))) => {
                self.image = Some(image);
                Ok(self.try_finish())
            }
            (CapturingStill, CameraEvent::ImageAvailable(None)) => {
                Err(CameraError::Capture("image unavailable".into()))
            }

            (state, event) => {
                tracing::debug!("Ignoring {} in {:?}", event.name(), state);
                Ok(None)
            }
        }
    }

    fn on_focus_progress(
        &mut self,
        af_state: Option<AfState>,
        ae_state: Option<AeState>,
    ) -> Result<Option<Vec<u8>>, CameraError> {
        // A missing AF field means the camera has no auto-focus
        if af_state.is_some_and(|af| !af.is_settled()) {
            return Ok(None);
        }

        match self.params.gate {
            ConvergenceGate::FocusLock => self.capture_still()?,
            ConvergenceGate::Precapture => match ae_state {
                None | Some(AeState::Converged) | Some(AeState::FlashRequired) => {
                    self.capture_still()?
                }
                Some(_) => {
                    let Some(session) = self.resources.session else {
                        return Err(CameraError::Device("no session for precapture".into()));
                    };
                    self.transition(CaptureState::AwaitingPrecapture);
                    self.backend.submit_precapture(session)?;
                }
            },
        }
        Ok(None)
    }

    fn capture_still(&mut self) -> Result<(), CameraError> {
        let (Some(session), Some(reader), Some(camera)) =
            (self.resources.session, self.resources.reader, self.camera.as_ref())
        else {
            return Err(CameraError::Device("session not ready for still capture".into()));
        };

        let device_rotation = self.backend.device_rotation();
        let jpeg_orientation =
            compute_jpeg_orientation(&self.params.orientation, camera, device_rotation);
        tracing::debug!(
            "Sensor: {}, device: {}, JPEG orientation: {}",
            camera.sensor_orientation,
            device_rotation,
            jpeg_orientation
        );

        self.transition(CaptureState::CapturingStill);
        self.backend
            .submit_still_capture(session, reader, jpeg_orientation)
    }

    /// Done once both the completion callback and the image have arrived
    fn try_finish(&mut self) -> Option<Vec<u8>> {
        if self.still_completed && self.image.is_some() {
            self.image.take()
        } else {
            None
        }
    }

    fn transition(&mut self, next: CaptureState) {
        if self.state != next {
            tracing::trace!("Capture state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::LensFacing;
    use crate::capture::orientation::ForcedOrientation;
    use parking_lot::Mutex;

    /// Backend that answers every submission immediately from a script
    #[derive(Default)]
    struct ScriptedBackend {
        cameras: Vec<CameraInfo>,
        fail_open: bool,
        configure_fails: bool,
        silent_device: bool,
        focus_progress: Vec<(Option<AfState>, Option<AeState>)>,
        precapture_progress: Vec<Option<AeState>>,
        image: Option<Vec<u8>>,
        fail_close_session: bool,
        events: Mutex<Option<CameraEventSender>>,
        calls: Mutex<Vec<String>>,
        orientations: Mutex<Vec<u32>>,
    }

    impl ScriptedBackend {
        fn happy() -> Self {
            Self {
                cameras: vec![
                    CameraInfo::new("1", LensFacing::Front, 270),
                    CameraInfo::new("0", LensFacing::Back, 90),
                ],
                focus_progress: vec![
                    (Some(AfState::ActiveScan), Some(AeState::Searching)),
                    (Some(AfState::FocusedLocked), Some(AeState::Searching)),
                ],
                precapture_progress: vec![
                    Some(AeState::Precapture),
                    Some(AeState::Precapture),
                    Some(AeState::Converged),
                ],
                image: Some(vec![0xFF, 0xD8, 0xFF]),
                ..Default::default()
            }
        }

        fn emit(&self, event: CameraEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                events.emit(event);
            }
        }

        fn record(&self, call: &str) {
            self.calls.lock().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl CameraBackend for ScriptedBackend {
        fn cameras(&self) -> Result<Vec<CameraInfo>, CameraError> {
            Ok(self.cameras.clone())
        }

        fn device_rotation(&self) -> u32 {
            90
        }

        fn create_image_reader(
            &self,
            _camera: &CameraInfo,
            events: CameraEventSender,
        ) -> Result<ReaderHandle, CameraError> {
            self.record("create_reader");
            *self.events.lock() = Some(events);
            Ok(ReaderHandle(3))
        }

        fn open_device(
            &self,
            camera_id: &str,
            _events: CameraEventSender,
        ) -> Result<DeviceHandle, CameraError> {
            self.record(&format!("open:{}", camera_id));
            if self.fail_open {
                return Err(CameraError::Access("in use".into()));
            }
            if !self.silent_device {
                self.emit(CameraEvent::DeviceOpened);
            }
            Ok(DeviceHandle(1))
        }

        fn create_session(&self, _device: DeviceHandle, _reader: ReaderHandle) -> Result<(), CameraError> {
            self.record("create_session");
            if self.configure_fails {
                self.emit(CameraEvent::SessionConfigureFailed("bad surface".into()));
            } else {
                self.emit(CameraEvent::SessionConfigured(SessionHandle(2)));
            }
            Ok(())
        }

        fn submit_focus_lock(&self, _session: SessionHandle) -> Result<(), CameraError> {
            self.record("focus_lock");
            for (af_state, ae_state) in &self.focus_progress {
                self.emit(CameraEvent::CaptureProgress {
                    af_state: *af_state,
                    ae_state: *ae_state,
                });
            }
            Ok(())
        }

        fn submit_precapture(&self, _session: SessionHandle) -> Result<(), CameraError> {
            self.record("precapture");
            for ae_state in &self.precapture_progress {
                self.emit(CameraEvent::CaptureProgress {
                    af_state: Some(AfState::FocusedLocked),
                    ae_state: *ae_state,
                });
            }
            Ok(())
        }

        fn submit_still_capture(
            &self,
            _session: SessionHandle,
            _reader: ReaderHandle,
            jpeg_orientation: u32,
        ) -> Result<(), CameraError> {
            self.record("still");
            self.orientations.lock().push(jpeg_orientation);
            self.emit(CameraEvent::ImageAvailable(self.image.clone()));
            self.emit(CameraEvent::StillCaptureCompleted);
            Ok(())
        }

        fn close_session(&self, _session: SessionHandle) -> Result<(), CameraError> {
            self.record("close_session");
            if self.fail_close_session {
                return Err(CameraError::Close("session busy".into()));
            }
            Ok(())
        }

        fn close_device(&self, _device: DeviceHandle) -> Result<(), CameraError> {
            self.record("close_device");
            Ok(())
        }

        fn close_reader(&self, _reader: ReaderHandle) -> Result<(), CameraError> {
            self.record("close_reader");
            Ok(())
        }
    }

    fn engine(backend: Arc<ScriptedBackend>) -> CaptureEngine {
        CaptureEngine::new(backend, CaptureConfig::default())
    }

    #[tokio::test]
    async fn test_focus_lock_capture_succeeds() {
        let backend = Arc::new(ScriptedBackend::happy());
        let result = engine(backend.clone())
            .begin_capture(CaptureParams::default())
            .await;

        assert!(result.success);
        assert_eq!(result.image, Some(vec![0xFF, 0xD8, 0xFF]));
        assert_eq!(
            backend.calls(),
            vec![
                "create_reader",
                "open:0",
                "create_session",
                "focus_lock",
                "still",
                "close_session",
                "close_device",
                "close_reader",
            ]
        );
        // Rear camera, sensor 90, device rotated 90
        assert_eq!(*backend.orientations.lock(), vec![180]);
    }

    #[tokio::test]
    async fn test_precapture_gate_runs_sequence() {
        let backend = Arc::new(ScriptedBackend::happy());
        let params = CaptureParams {
            gate: ConvergenceGate::Precapture,
            ..Default::default()
        };
        let result = engine(backend.clone()).begin_capture(params).await;

        assert!(result.success);
        let calls = backend.calls();
        let precapture = calls.iter().position(|c| c == "precapture").unwrap();
        let still = calls.iter().position(|c| c == "still").unwrap();
        assert!(precapture < still);
    }

    #[tokio::test]
    async fn test_precapture_skipped_when_exposure_converged() {
        let backend = Arc::new(ScriptedBackend {
            focus_progress: vec![(Some(AfState::NotFocusedLocked), Some(AeState::Converged))],
            ..ScriptedBackend::happy()
        });
        let params = CaptureParams {
            gate: ConvergenceGate::Precapture,
            ..Default::default()
        };
        let result = engine(backend.clone()).begin_capture(params).await;

        assert!(result.success);
        assert!(!backend.calls().contains(&"precapture".to_string()));
    }

    #[tokio::test]
    async fn test_forced_orientation_applied() {
        let backend = Arc::new(ScriptedBackend::happy());
        let params = CaptureParams {
            orientation: OrientationPolicy {
                auto_rotate: false,
                forced: ForcedOrientation::LandscapeReversed,
            },
            ..Default::default()
        };
        engine(backend.clone()).begin_capture(params).await;
        assert_eq!(*backend.orientations.lock(), vec![180]);
    }

    #[tokio::test]
    async fn test_preferred_camera_used() {
        let backend = Arc::new(ScriptedBackend::happy());
        let params = CaptureParams {
            preferred_camera: Some("1".into()),
            ..Default::default()
        };
        engine(backend.clone()).begin_capture(params).await;
        assert!(backend.calls().contains(&"open:1".to_string()));
        // Front camera, sensor 270, device rotated 90
        assert_eq!(*backend.orientations.lock(), vec![180]);
    }

    #[tokio::test]
    async fn test_no_camera_fails_without_resources() {
        let backend = Arc::new(ScriptedBackend::default());
        let result = engine(backend.clone())
            .begin_capture(CaptureParams::default())
            .await;

        assert_eq!(result, CaptureResult::failed());
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_open_failure_releases_reader() {
        let backend = Arc::new(ScriptedBackend {
            fail_open: true,
            ..ScriptedBackend::happy()
        });
        let result = engine(backend.clone())
            .begin_capture(CaptureParams::default())
            .await;

        assert!(!result.success);
        assert_eq!(backend.calls(), vec!["create_reader", "open:0", "close_reader"]);
    }

    #[tokio::test]
    async fn test_configure_failure_tears_down() {
        let backend = Arc::new(ScriptedBackend {
            configure_fails: true,
            ..ScriptedBackend::happy()
        });
        let engine = engine(backend.clone());
        let result = engine.begin_capture(CaptureParams::default()).await;

        assert!(!result.success);
        assert!(!engine.is_busy());
        let calls = backend.calls();
        assert_eq!(&calls[calls.len() - 2..], &["close_device", "close_reader"]);
    }

    #[tokio::test]
    async fn test_missing_image_is_failure() {
        let backend = Arc::new(ScriptedBackend {
            image: None,
            ..ScriptedBackend::happy()
        });
        let result = engine(backend)
            .begin_capture(CaptureParams::default())
            .await;
        assert_eq!(result, CaptureResult::failed());
    }

    #[tokio::test]
    async fn test_close_failure_still_releases_lock() {
        let backend = Arc::new(ScriptedBackend {
            fail_close_session: true,
            ..ScriptedBackend::happy()
        });
        let engine = engine(backend.clone());
        let first = engine.begin_capture(CaptureParams::default()).await;
        assert!(first.success);
        assert!(!engine.is_busy());

        let calls = backend.calls();
        assert_eq!(
            &calls[calls.len() - 3..],
            &["close_session", "close_device", "close_reader"]
        );

        let second = engine.begin_capture(CaptureParams::default()).await;
        assert!(second.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_hardware_hits_watchdog() {
        let backend = Arc::new(ScriptedBackend {
            silent_device: true,
            ..ScriptedBackend::happy()
        });
        let engine = engine(backend.clone());
        let started = Instant::now();
        let result = engine.begin_capture(CaptureParams::default()).await;

        assert!(!result.success);
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert!(!engine.is_busy());
        assert!(backend.calls().contains(&"close_device".to_string()));
    }
}
