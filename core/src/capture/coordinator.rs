// Capture Coordinator: one entry point for scheduled, remote and manual captures
//
// Runs the capture through the engine (and so through its exclusivity lock),
// then the post-capture steps: acknowledgment, local copy, upload and a
// status report. None of those steps can turn a successful capture into a
// failure.

use super::session::{CaptureEngine, CaptureResult};
use crate::identity::IdentitySource;
use crate::settings::SharedSettings;
use crate::upload::{PhotoUploader, UploadRequest};
use chrono::{DateTime, Local, Utc};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureTrigger {
    Scheduled,
    Remote,
    Manual,
}

impl fmt::Display for CaptureTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled => write!(f, "scheduled"),
            Self::Remote => write!(f, "remote"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// User-visible "photo captured" signal, shown when enabled in settings
pub trait CaptureAcknowledger: Send + Sync {
    fn acknowledge(&self, trigger: CaptureTrigger);
}

/// Reports device status to the backend after a successful capture
pub trait StatusReporter: Send + Sync {
    fn report_status(&self);
}

/// Local persistence of captured stills
pub trait ImageSink: Send + Sync {
    /// Store `image`; `public` selects the shared gallery over private storage
    fn store(&self, image: &[u8], public: bool) -> io::Result<PathBuf>;
}

/// Writes `IMG_yyyyMMdd_HHmmss.jpg` into one of two directories
#[derive(Debug, Clone)]
pub struct DirectoryImageSink {
    private_dir: PathBuf,
    public_dir: PathBuf,
}

impl DirectoryImageSink {
    pub fn new(private_dir: impl Into<PathBuf>, public_dir: impl Into<PathBuf>) -> Self {
        Self {
            private_dir: private_dir.into(),
            public_dir: public_dir.into(),
        }
    }

    pub fn file_name(taken_at: DateTime<Local>) -> String {
        format!("IMG_{}.jpg", taken_at.format("%Y%m%d_%H%M%S"))
    }

    fn dir(&self, public: bool) -> &Path {
        if public {
            &self.public_dir
        } else {
            &self.private_dir
        }
    }
}

impl ImageSink for DirectoryImageSink {
    fn store(&self, image: &[u8], public: bool) -> io::Result<PathBuf> {
        let dir = self.dir(public);
        std::fs::create_dir_all(dir)?;
        let path = dir.join(Self::file_name(Local::now()));
        std::fs::write(&path, image)?;
        Ok(path)
    }
}

pub struct CaptureCoordinator {
    engine: CaptureEngine,
    settings: SharedSettings,
    identity: Arc<dyn IdentitySource>,
    uploader: Option<Arc<dyn PhotoUploader>>,
    sink: Option<Arc<dyn ImageSink>>,
    acknowledger: Option<Arc<dyn CaptureAcknowledger>>,
    reporter: Option<Arc<dyn StatusReporter>>,
}

impl CaptureCoordinator {
    pub fn new(
        engine: CaptureEngine,
        settings: SharedSettings,
        identity: Arc<dyn IdentitySource>,
    ) -> Self {
        Self {
            engine,
            settings,
            identity,
            uploader: None,
            sink: None,
            acknowledger: None,
            reporter: None,
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn PhotoUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn ImageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_acknowledger(mut self, acknowledger: Arc<dyn CaptureAcknowledger>) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn engine(&self) -> &CaptureEngine {
        &self.engine
    }

    /// Capture one still and run the post-capture steps
    pub async fn capture(&self, trigger: CaptureTrigger) -> CaptureResult {
        let (params, show_acknowledgment, storage_public, upload_url) = {
            let settings = self.settings.read();
            (
                settings.capture_params(),
                settings.show_acknowledgment,
                settings.storage_public,
                settings.upload_url(),
            )
        };

        tracing::info!(trigger = %trigger, "Capture started");
        let started = Instant::now();
        let result = self.engine.begin_capture(params).await;
        tracing::info!(
            trigger = %trigger,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Capture finished"
        );

        let image = match result.image.as_deref() {
            Some(image) if result.success => image,
            _ => return result,
        };

        if show_acknowledgment {
            if let Some(acknowledger) = &self.acknowledger {
                acknowledger.acknowledge(trigger);
            }
        }

        if let Some(sink) = &self.sink {
            match sink.store(image, storage_public) {
                Ok(path) => tracing::info!("Image saved to {}", path.display()),
                Err(e) => tracing::error!("Failed to save image: {}", e),
            }
        }

        self.upload(image, upload_url).await;

        if let Some(reporter) = &self.reporter {
            reporter.report_status();
        }

        result
    }

    async fn upload(&self, image: &[u8], url: String) {
        let Some(uploader) = &self.uploader else {
            return;
        };
        let identity = match self.identity.identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!("Cannot read device identity for upload: {}", e);
                return;
            }
        };
        let Some(device_token) = identity.device_token.filter(|t| !t.is_empty()) else {
            tracing::warn!("Device not bound, skipping upload");
            return;
        };

        let request = UploadRequest {
            url,
            device_id: identity.device_id,
            device_token,
            timestamp: Utc::now(),
            image: image.to_vec(),
        };
        match uploader.upload(request).await {
            Ok(photo) => tracing::info!("Photo uploaded: {}", photo.url),
            Err(e) => tracing::error!("Photo upload failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::camera::{
        AfState, CameraBackend, CameraError, CameraEvent, CameraEventSender, CameraInfo,
        DeviceHandle, LensFacing, ReaderHandle, SessionHandle,
    };
    use crate::capture::session::CaptureConfig;
    use crate::identity::{DeviceIdentity, StaticIdentity};
    use crate::protocol::PhotoDto;
    use crate::settings::AgentSettings;
    use crate::upload::UploadError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::{Mutex, RwLock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Succeeds (or fails) every capture immediately
    struct InstantCamera {
        image: Option<Vec<u8>>,
        events: Mutex<Option<CameraEventSender>>,
    }

    impl InstantCamera {
        fn new(image: Option<Vec<u8>>) -> Self {
            Self {
                image,
                events: Mutex::new(None),
            }
        }

        fn emit(&self, event: CameraEvent) {
            if let Some(events) = self.events.lock().as_ref() {
                events.emit(event);
            }
        }
    }

    impl CameraBackend for InstantCamera {
        fn cameras(&self) -> Result<Vec<CameraInfo>, CameraError> {
            Ok(vec![CameraInfo::new("0", LensFacing::Back, 90)])
        }
        fn create_image_reader(&self, _: &CameraInfo, events: CameraEventSender) -> Result<ReaderHandle, CameraError> {
            *self.events.lock() = Some(events);
            Ok(ReaderHandle(1))
        }
        fn open_device(&self, _: &str, _: CameraEventSender) -> Result<DeviceHandle, CameraError> {
            self.emit(CameraEvent::DeviceOpened);
            Ok(DeviceHandle(1))
        }
        fn create_session(&self, _: DeviceHandle, _: ReaderHandle) -> Result<(), CameraError> {
            self.emit(CameraEvent::SessionConfigured(SessionHandle(1)));
            Ok(())
        }
        fn submit_focus_lock(&self, _: SessionHandle) -> Result<(), CameraError> {
            self.emit(CameraEvent::CaptureProgress {
                af_state: Some(AfState::FocusedLocked),
                ae_state: None,
            });
            Ok(())
        }
        fn submit_precapture(&self, _: SessionHandle) -> Result<(), CameraError> {
            Ok(())
        }
        fn submit_still_capture(&self, _: SessionHandle, _: ReaderHandle, _: u32) -> Result<(), CameraError> {
            self.emit(CameraEvent::StillCaptureCompleted);
            self.emit(CameraEvent::ImageAvailable(self.image.clone()));
            Ok(())
        }
        fn close_session(&self, _: SessionHandle) -> Result<(), CameraError> {
            Ok(())
        }
        fn close_device(&self, _: DeviceHandle) -> Result<(), CameraError> {
            Ok(())
        }
        fn close_reader(&self, _: ReaderHandle) -> Result<(), CameraError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        requests: Mutex<Vec<UploadRequest>>,
        fail: bool,
    }

    #[async_trait]
    impl PhotoUploader for RecordingUploader {
        async fn upload(&self, request: UploadRequest) -> Result<PhotoDto, UploadError> {
            self.requests.lock().push(request.clone());
            if self.fail {
                return Err(UploadError::Request("offline".into()));
            }
            Ok(PhotoDto {
                photo_id: "p".into(),
                device_id: request.device_id.clone(),
                url: "/p.jpg".into(),
                timestamp: request.timestamp_param(),
            })
        }
    }

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl Counter {
        fn get(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    impl CaptureAcknowledger for Counter {
        fn acknowledge(&self, _trigger: CaptureTrigger) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl StatusReporter for Counter {
        fn report_status(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator(
        image: Option<Vec<u8>>,
        token: Option<&str>,
        settings: AgentSettings,
    ) -> CaptureCoordinator {
        let engine = CaptureEngine::new(Arc::new(InstantCamera::new(image)), CaptureConfig::default());
        let identity = Arc::new(StaticIdentity(DeviceIdentity::new(
            "dev-1",
            token.map(str::to_string),
        )));
        CaptureCoordinator::new(engine, Arc::new(RwLock::new(settings)), identity)
    }

    #[tokio::test]
    async fn test_success_runs_post_capture_steps() {
        let uploader = Arc::new(RecordingUploader::default());
        let acks = Arc::new(Counter::default());
        let reports = Arc::new(Counter::default());
        let settings = AgentSettings {
            show_acknowledgment: true,
            server_url: "https://cam.example.com/".into(),
            ..Default::default()
        };
        let coordinator = coordinator(Some(vec![1, 2, 3]), Some("tok"), settings)
            .with_uploader(uploader.clone())
            .with_acknowledger(acks.clone())
            .with_reporter(reports.clone());

        let result = coordinator.capture(CaptureTrigger::Remote).await;

        assert!(result.success);
        assert_eq!(acks.get(), 1);
        assert_eq!(reports.get(), 1);
        let requests = uploader.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "https://cam.example.com/api/v1/photos/upload");
        assert_eq!(requests[0].device_token, "tok");
        assert_eq!(requests[0].image, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_unbound_device_skips_upload() {
        let uploader = Arc::new(RecordingUploader::default());
        let coordinator = coordinator(Some(vec![1]), None, AgentSettings::default())
            .with_uploader(uploader.clone());

        assert!(coordinator.capture(CaptureTrigger::Scheduled).await.success);
        assert!(uploader.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_keeps_success() {
        let uploader = Arc::new(RecordingUploader {
            fail: true,
            ..Default::default()
        });
        let reports = Arc::new(Counter::default());
        let coordinator = coordinator(Some(vec![1]), Some("tok"), AgentSettings::default())
            .with_uploader(uploader.clone())
            .with_reporter(reports.clone());

        assert!(coordinator.capture(CaptureTrigger::Manual).await.success);
        assert_eq!(uploader.requests.lock().len(), 1);
        assert_eq!(reports.get(), 1);
    }

    #[tokio::test]
    async fn test_failed_capture_skips_everything() {
        let uploader = Arc::new(RecordingUploader::default());
        let acks = Arc::new(Counter::default());
        let reports = Arc::new(Counter::default());
        let settings = AgentSettings {
            show_acknowledgment: true,
            ..Default::default()
        };
        let coordinator = coordinator(None, Some("tok"), settings)
            .with_uploader(uploader.clone())
            .with_acknowledger(acks.clone())
            .with_reporter(reports.clone());

        assert!(!coordinator.capture(CaptureTrigger::Remote).await.success);
        assert_eq!(acks.get(), 0);
        assert_eq!(reports.get(), 0);
        assert!(uploader.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledgment_off_by_default() {
        let acks = Arc::new(Counter::default());
        let coordinator = coordinator(Some(vec![1]), None, AgentSettings::default())
            .with_acknowledger(acks.clone());
        coordinator.capture(CaptureTrigger::Scheduled).await;
        assert_eq!(acks.get(), 0);
    }

    #[tokio::test]
    async fn test_sink_writes_to_selected_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(DirectoryImageSink::new(
            dir.path().join("private"),
            dir.path().join("public"),
        ));
        let settings = AgentSettings {
            storage_public: true,
            ..Default::default()
        };
        let coordinator = coordinator(Some(vec![9, 9]), None, settings).with_sink(sink);
        coordinator.capture(CaptureTrigger::Manual).await;

        let saved: Vec<_> = std::fs::read_dir(dir.path().join("public"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(saved.len(), 1);
        assert_eq!(std::fs::read(&saved[0]).unwrap(), vec![9, 9]);
        assert!(!dir.path().join("private").exists());
    }

    #[test]
    fn test_file_name_format() {
        let taken = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(DirectoryImageSink::file_name(taken), "IMG_20240309_070501.jpg");
    }
}
