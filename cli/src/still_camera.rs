// File-backed camera for desktop and headless hosts
//
// Serves one JPEG from disk as the captured still. The file is read at
// capture time, so replacing it between captures changes what is uploaded.

use backcam_core::capture::{AeState, DeviceHandle, ReaderHandle, SessionHandle};
use backcam_core::{
    CameraBackend, CameraError, CameraEvent, CameraEventSender, CameraInfo, LensFacing,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

pub const STILL_CAMERA_ID: &str = "still0";

pub struct StillImageCamera {
    path: Option<PathBuf>,
    next_handle: AtomicU64,
    /// Sender of the capture in progress
    events: Mutex<Option<CameraEventSender>>,
}

impl StillImageCamera {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            next_handle: AtomicU64::new(1),
            events: Mutex::new(None),
        }
    }

    fn handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, event: CameraEvent) {
        match self.events.lock().as_ref() {
            Some(events) => {
                if !events.emit(event) {
                    tracing::debug!("Capture already finished, event dropped");
                }
            }
            None => tracing::warn!("No capture in progress, event dropped"),
        }
    }
}

impl CameraBackend for StillImageCamera {
    fn cameras(&self) -> Result<Vec<CameraInfo>, CameraError> {
        Ok(match &self.path {
            Some(_) => vec![CameraInfo::new(STILL_CAMERA_ID, LensFacing::Back, 0)],
            None => Vec::new(),
        })
    }

    fn create_image_reader(
        &self,
        _camera: &CameraInfo,
        events: CameraEventSender,
    ) -> Result<ReaderHandle, CameraError> {
        *self.events.lock() = Some(events);
        Ok(ReaderHandle(self.handle()))
    }

    fn open_device(
        &self,
        camera_id: &str,
        _events: CameraEventSender,
    ) -> Result<DeviceHandle, CameraError> {
        if camera_id != STILL_CAMERA_ID {
            return Err(CameraError::Access(format!("unknown camera {}", camera_id)));
        }
        self.emit(CameraEvent::DeviceOpened);
        Ok(DeviceHandle(self.handle()))
    }

    fn create_session(
        &self,
        _device: DeviceHandle,
        _reader: ReaderHandle,
    ) -> Result<(), CameraError> {
        self.emit(CameraEvent::SessionConfigured(SessionHandle(self.handle())));
        Ok(())
    }

    fn submit_focus_lock(&self, _session: SessionHandle) -> Result<(), CameraError> {
        // Fixed-focus source
        self.emit(CameraEvent::CaptureProgress {
            af_state: None,
            ae_state: None,
        });
        Ok(())
    }

    fn submit_precapture(&self, _session: SessionHandle) -> Result<(), CameraError> {
        for ae_state in [AeState::Precapture, AeState::Converged] {
            self.emit(CameraEvent::CaptureProgress {
                af_state: None,
                ae_state: Some(ae_state),
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
        let path = self.path.as_ref().ok_or(CameraError::NoCamera)?;
        let image = std::fs::read(path)
            .map_err(|e| CameraError::Capture(format!("{}: {}", path.display(), e)))?;
        tracing::debug!(
            bytes = image.len(),
            jpeg_orientation,
            "Serving still from {}",
            path.display()
        );
        self.emit(CameraEvent::StillCaptureCompleted);
        self.emit(CameraEvent::ImageAvailable(Some(image)));
        Ok(())
    }

    fn close_session(&self, _session: SessionHandle) -> Result<(), CameraError> {
        Ok(())
    }

    fn close_device(&self, _device: DeviceHandle) -> Result<(), CameraError> {
        Ok(())
    }

    fn close_reader(&self, _reader: ReaderHandle) -> Result<(), CameraError> {
        self.events.lock().take();
        Ok(())
    }
}
