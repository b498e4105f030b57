//! Background agent service
//!
//! The Rust-side controller the host creates and drives. The host calls
//! `initialize()` once, toggles monitoring, forwards settings edits and
//! reconnect requests, and calls `shutdown()` when it is torn down.
//!
//! The service is the only writer of the `ServiceLifecycle` flags. Other
//! components hold a shared reference and read them.

use crate::capture::{
    CameraBackend, CameraInfo, CaptureAcknowledger, CaptureConfig, CaptureCoordinator,
    CaptureEngine, CaptureResult, CaptureTrigger, ImageSink, StatusReporter,
};
use crate::connection::{
    ConnectionConfig, ConnectionManager, ConnectionStatus, StatusListener, Transport,
    WebSocketTransport,
};
use crate::dispatch::CommandDispatcher;
use crate::identity::IdentitySource;
use crate::protocol::{DeviceStatus, DeviceStatusUpdate};
use crate::settings::{AgentSettings, SettingsStore, SharedSettings};
use crate::upload::PhotoUploader;
use crate::AgentError;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Connection manager slot; replaced whenever the backend URL may change
type ConnectionSlot = Arc<RwLock<Option<ConnectionManager>>>;

// ============================================================================
// LIFECYCLE
// ============================================================================

/// Running/monitoring flags of the agent.
///
/// Setters are crate-private and only `AgentService` calls them.
#[derive(Debug, Default)]
pub struct ServiceLifecycle {
    running: AtomicBool,
    monitoring: AtomicBool,
}

impl ServiceLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// The service has been initialized and not shut down
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Periodic capture is active
    pub fn is_monitoring(&self) -> bool {
        self.monitoring.load(Ordering::SeqCst)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    /// Returns the previous value
    pub(crate) fn set_monitoring(&self, monitoring: bool) -> bool {
        self.monitoring.swap(monitoring, Ordering::SeqCst)
    }
}

// ============================================================================
// STATUS REPORTING
// ============================================================================

/// Sends `DeviceStatusUpdate`s over whichever connection is current
struct BackendStatusReporter {
    connection: ConnectionSlot,
    lifecycle: Arc<ServiceLifecycle>,
    settings: SharedSettings,
    identity: Arc<dyn IdentitySource>,
}

impl BackendStatusReporter {
    fn device_status(&self) -> Result<DeviceStatusUpdate, AgentError> {
        let identity = self.identity.identity()?;
        let settings = self.settings.read();
        Ok(DeviceStatusUpdate {
            device_id: identity.device_id,
            status: DeviceStatus {
                is_service_running: self.lifecycle.is_monitoring(),
                capture_interval: settings.capture_interval_secs,
                selected_camera_id: settings.selected_camera_id.clone(),
            },
        })
    }
}

impl StatusReporter for BackendStatusReporter {
    fn report_status(&self) {
        let Some(connection) = self.connection.read().clone() else {
            tracing::debug!("No connection, status report skipped");
            return;
        };
        let update = match self.device_status() {
            Ok(update) => update,
            Err(e) => {
                tracing::error!("Cannot build status report: {}", e);
                return;
            }
        };
        tracing::debug!(
            monitoring = update.status.is_service_running,
            "Reporting device status"
        );
        if let Err(e) = connection.send_status(&update) {
            tracing::error!("Failed to encode status report: {}", e);
        }
    }
}

// ============================================================================
// BUILDER
// ============================================================================

/// Collects the host-provided collaborators of an `AgentService`
pub struct AgentServiceBuilder {
    settings: AgentSettings,
    identity: Arc<dyn IdentitySource>,
    camera: Arc<dyn CameraBackend>,
    transport: Option<Arc<dyn Transport>>,
    settings_store: Option<SettingsStore>,
    uploader: Option<Arc<dyn PhotoUploader>>,
    sink: Option<Arc<dyn ImageSink>>,
    acknowledger: Option<Arc<dyn CaptureAcknowledger>>,
    status_listener: Option<Arc<dyn StatusListener>>,
    capture_config: CaptureConfig,
}

impl AgentServiceBuilder {
    pub fn new(
        settings: AgentSettings,
        identity: Arc<dyn IdentitySource>,
        camera: Arc<dyn CameraBackend>,
    ) -> Self {
        Self {
            settings,
            identity,
            camera,
            transport: None,
            settings_store: None,
            uploader: None,
            sink: None,
            acknowledger: None,
            status_listener: None,
            capture_config: CaptureConfig::default(),
        }
    }

    /// Session transport; WebSocket when not set
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Persist settings passed to `settings_updated`
    pub fn settings_store(mut self, store: SettingsStore) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn uploader(mut self, uploader: Arc<dyn PhotoUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn image_sink(mut self, sink: Arc<dyn ImageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn acknowledger(mut self, acknowledger: Arc<dyn CaptureAcknowledger>) -> Self {
        self.acknowledger = Some(acknowledger);
        self
    }

    pub fn status_listener(mut self, listener: Arc<dyn StatusListener>) -> Self {
        self.status_listener = Some(listener);
        self
    }

    pub fn capture_config(mut self, config: CaptureConfig) -> Self {
        self.capture_config = config;
        self
    }

    pub fn build(self) -> Result<AgentService, AgentError> {
        self.settings.validate()?;

        let settings: SharedSettings = Arc::new(RwLock::new(self.settings));
        let lifecycle = Arc::new(ServiceLifecycle::new());
        let connection: ConnectionSlot = Arc::new(RwLock::new(None));

        let reporter = Arc::new(BackendStatusReporter {
            connection: connection.clone(),
            lifecycle: lifecycle.clone(),
            settings: settings.clone(),
            identity: self.identity.clone(),
        });

        let engine = CaptureEngine::new(self.camera, self.capture_config);
        let mut coordinator =
            CaptureCoordinator::new(engine, settings.clone(), self.identity.clone())
                .with_reporter(reporter.clone());
        if let Some(uploader) = self.uploader {
            coordinator = coordinator.with_uploader(uploader);
        }
        if let Some(sink) = self.sink {
            coordinator = coordinator.with_sink(sink);
        }
        if let Some(acknowledger) = self.acknowledger {
            coordinator = coordinator.with_acknowledger(acknowledger);
        }

        Ok(AgentService {
            settings,
            settings_store: self.settings_store,
            identity: self.identity,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(WebSocketTransport::new())),
            status_listener: self.status_listener,
            coordinator: Arc::new(coordinator),
            lifecycle,
            connection,
            reporter,
            dispatch_task: Mutex::new(None),
            scheduler_task: Mutex::new(None),
        })
    }
}

// ============================================================================
// AGENT SERVICE
// ============================================================================

/// The agent controller.
///
/// Methods that start background work (`initialize`, `start_monitoring`,
/// `settings_updated`, `reconnect`) must run inside a tokio runtime.
pub struct AgentService {
    settings: SharedSettings,
    settings_store: Option<SettingsStore>,
    identity: Arc<dyn IdentitySource>,
    transport: Arc<dyn Transport>,
    status_listener: Option<Arc<dyn StatusListener>>,
    coordinator: Arc<CaptureCoordinator>,
    lifecycle: Arc<ServiceLifecycle>,
    connection: ConnectionSlot,
    reporter: Arc<BackendStatusReporter>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    scheduler_task: Mutex<Option<JoinHandle<()>>>,
}

impl AgentService {
    pub fn builder(
        settings: AgentSettings,
        identity: Arc<dyn IdentitySource>,
        camera: Arc<dyn CameraBackend>,
    ) -> AgentServiceBuilder {
        AgentServiceBuilder::new(settings, identity, camera)
    }

    /// Bring the service up: connect when the device is bound, otherwise
    /// stay disconnected.
    pub fn initialize(&self) {
        tracing::info!("Agent service starting");
        self.lifecycle.set_running(true);
        self.setup_connection();
    }

    pub fn start_monitoring(&self) {
        if self.lifecycle.set_monitoring(true) {
            tracing::debug!("Monitoring already active");
        } else {
            tracing::info!(
                interval_secs = self.settings.read().capture_interval_secs,
                "Monitoring started"
            );
            let scheduler = tokio::spawn(run_scheduler(
                self.coordinator.clone(),
                self.lifecycle.clone(),
                self.settings.clone(),
            ));
            if let Some(previous) = self.scheduler_task.lock().replace(scheduler) {
                previous.abort();
            }
        }
        self.reporter.report_status();
    }

    pub fn stop_monitoring(&self) {
        if self.lifecycle.set_monitoring(false) {
            tracing::info!("Monitoring stopped");
        }
        if let Some(scheduler) = self.scheduler_task.lock().take() {
            scheduler.abort();
        }
        self.reporter.report_status();
    }

    /// Apply edited settings: persist them, re-establish the connection
    /// (the backend URL may have changed) and report the new status.
    pub fn settings_updated(&self, settings: AgentSettings) -> Result<(), AgentError> {
        settings.validate()?;
        if let Some(store) = &self.settings_store {
            store.save(&settings)?;
        }
        *self.settings.write() = settings;
        tracing::info!("Settings updated");

        if self.lifecycle.is_running() {
            self.setup_connection();
        }
        self.reporter.report_status();
        Ok(())
    }

    /// Explicit reconnect request: recreate the session from scratch
    pub fn reconnect(&self) {
        tracing::info!("Reconnect requested");
        self.setup_connection();
    }

    pub fn disconnect(&self) {
        match self.connection.read().as_ref() {
            Some(connection) => connection.disconnect(),
            None => tracing::debug!("Disconnect requested with no connection"),
        }
    }

    /// Current connection status, also pushed to the status listener
    pub fn request_status(&self) -> ConnectionStatus {
        let status = self.connection_status();
        if let Some(listener) = &self.status_listener {
            listener.on_status(status);
        }
        status
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection
            .read()
            .as_ref()
            .map(|c| c.status())
            .unwrap_or_else(ConnectionStatus::disconnected)
    }

    /// Cameras the backend can capture from
    pub fn cameras(&self) -> Result<Vec<CameraInfo>, AgentError> {
        Ok(self.coordinator.engine().cameras()?)
    }

    pub async fn trigger_capture(&self, trigger: CaptureTrigger) -> CaptureResult {
        self.coordinator.capture(trigger).await
    }

    /// Status body the next report would carry
    pub fn device_status(&self) -> Result<DeviceStatusUpdate, AgentError> {
        self.reporter.device_status()
    }

    pub fn settings(&self) -> AgentSettings {
        self.settings.read().clone()
    }

    pub fn lifecycle(&self) -> Arc<ServiceLifecycle> {
        self.lifecycle.clone()
    }

    pub fn coordinator(&self) -> Arc<CaptureCoordinator> {
        self.coordinator.clone()
    }

    /// Stop monitoring, close the session and release background tasks.
    ///
    /// The session closes in the background; use `shutdown_gracefully` to
    /// wait for the DISCONNECT frame to go out.
    pub fn shutdown(&self) {
        self.stop();
    }

    /// `shutdown`, then wait up to `grace` for the connection to close
    pub async fn shutdown_gracefully(&self, grace: Duration) {
        if let Some(connection) = self.stop() {
            if tokio::time::timeout(grace, connection.stopped()).await.is_err() {
                tracing::warn!("Connection still closing after {:?}", grace);
            }
        }
    }

    fn stop(&self) -> Option<ConnectionManager> {
        tracing::info!("Agent service stopping");
        self.lifecycle.set_monitoring(false);
        if let Some(scheduler) = self.scheduler_task.lock().take() {
            scheduler.abort();
        }
        let connection = self.connection.write().take();
        if let Some(connection) = &connection {
            connection.shutdown();
            if let Some(listener) = &self.status_listener {
                listener.on_status(ConnectionStatus::disconnected());
            }
        }
        if let Some(dispatch) = self.dispatch_task.lock().take() {
            dispatch.abort();
        }
        self.lifecycle.set_running(false);
        connection
    }

    /// Replace the connection manager with one for the current URL, then
    /// connect if the device is bound.
    fn setup_connection(&self) {
        let bound = match self.identity.identity() {
            Ok(identity) => identity.has_token(),
            Err(e) => {
                tracing::error!("Cannot read device identity: {}", e);
                false
            }
        };

        let config = {
            let settings = self.settings.read();
            let mut config = ConnectionConfig::new(settings.websocket_url());
            config.backoff = settings.reconnect;
            config
        };
        tracing::debug!(url = %config.url, bound, "Setting up connection");

        let (manager, commands) = ConnectionManager::spawn(
            config,
            self.transport.clone(),
            self.identity.clone(),
            self.status_listener.clone(),
        );
        if let Some(previous) = self.connection.write().replace(manager.clone()) {
            previous.shutdown();
        }

        let dispatcher = CommandDispatcher::new(self.coordinator.clone());
        let dispatch = tokio::spawn(dispatcher.run(commands));
        if let Some(previous) = self.dispatch_task.lock().replace(dispatch) {
            previous.abort();
        }

        if bound {
            manager.connect();
        } else {
            tracing::warn!("Device not bound, staying disconnected");
            manager.disconnect();
            if let Some(listener) = &self.status_listener {
                listener.on_status(ConnectionStatus::disconnected());
            }
        }
    }
}

impl Drop for AgentService {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.write().take() {
            connection.shutdown();
        }
        for task in [self.dispatch_task.get_mut(), self.scheduler_task.get_mut()] {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

/// Wait one interval, capture, and go again while monitoring stays on.
/// The interval is re-read each round so edits apply to the next wait.
async fn run_scheduler(
    coordinator: Arc<CaptureCoordinator>,
    lifecycle: Arc<ServiceLifecycle>,
    settings: SharedSettings,
) {
    loop {
        let interval = settings.read().capture_interval();
        tokio::time::sleep(interval).await;
        if !lifecycle.is_monitoring() {
            break;
        }
        let result = coordinator.capture(CaptureTrigger::Scheduled).await;
        if !result.success {
            tracing::warn!("Scheduled capture failed");
        }
        if !lifecycle.is_monitoring() {
            break;
        }
    }
    tracing::debug!("Scheduler exited");
}

// ============================================================================
// TESTS
// ============================================================================
