// backcam: desktop host for the background capture agent
//
// Cross-platform (macOS, Linux, Windows) command-line host. Manages the
// device identity and settings, runs one-off captures, and runs the agent
// against the backend using a file-backed still camera.

mod config;
mod still_camera;

use anyhow::{Context, Result};
use backcam_core::capture::CaptureAcknowledger;
use backcam_core::{
    AgentService, AgentSettings, CameraBackend, CaptureTrigger, ConnectionStatus,
    DirectoryImageSink, HttpPhotoUploader, IdentitySource, SessionStore, SettingsStore,
    SledStorage, StatusListener, StorageBackend,
};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use still_camera::StillImageCamera;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Time allowed for the session to close after Ctrl-C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "backcam")]
#[command(about = "Backcam: background photo capture agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the device identity and default settings
    Init,
    /// Show device identity and binding
    Identity,
    /// Bind this device with a token issued by the backend
    Bind { token: String },
    /// Remove the device binding and user session
    Unbind,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// List available cameras
    Cameras,
    /// Take one photo now
    Capture {
        /// Also write the image to this path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Run the agent until interrupted
    Run {
        /// Start periodic capture immediately
        #[arg(short, long)]
        monitor: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

/// Stores shared by every command
struct Host {
    config: config::Config,
    data_dir: PathBuf,
    sessions: Arc<SessionStore>,
    settings: SettingsStore,
}

impl Host {
    fn open() -> Result<Self> {
        let config = config::Config::load()?;
        let data_dir = config::Config::data_dir()?;
        let storage_path = data_dir.join("storage");
        let storage_path = storage_path
            .to_str()
            .context("Storage path is not valid UTF-8")?;
        let backend: Arc<dyn StorageBackend> = Arc::new(
            SledStorage::new(storage_path)
                .map_err(|e| anyhow::anyhow!("Failed to open storage: {}", e))?,
        );

        Ok(Self {
            config,
            data_dir,
            sessions: Arc::new(SessionStore::new(backend.clone())),
            settings: SettingsStore::new(backend),
        })
    }

    fn camera(&self) -> Arc<StillImageCamera> {
        Arc::new(StillImageCamera::new(self.config.still_image.clone()))
    }

    fn service(&self, listener: Option<Arc<dyn StatusListener>>) -> Result<AgentService> {
        let settings = self.settings.load().context("Failed to load settings")?;
        let (private_dir, public_dir) = self.config.photo_dirs(&self.data_dir);

        let mut builder = AgentService::builder(settings, self.sessions.clone(), self.camera())
            .uploader(Arc::new(
                HttpPhotoUploader::new().context("Failed to create HTTP client")?,
            ))
            .image_sink(Arc::new(DirectoryImageSink::new(private_dir, public_dir)))
            .acknowledger(Arc::new(ConsoleAcknowledger));
        if let Some(listener) = listener {
            builder = builder.status_listener(listener);
        }
        builder.build().context("Failed to start agent")
    }
}

struct ConsoleAcknowledger;

impl CaptureAcknowledger for ConsoleAcknowledger {
    fn acknowledge(&self, trigger: CaptureTrigger) {
        println!("{} Photo captured ({})", "✓".green(), trigger);
    }
}

struct ConsoleStatus;

impl StatusListener for ConsoleStatus {
    fn on_status(&self, status: ConnectionStatus) {
        println!("{} {}", "Connection:".bold(), status.label().bright_cyan());
    }
}

/// Log to stderr and to a daily file under the data directory
fn init_logging(filter: &str) -> Result<WorkerGuard> {
    let log_dir = config::Config::data_dir()?.join("logs");
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;
    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(log_dir, "backcam.log"));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .ok();
    Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = config::Config::load()
        .map(|c| c.log_filter)
        .unwrap_or_else(|_| "info".to_string());
    let _log_guard = init_logging(&filter)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(),
        Commands::Identity => cmd_identity(),
        Commands::Bind { token } => cmd_bind(token),
        Commands::Unbind => cmd_unbind(),
        Commands::Config { action } => cmd_config(action),
        Commands::Cameras => cmd_cameras(),
        Commands::Capture { output } => cmd_capture(output).await,
        Commands::Run { monitor } => cmd_run(monitor).await,
    }
}

fn cmd_init() -> Result<()> {
    println!("{}", "Initializing Backcam...".bold());
    println!();

    let host = Host::open()?;
    println!("  {} Configuration", "✓".green());
    println!("  {} Data directory: {}", "✓".green(), host.data_dir.display());

    let device_id = host.sessions.device_id().context("Failed to create device id")?;
    println!("  {} Device id: {}", "✓".green(), device_id.bright_cyan());

    let settings = host.settings.load().context("Failed to load settings")?;
    host.settings.save(&settings).context("Failed to save settings")?;
    println!("  {} Settings", "✓".green());
    println!();

    println!("{}", "Next steps:".bold());
    println!("  • Set the backend:  {}", "backcam config set server_url https://...".bright_green());
    println!("  • Bind the device:  {}", "backcam bind <token>".bright_green());
    println!("  • Choose an image:  {}", "backcam config set still_image <path.jpg>".bright_green());
    println!("  • Start the agent:  {}", "backcam run --monitor".bright_green());

    Ok(())
}

fn cmd_identity() -> Result<()> {
    let host = Host::open()?;
    let identity = host.sessions.identity().context("Failed to load identity")?;

    println!("{}", "Device Identity".bold());
    println!("  Device id: {}", identity.device_id.bright_cyan());
    if identity.has_token() {
        println!("  Bound:     {}", "yes".green());
    } else {
        println!("  Bound:     {}", "no".yellow());
    }
    if let Some(username) = host.sessions.username()? {
        println!("  Account:   {}", username);
    }

    Ok(())
}

fn cmd_bind(token: String) -> Result<()> {
    let token = token.trim();
    if token.is_empty() {
        anyhow::bail!("Device token must not be empty");
    }

    let host = Host::open()?;
    host.sessions
        .save_device_binding(token)
        .context("Failed to save device binding")?;
    let device_id = host.sessions.device_id()?;
    println!("{} Device {} bound", "✓".green(), device_id.bright_cyan());

    Ok(())
}

fn cmd_unbind() -> Result<()> {
    let host = Host::open()?;
    host.sessions.logout().context("Failed to remove binding")?;
    println!("{} Device unbound", "✓".green());
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut host = Host::open()?;

    match action {
        ConfigAction::Set { key, value } => {
            if config::Config::is_host_key(&key) {
                host.config.set(&key, &value)?;
                host.config.save()?;
            } else {
                let mut settings = host.settings.load()?;
                settings.set(&key, &value)?;
                host.settings.save(&settings)?;
            }
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }

        ConfigAction::Get { key } => {
            let value = match host.config.get(&key) {
                Some(value) => value,
                None => host.settings.load()?.get(&key)?,
            };
            println!("{} = {}", key.bright_cyan(), value);
        }

        ConfigAction::List => {
            let settings = host.settings.load()?;
            println!("{}", "Agent settings".bold());
            for key in AgentSettings::KEYS {
                println!("  {:<22} {}", key.bright_cyan(), settings.get(key)?);
            }
            println!();
            println!("{}", "Host".bold());
            for (key, value) in host.config.list() {
                println!("  {:<22} {}", key.bright_cyan(), value);
            }
        }
    }

    Ok(())
}

fn cmd_cameras() -> Result<()> {
    let host = Host::open()?;
    let cameras = host.camera().cameras()?;

    if cameras.is_empty() {
        println!("{}", "No cameras. Set one with `backcam config set still_image <path>`.".dimmed());
        return Ok(());
    }
    println!("{}", "Cameras".bold());
    for camera in cameras {
        println!("  {}", camera);
    }
    Ok(())
}

async fn cmd_capture(output: Option<PathBuf>) -> Result<()> {
    let host = Host::open()?;
    let service = host.service(None)?;

    let result = service.trigger_capture(CaptureTrigger::Manual).await;
    let image = match result.image {
        Some(image) if result.success => image,
        _ => anyhow::bail!("Capture failed, see the log for details"),
    };

    println!("{} Captured {} bytes", "✓".green(), image.len());
    if let Some(path) = output {
        std::fs::write(&path, &image)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("  Written to {}", path.display().to_string().bright_cyan());
    }
    Ok(())
}

async fn cmd_run(monitor: bool) -> Result<()> {
    let host = Host::open()?;
    let service = host.service(Some(Arc::new(ConsoleStatus)))?;
    let settings = service.settings();

    println!("{}", "Backcam agent starting...".bold());
    println!("  Backend:  {}", settings.websocket_url().bright_cyan());
    println!("  Interval: {}s", settings.capture_interval_secs);
    println!();

    service.initialize();
    if monitor {
        service.start_monitoring();
        println!("{} Monitoring started", "✓".green());
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!();
    println!("{}", "Shutting down...".bold());
    service.shutdown_gracefully(SHUTDOWN_GRACE).await;
    Ok(())
}
