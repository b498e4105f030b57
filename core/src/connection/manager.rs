// Connection Manager actor: owns the transport link and the session state
//
// All state lives in one task. Handles send commands over a channel; the
// transport open, inbound traffic, the retry timer and heart-beats are all
// events in the same `select!` loop, so there is never more than one retry
// pending and never two links open at once.

use super::backoff::{BackoffConfig, ReconnectPolicy};
use super::transport::{Transport, TransportError, TransportLink};
use super::{ConnectionState, ConnectionStatus, StatusListener};
use crate::identity::IdentitySource;
use crate::protocol::frame::HEART_BEAT;
use crate::protocol::{
    command_destination, is_heartbeat, CommandPayload, DeviceRegistration, DeviceStatusUpdate,
    Frame, FrameCommand, FrameError, REGISTER_DESTINATION, STATUS_DESTINATION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const SUBSCRIPTION_ID: &str = "sub-0";
const DISCONNECT_RECEIPT: &str = "disconnect-0";
/// Missed inbound heart-beats tolerated before the link is declared dead
const HEARTBEAT_GRACE_FACTOR: u32 = 3;

/// Connection manager configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Full socket URL, e.g. `wss://host/ws/websocket`
    pub url: String,
    pub backoff: BackoffConfig,
    /// Time allowed between opening the transport and the CONNECTED frame
    pub handshake_timeout: Duration,
    /// Capacity of the inbound command channel
    pub command_buffer: usize,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            backoff: BackoffConfig::default(),
            handshake_timeout: Duration::from_secs(15),
            command_buffer: 32,
        }
    }
}

/// Negotiate heart-beat intervals from our `cx,cy` offer and the server's
/// `sx,sy` reply.
///
/// Returns `(outgoing, incoming)`; `None` disables that direction.
pub fn negotiate_heartbeat(ours: &str, theirs: Option<&str>) -> (Option<Duration>, Option<Duration>) {
    let (cx, cy) = parse_heartbeat(ours);
    let (sx, sy) = theirs.map(parse_heartbeat).unwrap_or((0, 0));
    let pick = |a: u64, b: u64| {
        if a == 0 || b == 0 {
            None
        } else {
            Some(Duration::from_millis(a.max(b)))
        }
    };
    (pick(cx, sy), pick(cy, sx))
}

fn parse_heartbeat(value: &str) -> (u64, u64) {
    let mut parts = value
        .split(',')
        .map(|part| part.trim().parse::<u64>().unwrap_or(0));
    (parts.next().unwrap_or(0), parts.next().unwrap_or(0))
}

enum ManagerCommand {
    Connect,
    Disconnect,
    Send { destination: String, body: String },
    Shutdown,
}

/// Result of a transport open, tagged with the attempt that started it
struct Opened {
    generation: u64,
    result: Result<Box<dyn TransportLink>, TransportError>,
}

/// Handle to the connection manager actor
#[derive(Clone)]
pub struct ConnectionManager {
    command_tx: mpsc::UnboundedSender<ManagerCommand>,
    status_rx: watch::Receiver<ConnectionStatus>,
}

impl ConnectionManager {
    /// Spawn the manager on the current tokio runtime.
    ///
    /// Returns the handle and the stream of commands pushed by the backend.
    pub fn spawn(
        config: ConnectionConfig,
        transport: Arc<dyn Transport>,
        identity: Arc<dyn IdentitySource>,
        listener: Option<Arc<dyn StatusListener>>,
    ) -> (Self, mpsc::Receiver<CommandPayload>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::disconnected());
        let (inbound_tx, inbound_rx) = mpsc::channel(config.command_buffer.max(1));
        let (opened_tx, opened_rx) = mpsc::channel(4);

        let policy = ReconnectPolicy::new(config.backoff);
        let actor = ConnectionActor {
            config,
            transport,
            identity,
            listener,
            status_tx,
            inbound_tx,
            opened_tx,
            state: ConnectionState::Disconnected,
            link: None,
            generation: 0,
            credentials: None,
            manual_disconnect: false,
            policy,
            reconnect_at: None,
            heartbeat_out: None,
            next_heartbeat_at: None,
            idle_timeout: None,
            last_inbound: Instant::now(),
        };
        tokio::spawn(actor.run(command_rx, opened_rx));

        (
            Self {
                command_tx,
                status_rx,
            },
            inbound_rx,
        )
    }

    /// Open the session. No-op unless currently DISCONNECTED.
    pub fn connect(&self) {
        self.dispatch(ManagerCommand::Connect);
    }

    /// Close the session and cancel any pending retry. Idempotent.
    pub fn disconnect(&self) {
        self.dispatch(ManagerCommand::Disconnect);
    }

    /// Send a JSON body to `destination`; dropped with a warning when not
    /// connected.
    pub fn send(&self, destination: &str, body: impl Into<String>) {
        self.dispatch(ManagerCommand::Send {
            destination: destination.to_string(),
            body: body.into(),
        });
    }

    pub fn send_status(&self, update: &DeviceStatusUpdate) -> Result<(), serde_json::Error> {
        let body = serde_json::to_string(update)?;
        self.send(STATUS_DESTINATION, body);
        Ok(())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Disconnect and stop the actor.
    ///
    /// The status listener is not notified of the final DISCONNECTED.
    pub fn shutdown(&self) {
        self.dispatch(ManagerCommand::Shutdown);
    }

    /// Resolves once the actor has exited, after its goodbye frame was sent
    pub async fn stopped(&self) {
        let mut status = self.status_rx.clone();
        while status.changed().await.is_ok() {}
    }

    fn dispatch(&self, command: ManagerCommand) {
        if self.command_tx.send(command).is_err() {
            tracing::warn!("Connection manager is not running");
        }
    }
}

struct ConnectionActor {
    config: ConnectionConfig,
    transport: Arc<dyn Transport>,
    identity: Arc<dyn IdentitySource>,
    listener: Option<Arc<dyn StatusListener>>,
    status_tx: watch::Sender<ConnectionStatus>,
    inbound_tx: mpsc::Sender<CommandPayload>,
    opened_tx: mpsc::Sender<Opened>,

    state: ConnectionState,
    link: Option<Box<dyn TransportLink>>,
    /// Bumped on every open attempt and disconnect; stale opens are discarded
    generation: u64,
    /// (device id, token) of the attempt in flight
    credentials: Option<(String, String)>,
    manual_disconnect: bool,
    policy: ReconnectPolicy,
    /// The single pending retry, if any
    reconnect_at: Option<Instant>,

    heartbeat_out: Option<Duration>,
    next_heartbeat_at: Option<Instant>,
    idle_timeout: Option<Duration>,
    last_inbound: Instant,
}

impl ConnectionActor {
    async fn run(
        mut self,
        mut command_rx: mpsc::UnboundedReceiver<ManagerCommand>,
        mut opened_rx: mpsc::Receiver<Opened>,
    ) {
        loop {
            let retry = sleep_until_opt(self.reconnect_at);
            let tick = sleep_until_opt(self.next_deadline());

            tokio::select! {
                command = command_rx.recv() => match command {
                    Some(ManagerCommand::Connect) => self.connect(),
                    Some(ManagerCommand::Disconnect) => self.close_session().await,
                    Some(ManagerCommand::Send { destination, body }) => {
                        self.send(destination, body).await
                    }
                    Some(ManagerCommand::Shutdown) | None => {
                        // A replacement manager may already report to the same listener
                        self.listener = None;
                        self.close_session().await;
                        break;
                    }
                },
                Some(opened) = opened_rx.recv() => self.handle_opened(opened).await,
                inbound = recv_from(&mut self.link) => self.handle_inbound(inbound).await,
                _ = retry => {
                    self.reconnect_at = None;
                    self.fire_reconnect();
                }
                _ = tick => self.handle_tick().await,
            }
        }
        tracing::info!("Connection manager stopped");
    }

    // ===== COMMANDS =====

    fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            tracing::debug!("Connect ignored, already {}", self.state);
            return;
        }
        self.manual_disconnect = false;
        // An explicit connect supersedes a pending retry
        self.reconnect_at = None;
        self.start_connect();
    }

    async fn close_session(&mut self) {
        self.manual_disconnect = true;
        self.reconnect_at = None;
        self.policy.reset();
        self.generation += 1;

        if let Some(mut link) = self.link.take() {
            if self.state == ConnectionState::Connected {
                let frame = Frame::disconnect(DISCONNECT_RECEIPT);
                if let Err(e) = link.send_text(frame.encode()).await {
                    tracing::debug!("DISCONNECT frame not delivered: {}", e);
                }
            }
            link.close().await;
            tracing::info!("Disconnected by request");
        }
        self.clear_heartbeats();
        self.set_status(ConnectionState::Disconnected, None);
    }

    async fn send(&mut self, destination: String, body: String) {
        if self.state != ConnectionState::Connected {
            tracing::warn!("Not connected, dropping message for {}", destination);
            return;
        }
        self.write_text(Frame::send_json(&destination, body).encode())
            .await;
    }

    // ===== CONNECT PATH =====

    fn fire_reconnect(&mut self) {
        if self.manual_disconnect || self.state != ConnectionState::Disconnected {
            return;
        }
        tracing::info!("Reconnect attempt {}", self.policy.attempt_count());
        self.start_connect();
    }

    fn start_connect(&mut self) {
        let identity = match self.identity.identity() {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!("Cannot read device identity: {}", e);
                self.report_disconnected();
                return;
            }
        };
        let token = match identity.device_token {
            Some(token) if !token.is_empty() => token,
            _ => {
                tracing::warn!("No device token, device is not bound; not connecting");
                self.report_disconnected();
                return;
            }
        };

        self.generation += 1;
        self.credentials = Some((identity.device_id, token));
        self.set_status(ConnectionState::Connecting, None);
        tracing::info!("Connecting to {}", self.config.url);

        let transport = Arc::clone(&self.transport);
        let url = self.config.url.clone();
        let opened_tx = self.opened_tx.clone();
        let generation = self.generation;
        let open_timeout = self.config.handshake_timeout;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(open_timeout, transport.open(&url)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::IdleTimeout(open_timeout)),
            };
            let _ = opened_tx.send(Opened { generation, result }).await;
        });
    }

    async fn handle_opened(&mut self, opened: Opened) {
        if opened.generation != self.generation || self.state != ConnectionState::Connecting {
            if let Ok(mut link) = opened.result {
                tracing::debug!("Discarding transport from a superseded attempt");
                link.close().await;
            }
            return;
        }

        let mut link = match opened.result {
            Ok(link) => link,
            Err(e) => {
                self.handle_failure(e).await;
                return;
            }
        };
        let Some((device_id, token)) = self.credentials.clone() else {
            link.close().await;
            return;
        };

        match link.send_text(Frame::connect(&device_id, &token).encode()).await {
            Ok(()) => {
                tracing::debug!("Transport open, CONNECT sent");
                self.link = Some(link);
                self.last_inbound = Instant::now();
            }
            Err(e) => {
                link.close().await;
                self.handle_failure(e).await;
            }
        }
    }

    // ===== INBOUND =====

    async fn handle_inbound(&mut self, inbound: Option<Result<String, TransportError>>) {
        let text = match inbound {
            Some(Ok(text)) => text,
            Some(Err(e)) => {
                self.handle_failure(e).await;
                return;
            }
            None => {
                self.handle_failure(TransportError::Closed("peer closed".to_string()))
                    .await;
                return;
            }
        };

        self.last_inbound = Instant::now();
        if is_heartbeat(&text) {
            tracing::trace!("Heart-beat received");
            return;
        }

        match Frame::decode(&text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(FrameError::UnknownCommand(command)) => {
                tracing::warn!("Ignoring unknown frame {}", command)
            }
            Err(e) => tracing::warn!("Dropping malformed frame: {}", e),
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        match frame.command {
            FrameCommand::Connected => self.on_connected(&frame).await,
            FrameCommand::Message => self.on_message(&frame),
            FrameCommand::Error => {
                let message = frame.header("message").unwrap_or("unspecified").to_string();
                tracing::error!(
                    "Server error: {} {}",
                    message,
                    frame.body.as_deref().unwrap_or("")
                );
                self.handle_failure(TransportError::ServerError(message))
                    .await;
            }
            other => tracing::debug!("Ignoring {} frame", other),
        }
    }

    async fn on_connected(&mut self, frame: &Frame) {
        if self.state != ConnectionState::Connecting {
            tracing::debug!("Unexpected CONNECTED frame while {}", self.state);
            return;
        }
        let Some((device_id, _)) = self.credentials.clone() else {
            return;
        };

        let (outgoing, incoming) = negotiate_heartbeat(HEART_BEAT, frame.header("heart-beat"));
        let now = Instant::now();
        self.heartbeat_out = outgoing;
        self.next_heartbeat_at = outgoing.map(|interval| now + interval);
        self.idle_timeout = incoming.map(|interval| interval * HEARTBEAT_GRACE_FACTOR);

        self.policy.reset();
        self.set_status(ConnectionState::Connected, None);
        tracing::info!(
            "Session established (heart-beat out {:?}, in {:?})",
            outgoing,
            incoming
        );

        let destination = command_destination(&device_id);
        self.write_text(Frame::subscribe(SUBSCRIPTION_ID, &destination).encode())
            .await;
        if self.state != ConnectionState::Connected {
            return;
        }
        tracing::info!("Subscribed to {}", destination);

        match serde_json::to_string(&DeviceRegistration { device_id }) {
            Ok(body) => {
                self.write_text(Frame::send_json(REGISTER_DESTINATION, body).encode())
                    .await
            }
            Err(e) => tracing::warn!("Failed to encode registration: {}", e),
        }
    }

    fn on_message(&mut self, frame: &Frame) {
        let Some(body) = frame.body.as_deref().filter(|b| !b.trim().is_empty()) else {
            tracing::debug!("Empty MESSAGE frame");
            return;
        };
        match CommandPayload::from_json(body) {
            Ok(payload) => {
                tracing::info!("Received command: {}", payload.command);
                if let Err(e) = self.inbound_tx.try_send(payload) {
                    tracing::warn!("Dropping command, dispatcher unavailable: {}", e);
                }
            }
            Err(e) => tracing::warn!("Malformed command payload: {}", e),
        }
    }

    // ===== FAILURE / TIMERS =====

    async fn handle_failure(&mut self, error: TransportError) {
        if let Some(mut link) = self.link.take() {
            link.close().await;
        }
        self.clear_heartbeats();

        if self.state == ConnectionState::Disconnected {
            return;
        }
        if self.manual_disconnect {
            self.set_status(ConnectionState::Disconnected, None);
            return;
        }

        let delay = self.policy.record_failure();
        self.reconnect_at = Some(Instant::now() + delay);
        tracing::warn!(
            "Connection lost: {} (attempt {}, retry in {:?})",
            error,
            self.policy.attempt_count(),
            delay
        );
        self.set_status(ConnectionState::Disconnected, Some(delay));
    }

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        if let Some(limit) = self.idle_limit() {
            if now >= self.last_inbound + limit {
                self.handle_failure(TransportError::IdleTimeout(limit)).await;
                return;
            }
        }
        if let (Some(at), Some(interval)) = (self.next_heartbeat_at, self.heartbeat_out) {
            if now >= at {
                self.next_heartbeat_at = Some(now + interval);
                self.write_text("\n".to_string()).await;
            }
        }
    }

    fn idle_limit(&self) -> Option<Duration> {
        match self.state {
            ConnectionState::Connecting => Some(self.config.handshake_timeout),
            ConnectionState::Connected => self.idle_timeout,
            ConnectionState::Disconnected => None,
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.link.is_none() {
            return None;
        }
        let idle = self.idle_limit().map(|limit| self.last_inbound + limit);
        match (idle, self.next_heartbeat_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn clear_heartbeats(&mut self) {
        self.heartbeat_out = None;
        self.next_heartbeat_at = None;
        self.idle_timeout = None;
    }

    async fn write_text(&mut self, text: String) {
        let result = match self.link.as_mut() {
            Some(link) => link.send_text(text).await,
            None => return,
        };
        if let Err(e) = result {
            self.handle_failure(e).await;
        }
    }

    // ===== STATUS =====

    fn set_status(&mut self, state: ConnectionState, retry_in: Option<Duration>) {
        let status = ConnectionStatus { state, retry_in };
        let changed = *self.status_tx.borrow() != status;
        self.state = state;
        if changed {
            self.publish(status);
        }
    }

    /// DISCONNECTED is reported even when nothing changed, so a host asking
    /// to connect without credentials still gets an answer
    fn report_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.publish(ConnectionStatus::disconnected());
    }

    fn publish(&self, status: ConnectionStatus) {
        tracing::debug!("Connection status: {}", status.label());
        self.status_tx.send_replace(status);
        if let Some(listener) = &self.listener {
            listener.on_status(status);
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_from(
    link: &mut Option<Box<dyn TransportLink>>,
) -> Option<Result<String, TransportError>> {
    match link {
        Some(link) => link.recv_text().await,
        None => std::future::pending().await,
    }
}
