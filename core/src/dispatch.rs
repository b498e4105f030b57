// Remote Command Dispatch: backend commands to local actions

use crate::capture::{CaptureCoordinator, CaptureTrigger};
use crate::protocol::CommandPayload;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Commands this build understands. Anything else is logged and ignored so
/// newer backends can add commands without breaking older agents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCommand {
    TakePicture,
    Unknown(String),
}

impl RemoteCommand {
    pub fn parse(command: &str) -> Self {
        match command {
            "take_picture" => RemoteCommand::TakePicture,
            other => RemoteCommand::Unknown(other.to_string()),
        }
    }
}

impl From<&CommandPayload> for RemoteCommand {
    fn from(payload: &CommandPayload) -> Self {
        Self::parse(&payload.command)
    }
}

impl fmt::Display for RemoteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCommand::TakePicture => write!(f, "take_picture"),
            RemoteCommand::Unknown(command) => write!(f, "{}", command),
        }
    }
}

/// Routes inbound commands to the capture coordinator
#[derive(Clone)]
pub struct CommandDispatcher {
    coordinator: Arc<CaptureCoordinator>,
}

impl CommandDispatcher {
    pub fn new(coordinator: Arc<CaptureCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Handle one command to completion; returns whether it was recognized
    pub async fn dispatch(&self, payload: &CommandPayload) -> bool {
        match RemoteCommand::from(payload) {
            RemoteCommand::TakePicture => {
                tracing::info!("Received remote command to take picture");
                self.coordinator.capture(CaptureTrigger::Remote).await;
                true
            }
            RemoteCommand::Unknown(command) => {
                tracing::warn!("Unknown remote command: {}", command);
                false
            }
        }
    }

    /// Consume commands until the connection manager drops its sender.
    ///
    /// Each command runs on its own task, so a capture in progress rejects
    /// a second `take_picture` through the capture lock instead of queueing it.
    pub async fn run(self, mut commands: mpsc::Receiver<CommandPayload>) {
        while let Some(payload) = commands.recv().await {
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(&payload).await;
            });
        }
        tracing::debug!("Command stream closed");
    }
}
