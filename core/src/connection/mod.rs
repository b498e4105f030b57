//! Connection Manager: the persistent device session with the backend
//!
//! - `backoff`: reconnect delay policy
//! - `transport`: text-message transport (WebSocket in production)
//! - `manager`: the session actor (handshake, subscribe, heart-beats, retry)

pub mod backoff;
pub mod manager;
pub mod transport;

pub use backoff::{BackoffConfig, BackoffStrategy, ReconnectPolicy};
pub use manager::{negotiate_heartbeat, ConnectionConfig, ConnectionManager};
pub use transport::{Transport, TransportError, TransportLink, WebSocketTransport};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No transport, possibly waiting on a retry timer
    Disconnected,
    /// Transport opening or handshake in flight
    Connecting,
    /// Handshake confirmed and command queue subscribed
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        };
        f.write_str(s)
    }
}

/// Published status: the state plus the pending retry delay, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub retry_in: Option<Duration>,
}

impl ConnectionStatus {
    pub fn disconnected() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            retry_in: None,
        }
    }

    /// Human-readable form, e.g. "DISCONNECTED (retry in 4s)"
    pub fn label(&self) -> String {
        match self.retry_in {
            Some(delay) => format!("{} (retry in {}s)", self.state, delay.as_secs()),
            None => self.state.to_string(),
        }
    }
}

/// Observer invoked on every connection status transition
pub trait StatusListener: Send + Sync {
    fn on_status(&self, status: ConnectionStatus);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_label() {
        let status = ConnectionStatus {
            state: ConnectionState::Disconnected,
            retry_in: Some(Duration::from_secs(4)),
        };
        assert_eq!(status.label(), "DISCONNECTED (retry in 4s)");
        assert_eq!(ConnectionStatus::disconnected().label(), "DISCONNECTED");
    }
}
