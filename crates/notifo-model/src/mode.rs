use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the widget talks to the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionMode {
    /// SignalR hub with the negotiate round trip before the socket opens.
    #[default]
    SignalR,
    /// SignalR hub over a raw WebSocket, negotiation skipped.
    SignalRSockets,
    /// HTTP request/response loop against the poll endpoint.
    Polling,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionMode::SignalR => "SignalR",
            ConnectionMode::SignalRSockets => "SignalRSockets",
            ConnectionMode::Polling => "Polling",
        }
    }

    pub fn uses_socket(self) -> bool {
        !matches!(self, ConnectionMode::Polling)
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connection mode `{0}` (expected SignalR, SignalRSockets or Polling)")]
pub struct ParseModeError(pub String);

impl FromStr for ConnectionMode {
    type Err = ParseModeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "signalr" => Ok(ConnectionMode::SignalR),
            "signalrsockets" | "signalr-sockets" | "websocket" => {
                Ok(ConnectionMode::SignalRSockets)
            }
            "polling" | "poll" => Ok(ConnectionMode::Polling),
            _ => Err(ParseModeError(value.to_string())),
        }
    }
}
