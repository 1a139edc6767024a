//! SignalR JSON hub protocol: handshake and record-separated message frames.

use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::error::{ConnectionError, ConnectionResult};

pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const COMPLETION: u64 = 3;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// Hub messages this client sends or understands.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation {
        invocation_id: Option<String>,
        target: String,
        arguments: Vec<Value>,
    },
    Completion {
        invocation_id: String,
        result: Option<Value>,
        error: Option<String>,
    },
    Ping,
    Close {
        error: Option<String>,
        allow_reconnect: bool,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    #[serde(rename = "type")]
    kind: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    arguments: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    allow_reconnect: Option<bool>,
}

impl From<&HubMessage> for RawMessage {
    fn from(message: &HubMessage) -> Self {
        match message {
            HubMessage::Invocation {
                invocation_id,
                target,
                arguments,
            } => RawMessage {
                kind: INVOCATION,
                invocation_id: invocation_id.clone(),
                target: Some(target.clone()),
                arguments: Some(arguments.clone()),
                ..RawMessage::default()
            },
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => RawMessage {
                kind: COMPLETION,
                invocation_id: Some(invocation_id.clone()),
                result: result.clone(),
                error: error.clone(),
                ..RawMessage::default()
            },
            HubMessage::Ping => RawMessage {
                kind: PING,
                ..RawMessage::default()
            },
            HubMessage::Close {
                error,
                allow_reconnect,
            } => RawMessage {
                kind: CLOSE,
                error: error.clone(),
                allow_reconnect: Some(*allow_reconnect),
                ..RawMessage::default()
            },
        }
    }
}

impl RawMessage {
    fn into_message(self) -> ConnectionResult<Option<HubMessage>> {
        let message = match self.kind {
            INVOCATION => HubMessage::Invocation {
                invocation_id: self.invocation_id,
                target: self
                    .target
                    .ok_or_else(|| serde_json::Error::missing_field("target"))?,
                arguments: self.arguments.unwrap_or_default(),
            },
            COMPLETION => HubMessage::Completion {
                invocation_id: self
                    .invocation_id
                    .ok_or_else(|| serde_json::Error::missing_field("invocationId"))?,
                result: self.result,
                error: self.error,
            },
            PING => HubMessage::Ping,
            CLOSE => HubMessage::Close {
                error: self.error,
                allow_reconnect: self.allow_reconnect.unwrap_or(false),
            },
            other => {
                trace!(target: "notifo.hub", kind = other, "ignoring hub message");
                return Ok(None);
            }
        };
        Ok(Some(message))
    }
}

/// Serializes one message as a complete record, separator included.
pub fn encode(message: &HubMessage) -> ConnectionResult<String> {
    let mut frame = serde_json::to_string(&RawMessage::from(message))?;
    frame.push(RECORD_SEPARATOR);
    Ok(frame)
}

/// Splits a text frame into records and parses each one. Message types this
/// client does not handle are skipped.
pub fn decode(frame: &str) -> ConnectionResult<Vec<HubMessage>> {
    let mut messages = Vec::new();
    for record in frame.split(RECORD_SEPARATOR) {
        if record.trim().is_empty() {
            continue;
        }
        let raw: RawMessage = serde_json::from_str(record)?;
        if let Some(message) = raw.into_message()? {
            messages.push(message);
        }
    }
    Ok(messages)
}

pub fn handshake_request() -> String {
    let mut frame = String::from(r#"{"protocol":"json","version":1}"#);
    frame.push(RECORD_SEPARATOR);
    frame
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Parses the handshake reply at the start of `frame` and returns whatever
/// follows its separator, since servers may batch the first messages with it.
pub fn parse_handshake(frame: &str) -> ConnectionResult<&str> {
    let (head, rest) = frame
        .split_once(RECORD_SEPARATOR)
        .ok_or_else(|| ConnectionError::Handshake("incomplete handshake response".into()))?;
    let response: HandshakeResponse = serde_json::from_str(head)
        .map_err(|err| ConnectionError::Handshake(format!("malformed response: {err}")))?;
    match response.error {
        Some(error) => Err(ConnectionError::Handshake(error)),
        None => Ok(rest),
    }
}
