use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("invalid api key: {0}")]
    InvalidApiKey(String),
    #[error("negotiation failed: {0}")]
    Negotiate(String),
    #[error("hub handshake failed: {0}")]
    Handshake(String),
    #[error("hub method `{method}` failed: {message}")]
    Remote { method: String, message: String },
    #[error("not connected")]
    NotConnected,
    #[error("connection dropped before the call completed")]
    Disconnected,
    #[error("connection stopped")]
    Stopped,
}

pub type ConnectionResult<T> = Result<T, ConnectionError>;
