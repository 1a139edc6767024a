use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::negotiate::{negotiate, socket_url};
use super::protocol::{
    decode, encode, handshake_request, parse_handshake, HubMessage, RECORD_SEPARATOR,
};
use crate::error::{ConnectionError, ConnectionResult};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live hub socket, handed over after a successful handshake.
///
/// Messages pushed into `outgoing` are written to the socket; `incoming`
/// yields decoded server messages and closes when the socket does.
pub struct HubSession {
    pub outgoing: mpsc::UnboundedSender<HubMessage>,
    pub incoming: mpsc::UnboundedReceiver<HubMessage>,
    task: Option<JoinHandle<()>>,
}

impl HubSession {
    pub fn new(
        outgoing: mpsc::UnboundedSender<HubMessage>,
        incoming: mpsc::UnboundedReceiver<HubMessage>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outgoing,
            incoming,
            task,
        }
    }
}

impl Drop for HubSession {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Opens hub sessions. The socket connection calls this for the first
/// connect and for every reconnect attempt.
#[async_trait]
pub trait HubConnector: Send + Sync {
    async fn connect(&self) -> ConnectionResult<HubSession>;
}

/// Connects to a SignalR hub over WebSockets, negotiating first unless the
/// server is known to accept direct socket connections.
pub struct WebSocketConnector {
    http: reqwest::Client,
    hub_url: Url,
    api_key: String,
    negotiate: bool,
}

impl WebSocketConnector {
    pub fn new(hub_url: Url, api_key: impl Into<String>, negotiate: bool) -> Self {
        Self {
            http: reqwest::Client::new(),
            hub_url,
            api_key: api_key.into(),
            negotiate,
        }
    }

    async fn endpoint(&self) -> ConnectionResult<Url> {
        if self.negotiate {
            let negotiated = negotiate(&self.http, &self.hub_url, &self.api_key).await?;
            socket_url(
                &negotiated.hub_url,
                Some(&negotiated.connection_id),
                &negotiated.access_token,
            )
        } else {
            socket_url(&self.hub_url, None, &self.api_key)
        }
    }
}

#[async_trait]
impl HubConnector for WebSocketConnector {
    async fn connect(&self) -> ConnectionResult<HubSession> {
        let url = self.endpoint().await?;
        let mut request = url.as_str().into_client_request()?;
        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|err| ConnectionError::InvalidApiKey(err.to_string()))?;
        request.headers_mut().insert("X-ApiKey", api_key);

        let (mut ws_stream, _) = connect_async(request).await?;
        ws_stream.send(Message::Text(handshake_request())).await?;
        let leftover = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_handshake(&mut ws_stream))
            .await
            .map_err(|_| ConnectionError::Handshake("timed out waiting for handshake".into()))??;
        debug!(target: "notifo.hub", host = ?url.host_str(), "hub handshake completed");

        let (tx_out, rx_out) = mpsc::unbounded_channel::<HubMessage>();
        let (tx_in, rx_in) = mpsc::unbounded_channel::<HubMessage>();
        let task = tokio::spawn(handle_websocket(ws_stream, rx_out, tx_in, leftover));

        Ok(HubSession::new(tx_out, rx_in, Some(task)))
    }
}

/// Reads frames until the handshake reply is complete and returns any
/// records that arrived after it.
async fn read_handshake(ws_stream: &mut HubStream) -> ConnectionResult<String> {
    let mut buffer = String::new();
    while let Some(msg) = ws_stream.next().await {
        match msg? {
            Message::Text(text) => buffer.push_str(&text),
            Message::Binary(data) => buffer.push_str(&String::from_utf8_lossy(&data)),
            Message::Close(_) => break,
            _ => continue,
        }
        if buffer.contains(RECORD_SEPARATOR) {
            return parse_handshake(&buffer).map(str::to_string);
        }
    }
    Err(ConnectionError::Handshake(
        "socket closed during handshake".into(),
    ))
}

/// Forwards decoded records; `false` once nobody is listening anymore.
fn forward(frame: &str, tx_in: &mpsc::UnboundedSender<HubMessage>) -> bool {
    match decode(frame) {
        Ok(messages) => messages.into_iter().all(|message| tx_in.send(message).is_ok()),
        Err(err) => {
            warn!(target: "notifo.hub", error = %err, "dropping malformed hub frame");
            true
        }
    }
}

/// Pumps messages between the socket and the session channels until either
/// side goes away.
async fn handle_websocket(
    ws_stream: HubStream,
    mut rx_out: mpsc::UnboundedReceiver<HubMessage>,
    tx_in: mpsc::UnboundedSender<HubMessage>,
    leftover: String,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    if !leftover.is_empty() && !forward(&leftover, &tx_in) {
        return;
    }

    'pump: loop {
        tokio::select! {
            outgoing = rx_out.recv() => match outgoing {
                Some(message) => {
                    let frame = match encode(&message) {
                        Ok(frame) => frame,
                        Err(err) => {
                            warn!(target: "notifo.hub", error = %err, "failed to encode hub message");
                            continue 'pump;
                        }
                    };
                    if ws_sender.send(Message::Text(frame)).await.is_err() {
                        break 'pump;
                    }
                }
                None => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break 'pump;
                }
            },
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !forward(&text, &tx_in) {
                        break 'pump;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if !forward(&String::from_utf8_lossy(&data), &tx_in) {
                        break 'pump;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break 'pump,
                Some(Err(err)) => {
                    debug!(target: "notifo.hub", error = %err, "hub socket failed");
                    break 'pump;
                }
                Some(Ok(_)) => {}
            },
        }
    }
}
