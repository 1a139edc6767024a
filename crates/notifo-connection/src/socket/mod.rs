//! Persistent SignalR hub connection with automatic reconnect.

mod negotiate;
mod protocol;
mod transport;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notifo_model::{ConfirmMany, Deletion, Notification};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionState, StateCell};
use crate::error::{ConnectionError, ConnectionResult};
use crate::handlers::{ConnectivityHandler, DeleteHandler, Handlers, NotificationsHandler};

pub use protocol::{decode, encode, handshake_request, HubMessage, RECORD_SEPARATOR};
pub use transport::{HubConnector, HubSession, WebSocketConnector};

/// Delay before each reconnect attempt. Attempts past the end of the
/// schedule reuse its last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    delays: Vec<Duration>,
}

impl ReconnectPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        self.delays
            .get(attempt)
            .or_else(|| self.delays.last())
            .copied()
            .unwrap_or(Duration::from_secs(30))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(10),
            Duration::from_secs(30),
        ])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive {
    /// How often the client pings the hub.
    pub ping_interval: Duration,
    /// Silence after which the socket counts as dropped.
    pub server_timeout: Duration,
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(15),
            server_timeout: Duration::from_secs(30),
        }
    }
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<ConnectionResult<Option<Value>>>,
}

struct SocketShared {
    connector: Arc<dyn HubConnector>,
    policy: ReconnectPolicy,
    keep_alive: KeepAlive,
    handlers: Handlers,
    state: StateCell,
    outgoing: Mutex<Option<mpsc::UnboundedSender<HubMessage>>>,
    calls: Mutex<HashMap<String, PendingCall>>,
    next_invocation: AtomicU64,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl SocketShared {
    fn disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn attach(&self, session: &HubSession) {
        *self.outgoing.lock() = Some(session.outgoing.clone());
    }

    /// Forgets the current socket and fails every call still waiting on it.
    fn detach(&self, stopped: bool) {
        let calls = {
            let mut outgoing = self.outgoing.lock();
            *outgoing = None;
            std::mem::take(&mut *self.calls.lock())
        };
        for (_, call) in calls {
            let err = if stopped {
                ConnectionError::Stopped
            } else {
                ConnectionError::Disconnected
            };
            let _ = call.reply.send(Err(err));
        }
    }

    fn mark_connected(&self) {
        if self.state.transition(ConnectionState::Connected) {
            info!(target: "notifo.hub", "hub connection established");
            self.handlers.reconnected();
        }
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> ConnectionResult<Option<Value>> {
        if self.disposed() {
            return Err(ConnectionError::Stopped);
        }
        let invocation_id = self.next_invocation.fetch_add(1, Ordering::SeqCst).to_string();
        let (reply, response) = oneshot::channel();
        {
            // Registering under the outgoing lock keeps `detach` from missing
            // a call that is about to be sent.
            let outgoing = self.outgoing.lock();
            let Some(sender) = outgoing.as_ref() else {
                return Err(ConnectionError::NotConnected);
            };
            self.calls.lock().insert(
                invocation_id.clone(),
                PendingCall {
                    method: method.to_string(),
                    reply,
                },
            );
            let message = HubMessage::Invocation {
                invocation_id: Some(invocation_id.clone()),
                target: method.to_string(),
                arguments,
            };
            if sender.send(message).is_err() {
                self.calls.lock().remove(&invocation_id);
                return Err(ConnectionError::NotConnected);
            }
        }
        debug!(target: "notifo.hub", method, %invocation_id, "invoked hub method");
        response.await.unwrap_or(Err(ConnectionError::Disconnected))
    }

    /// Handles one server message. Returns `Some(allow_reconnect)` when the
    /// server closed the session.
    fn dispatch(&self, message: HubMessage) -> Option<bool> {
        match message {
            HubMessage::Invocation {
                target, arguments, ..
            } => {
                if !self.disposed() {
                    self.dispatch_invocation(&target, arguments);
                }
                None
            }
            HubMessage::Completion {
                invocation_id,
                result,
                error,
            } => {
                let call = self.calls.lock().remove(&invocation_id);
                match call {
                    Some(call) => {
                        let outcome = match error {
                            Some(message) => Err(ConnectionError::Remote {
                                method: call.method,
                                message,
                            }),
                            None => Ok(result),
                        };
                        let _ = call.reply.send(outcome);
                    }
                    None => debug!(
                        target: "notifo.hub",
                        %invocation_id, "completion for unknown invocation"
                    ),
                }
                None
            }
            HubMessage::Ping => None,
            HubMessage::Close {
                error,
                allow_reconnect,
            } => {
                info!(
                    target: "notifo.hub",
                    error = error.as_deref().unwrap_or(""),
                    allow_reconnect,
                    "hub closed the connection"
                );
                Some(allow_reconnect)
            }
        }
    }

    fn dispatch_invocation(&self, target: &str, arguments: Vec<Value>) {
        if target.eq_ignore_ascii_case("notifications") {
            if let Some(batch) = first_argument::<Vec<Notification>>(target, arguments) {
                if !batch.is_empty() {
                    self.handlers.notify(&batch, true);
                }
            }
        } else if target.eq_ignore_ascii_case("notification") {
            if let Some(notification) = first_argument::<Notification>(target, arguments) {
                self.handlers.notify(std::slice::from_ref(&notification), true);
            }
        } else if target.eq_ignore_ascii_case("notificationDeleted") {
            if let Some(deletion) = first_argument::<Deletion>(target, arguments) {
                self.handlers.delete(&deletion);
            }
        } else {
            debug!(target: "notifo.hub", method = target, "no handler for hub method");
        }
    }

    /// Reads one session until it drops. Returns whether reconnecting is
    /// allowed afterwards.
    async fn run_session(&self, session: &mut HubSession) -> bool {
        let KeepAlive {
            ping_interval,
            server_timeout,
        } = self.keep_alive;
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        let mut deadline: Pin<Box<Sleep>> = Box::pin(tokio::time::sleep(server_timeout));

        loop {
            tokio::select! {
                message = session.incoming.recv() => match message {
                    Some(message) => {
                        deadline.as_mut().reset(Instant::now() + server_timeout);
                        if let Some(allow_reconnect) = self.dispatch(message) {
                            return allow_reconnect;
                        }
                    }
                    None => {
                        debug!(target: "notifo.hub", "hub socket closed");
                        return true;
                    }
                },
                _ = ping.tick() => {
                    if session.outgoing.send(HubMessage::Ping).is_err() {
                        return true;
                    }
                }
                _ = deadline.as_mut() => {
                    warn!(
                        target: "notifo.hub",
                        timeout_ms = server_timeout.as_millis() as u64,
                        "no message from hub, treating socket as dropped"
                    );
                    return true;
                }
            }
        }
    }

    /// Tries connectors on the reconnect schedule until one succeeds or the
    /// connection is stopped.
    async fn reconnect(&self) -> Option<HubSession> {
        let mut attempt = 0;
        loop {
            let delay = self.policy.delay(attempt);
            attempt += 1;
            debug!(target: "notifo.hub", attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
            tokio::time::sleep(delay).await;
            if self.disposed() {
                return None;
            }
            match self.connector.connect().await {
                Ok(session) => return Some(session),
                Err(err) => warn!(target: "notifo.hub", attempt, error = %err, "reconnect failed"),
            }
        }
    }
}

fn first_argument<T: DeserializeOwned>(method: &str, arguments: Vec<Value>) -> Option<T> {
    let Some(argument) = arguments.into_iter().next() else {
        warn!(target: "notifo.hub", method, "hub invocation without arguments");
        return None;
    };
    match serde_json::from_value(argument) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(target: "notifo.hub", method, error = %err, "malformed hub payload");
            None
        }
    }
}

async fn supervise(shared: Arc<SocketShared>, mut session: HubSession) {
    loop {
        let allow_reconnect = shared.run_session(&mut session).await;
        drop(session);
        shared.detach(false);
        if shared.disposed() {
            break;
        }
        if shared.state.transition(ConnectionState::Disconnected) {
            warn!(target: "notifo.hub", "hub connection lost");
            shared.handlers.disconnected();
        }
        if !allow_reconnect {
            info!(target: "notifo.hub", "hub does not allow reconnecting");
            break;
        }

        session = match shared.reconnect().await {
            Some(session) => session,
            None => break,
        };
        if shared.disposed() {
            break;
        }
        shared.attach(&session);
        shared.mark_connected();
    }
    debug!(target: "notifo.hub", "hub supervisor finished");
}

/// SignalR hub transport. Server pushes are always live updates; calls go
/// straight to the hub and resolve with its completion.
pub struct SocketConnection {
    shared: Arc<SocketShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketConnection {
    pub fn new(connector: Arc<dyn HubConnector>) -> Self {
        Self::with_options(connector, ReconnectPolicy::default(), KeepAlive::default())
    }

    pub fn with_options(
        connector: Arc<dyn HubConnector>,
        policy: ReconnectPolicy,
        keep_alive: KeepAlive,
    ) -> Self {
        Self {
            shared: Arc::new(SocketShared {
                connector,
                policy,
                keep_alive,
                handlers: Handlers::new(),
                state: StateCell::new(),
                outgoing: Mutex::new(None),
                calls: Mutex::new(HashMap::new()),
                next_invocation: AtomicU64::new(0),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connection for SocketConnection {
    /// Connects once. A failed first connect is returned to the caller and
    /// leaves the connection `Pending`, so `start` may be retried.
    async fn start(&self) -> ConnectionResult<()> {
        if self.shared.disposed() {
            return Err(ConnectionError::Stopped);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let session = match self.shared.connector.connect().await {
            Ok(session) => session,
            Err(err) => {
                warn!(target: "notifo.hub", error = %err, "hub connect failed");
                self.shared.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if self.shared.disposed() {
            return Err(ConnectionError::Stopped);
        }

        self.shared.attach(&session);
        self.shared.mark_connected();
        let handle = tokio::spawn(supervise(Arc::clone(&self.shared), session));
        let mut task = self.task.lock();
        if self.shared.disposed() {
            handle.abort();
        } else {
            *task = Some(handle);
        }
        Ok(())
    }

    fn on_notifications(&self, handler: NotificationsHandler) {
        self.shared.handlers.add_notifications(handler);
    }

    fn on_delete(&self, handler: DeleteHandler) {
        self.shared.handlers.add_delete(handler);
    }

    fn on_reconnected(&self, handler: ConnectivityHandler) {
        self.shared.handlers.add_reconnected(handler);
    }

    fn on_disconnected(&self, handler: ConnectivityHandler) {
        self.shared.handlers.add_disconnected(handler);
    }

    async fn delete(&self, id: &str) -> ConnectionResult<()> {
        self.shared
            .invoke("delete", vec![Value::String(id.to_string())])
            .await
            .map(|_| ())
    }

    async fn confirm_many(&self, seen: &[String], confirmed: Option<&str>) -> ConnectionResult<()> {
        let payload = serde_json::to_value(ConfirmMany {
            confirmed: confirmed.map(str::to_string),
            seen: seen.to_vec(),
        })?;
        self.shared.invoke("confirmMany", vec![payload]).await.map(|_| ())
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn stop(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        if self.shared.state.stop() {
            debug!(target: "notifo.hub", "hub connection stopped");
        }
        self.shared.handlers.clear();
        self.shared.detach(true);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for SocketConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
