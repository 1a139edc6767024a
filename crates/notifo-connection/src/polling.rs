use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use notifo_model::{Deletion, PollRequest, PollResponse};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{Connection, ConnectionState, StateCell};
use crate::error::{ConnectionError, ConnectionResult};
use crate::factory::join_api;
use crate::handlers::{ConnectivityHandler, DeleteHandler, Handlers, NotificationsHandler};

const POLL_PATH: &str = "api/me/web/poll";

/// One round trip against the poll endpoint.
#[async_trait]
pub trait PollApi: Send + Sync {
    async fn poll(&self, request: &PollRequest) -> ConnectionResult<PollResponse>;
}

/// `POST {apiUrl}/api/me/web/poll` over reqwest.
#[derive(Clone)]
pub struct HttpPollApi {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
}

impl HttpPollApi {
    pub fn new(api_url: &Url, api_key: impl Into<String>) -> ConnectionResult<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            endpoint: join_api(api_url, POLL_PATH)?,
            api_key: api_key.into(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl PollApi for HttpPollApi {
    async fn poll(&self, request: &PollRequest) -> ConnectionResult<PollResponse> {
        let res = self
            .http
            .post(self.endpoint.clone())
            .header("X-ApiKey", &self.api_key)
            .json(request)
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ConnectionError::UnexpectedStatus { status, body });
        }

        let bytes = res.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Acknowledgements waiting for the next poll, each list duplicate-free and
/// in the order the ids were queued.
#[derive(Debug, Default)]
struct PendingAcks {
    seen: Vec<String>,
    confirmed: Vec<String>,
    deleted: Vec<String>,
}

impl PendingAcks {
    fn request(&self, token: Option<String>) -> PollRequest {
        PollRequest {
            token,
            confirmed: self.confirmed.clone(),
            seen: self.seen.clone(),
            deleted: self.deleted.clone(),
        }
    }

    /// Drops what `sent` delivered; ids queued while it was in flight stay.
    fn acknowledge(&mut self, sent: &PollRequest) {
        self.seen.retain(|id| !sent.seen.contains(id));
        self.confirmed.retain(|id| !sent.confirmed.contains(id));
        self.deleted.retain(|id| !sent.deleted.contains(id));
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|existing| existing == id) {
        list.push(id.to_string());
    }
}

struct PollShared {
    api: Arc<dyn PollApi>,
    interval: Duration,
    handlers: Handlers,
    state: StateCell,
    pending: Mutex<PendingAcks>,
    token: Mutex<Option<String>>,
    delivered: AtomicBool,
    started: AtomicBool,
    disposed: AtomicBool,
}

impl PollShared {
    fn disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    async fn poll_once(&self) -> ConnectionResult<()> {
        let request = {
            let token = self.token.lock().clone();
            self.pending.lock().request(token)
        };
        if request.has_acknowledgements() {
            debug!(
                target: "notifo.poll",
                seen = request.seen.len(),
                confirmed = request.confirmed.len(),
                deleted = request.deleted.len(),
                "flushing acknowledgements"
            );
        }

        match self.api.poll(&request).await {
            Ok(response) => {
                self.apply(&request, response);
                Ok(())
            }
            Err(err) => {
                warn!(target: "notifo.poll", error = %err, "poll failed");
                if self.state.transition(ConnectionState::Disconnected) {
                    self.handlers.disconnected();
                }
                Err(err)
            }
        }
    }

    fn apply(&self, sent: &PollRequest, response: PollResponse) {
        if self.disposed() {
            return;
        }
        let PollResponse {
            continuation_token,
            notifications,
            deletions,
        } = response;

        *self.token.lock() = Some(continuation_token);
        self.pending.lock().acknowledge(sent);

        if self.state.transition(ConnectionState::Connected) {
            info!(target: "notifo.poll", "poll connection established");
            self.handlers.reconnected();
        }

        for id in deletions {
            self.handlers.delete(&Deletion { id });
        }

        let is_update = self.delivered.swap(true, Ordering::SeqCst);
        if !notifications.is_empty() {
            debug!(
                target: "notifo.poll",
                count = notifications.len(),
                is_update,
                "received notifications"
            );
            self.handlers.notify(&notifications, is_update);
        }
    }
}

/// Polling transport: one request at a time, rescheduled after
/// `interval` on success and `2 x interval` on failure until stopped.
pub struct PollingConnection {
    shared: Arc<PollShared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingConnection {
    pub fn new(api: Arc<dyn PollApi>, interval: Duration) -> Self {
        Self {
            shared: Arc::new(PollShared {
                api,
                interval,
                handlers: Handlers::new(),
                state: StateCell::new(),
                pending: Mutex::new(PendingAcks::default()),
                token: Mutex::new(None),
                delivered: AtomicBool::new(false),
                started: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn continuation_token(&self) -> Option<String> {
        self.shared.token.lock().clone()
    }
}

async fn run_loop(shared: Arc<PollShared>, first: oneshot::Sender<ConnectionResult<()>>) {
    let mut first = Some(first);
    loop {
        if shared.disposed() {
            break;
        }
        let outcome = shared.poll_once().await;
        let delay = if outcome.is_ok() {
            shared.interval
        } else {
            shared.interval * 2
        };
        if let Some(first) = first.take() {
            let _ = first.send(outcome);
        }
        if shared.disposed() {
            break;
        }
        tokio::time::sleep(delay).await;
    }
    debug!(target: "notifo.poll", "poll loop finished");
}

#[async_trait]
impl Connection for PollingConnection {
    /// Resolves with the outcome of the first poll. A failed first poll still
    /// leaves the loop retrying in the background.
    async fn start(&self) -> ConnectionResult<()> {
        if self.shared.disposed() {
            return Err(ConnectionError::Stopped);
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let (first_tx, first_rx) = oneshot::channel();
        let handle = tokio::spawn(run_loop(Arc::clone(&self.shared), first_tx));
        *self.task.lock() = Some(handle);

        first_rx.await.unwrap_or(Err(ConnectionError::Stopped))
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

    /// Removes the notification locally right away and tells the server with
    /// the next poll.
    async fn delete(&self, id: &str) -> ConnectionResult<()> {
        if self.shared.disposed() {
            return Err(ConnectionError::Stopped);
        }
        push_unique(&mut self.shared.pending.lock().deleted, id);
        self.shared.handlers.delete(&Deletion::new(id));
        Ok(())
    }

    async fn confirm_many(&self, seen: &[String], confirmed: Option<&str>) -> ConnectionResult<()> {
        if self.shared.disposed() {
            return Err(ConnectionError::Stopped);
        }
        let mut pending = self.shared.pending.lock();
        for id in seen {
            push_unique(&mut pending.seen, id);
        }
        if let Some(id) = confirmed {
            push_unique(&mut pending.confirmed, id);
        }
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn stop(&self) {
        self.shared.disposed.store(true, Ordering::SeqCst);
        if self.shared.state.stop() {
            debug!(target: "notifo.poll", "poll connection stopped");
        }
        self.shared.handlers.clear();
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for PollingConnection {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}
