use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::ConnectionResult;
use crate::handlers::{ConnectivityHandler, DeleteHandler, NotificationsHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Pending,
    Connected,
    Disconnected,
    Stopped,
}

/// Delivery channel between one widget and the server.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Begins delivery. Calling it again on a running connection is a no-op.
    async fn start(&self) -> ConnectionResult<()>;

    fn on_notifications(&self, handler: NotificationsHandler);

    fn on_delete(&self, handler: DeleteHandler);

    fn on_reconnected(&self, handler: ConnectivityHandler);

    fn on_disconnected(&self, handler: ConnectivityHandler);

    /// Requests server-side deletion of a notification.
    async fn delete(&self, id: &str) -> ConnectionResult<()>;

    /// Marks `seen` as seen and, optionally, `confirmed` as confirmed.
    async fn confirm_many(&self, seen: &[String], confirmed: Option<&str>) -> ConnectionResult<()>;

    fn state(&self) -> ConnectionState;

    /// Tears the connection down: background work stops and handlers are
    /// dropped. Idempotent.
    fn stop(&self);
}

/// Connection state with edge detection for the connectivity callbacks.
pub(crate) struct StateCell {
    state: Mutex<ConnectionState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ConnectionState::Pending),
        }
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Moves to `next`, returning `true` only when the state actually changed.
    /// `Stopped` is terminal.
    pub(crate) fn transition(&self, next: ConnectionState) -> bool {
        let mut state = self.state.lock();
        if *state == ConnectionState::Stopped || *state == next {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn stop(&self) -> bool {
        self.transition(ConnectionState::Stopped)
    }
}
