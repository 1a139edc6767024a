use std::sync::Arc;

use notifo_model::{Deletion, Notification};
use parking_lot::RwLock;

/// Receives a batch of notifications and whether it is a live update (`true`)
/// or the initial snapshot (`false`).
pub type NotificationsHandler = Arc<dyn Fn(&[Notification], bool) + Send + Sync>;
pub type DeleteHandler = Arc<dyn Fn(&Deletion) + Send + Sync>;
pub type ConnectivityHandler = Arc<dyn Fn() + Send + Sync>;

/// Registered callbacks of one connection.
///
/// Dispatch works on a snapshot of the list, so a handler may register more
/// handlers without deadlocking; those only see later events.
#[derive(Default)]
pub struct Handlers {
    notifications: RwLock<Vec<NotificationsHandler>>,
    deletions: RwLock<Vec<DeleteHandler>>,
    reconnected: RwLock<Vec<ConnectivityHandler>>,
    disconnected: RwLock<Vec<ConnectivityHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_notifications(&self, handler: NotificationsHandler) {
        self.notifications.write().push(handler);
    }

    pub fn add_delete(&self, handler: DeleteHandler) {
        self.deletions.write().push(handler);
    }

    pub fn add_reconnected(&self, handler: ConnectivityHandler) {
        self.reconnected.write().push(handler);
    }

    pub fn add_disconnected(&self, handler: ConnectivityHandler) {
        self.disconnected.write().push(handler);
    }

    pub fn notify(&self, batch: &[Notification], is_update: bool) {
        let handlers = self.notifications.read().clone();
        for handler in handlers {
            handler(batch, is_update);
        }
    }

    pub fn delete(&self, deletion: &Deletion) {
        let handlers = self.deletions.read().clone();
        for handler in handlers {
            handler(deletion);
        }
    }

    pub fn reconnected(&self) {
        let handlers = self.reconnected.read().clone();
        for handler in handlers {
            handler();
        }
    }

    pub fn disconnected(&self) {
        let handlers = self.disconnected.read().clone();
        for handler in handlers {
            handler();
        }
    }

    pub fn clear(&self) {
        self.notifications.write().clear();
        self.deletions.write().clear();
        self.reconnected.write().clear();
        self.disconnected.write().clear();
    }
}
