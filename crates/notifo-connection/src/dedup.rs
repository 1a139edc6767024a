use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use notifo_model::{Deletion, Notification};
use parking_lot::Mutex;
use tracing::trace;

use crate::connection::{Connection, ConnectionState};
use crate::error::ConnectionResult;
use crate::handlers::{ConnectivityHandler, DeleteHandler, Handlers, NotificationsHandler};

/// Versions and tombstones seen during this wrapper's lifetime.
#[derive(Debug, Default)]
struct Tracking {
    deletions: HashSet<String>,
    received: HashMap<String, String>,
}

impl Tracking {
    /// Tombstoned ids are rejected outright. Otherwise the incoming version is
    /// recorded even when it loses, so the next update is compared against
    /// the latest arrival rather than the latest acceptance.
    fn accept_notification(&mut self, notification: &Notification) -> bool {
        if self.deletions.contains(&notification.id) {
            return false;
        }
        let previous = self
            .received
            .insert(notification.id.clone(), notification.updated.clone());
        match previous {
            None => true,
            Some(previous) => notification.updated.as_str() > previous.as_str(),
        }
    }

    fn accept_deletion(&mut self, deletion: &Deletion) -> bool {
        self.deletions.insert(deletion.id.clone())
    }
}

/// Filters stale updates and repeated deletions out of another connection.
///
/// The wrapper installs one filtering handler on the inner connection when it
/// is built and fans accepted events out to its own handlers, so every
/// handler registered here sees the same filtered stream. Start, stop and the
/// outgoing calls pass straight through.
pub struct Deduplicated<C: ?Sized = dyn Connection> {
    inner: Arc<C>,
    tracking: Arc<Mutex<Tracking>>,
    handlers: Arc<Handlers>,
}

impl<C: Connection + ?Sized + 'static> Deduplicated<C> {
    pub fn new(inner: Arc<C>) -> Self {
        let tracking = Arc::new(Mutex::new(Tracking::default()));
        let handlers = Arc::new(Handlers::new());

        {
            let tracking = Arc::clone(&tracking);
            let handlers = Arc::clone(&handlers);
            inner.on_notifications(Arc::new(move |batch: &[Notification], is_update: bool| {
                let fresh: Vec<Notification> = {
                    let mut tracking = tracking.lock();
                    batch
                        .iter()
                        .filter(|notification| tracking.accept_notification(notification))
                        .cloned()
                        .collect()
                };
                if fresh.len() < batch.len() {
                    trace!(
                        target: "notifo.dedup",
                        received = batch.len(),
                        accepted = fresh.len(),
                        "dropped stale notifications"
                    );
                }
                if !fresh.is_empty() {
                    handlers.notify(&fresh, is_update);
                }
            }));
        }

        {
            let tracking = Arc::clone(&tracking);
            let handlers = Arc::clone(&handlers);
            inner.on_delete(Arc::new(move |deletion: &Deletion| {
                let first = tracking.lock().accept_deletion(deletion);
                if first {
                    handlers.delete(deletion);
                } else {
                    trace!(target: "notifo.dedup", id = %deletion.id, "dropped repeated deletion");
                }
            }));
        }

        Self {
            inner,
            tracking,
            handlers,
        }
    }

    pub fn inner(&self) -> &Arc<C> {
        &self.inner
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.tracking.lock().deletions.contains(id)
    }
}

#[async_trait]
impl<C: Connection + ?Sized + 'static> Connection for Deduplicated<C> {
    async fn start(&self) -> ConnectionResult<()> {
        self.inner.start().await
    }

    fn on_notifications(&self, handler: NotificationsHandler) {
        self.handlers.add_notifications(handler);
    }

    fn on_delete(&self, handler: DeleteHandler) {
        self.handlers.add_delete(handler);
    }

    fn on_reconnected(&self, handler: ConnectivityHandler) {
        self.inner.on_reconnected(handler);
    }

    fn on_disconnected(&self, handler: ConnectivityHandler) {
        self.inner.on_disconnected(handler);
    }

    async fn delete(&self, id: &str) -> ConnectionResult<()> {
        self.inner.delete(id).await
    }

    async fn confirm_many(&self, seen: &[String], confirmed: Option<&str>) -> ConnectionResult<()> {
        self.inner.confirm_many(seen, confirmed).await
    }

    fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    fn stop(&self) {
        self.inner.stop();
        self.handlers.clear();
    }
}
