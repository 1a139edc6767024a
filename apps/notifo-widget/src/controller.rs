use std::sync::Arc;

use anyhow::Context;
use job_queue::JobQueue;
use notifo_connection::{
    build_connection, Connection, ConnectionOptions, ConnectionResult, ConnectionState,
    ConnectivityHandler, Deduplicated,
};
use notifo_model::{Deletion, Notification};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Called for every non-silent notification of a live update.
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Called with `true` on each transition into connected and `false` on each
/// transition out of it.
pub type ConnectivityCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Application hooks passed to [`WidgetController::mount`].
#[derive(Clone, Default)]
pub struct WidgetCallbacks {
    pub on_notification: Option<NotificationCallback>,
    pub on_connectivity: Option<ConnectivityCallback>,
}

impl WidgetCallbacks {
    pub fn on_notification(mut self, callback: NotificationCallback) -> Self {
        self.on_notification = Some(callback);
        self
    }

    pub fn on_connectivity(mut self, callback: ConnectivityCallback) -> Self {
        self.on_connectivity = Some(callback);
        self
    }
}

#[derive(Debug, Default)]
struct ViewState {
    notifications: Vec<Notification>,
    is_connected: bool,
}

impl ViewState {
    /// Replaces or inserts by id and keeps the list newest first.
    fn merge(&mut self, batch: &[Notification]) {
        for incoming in batch {
            match self
                .notifications
                .iter_mut()
                .find(|existing| existing.id == incoming.id)
            {
                Some(existing) => *existing = incoming.clone(),
                None => self.notifications.push(incoming.clone()),
            }
        }
        self.notifications
            .sort_by(|a, b| b.created.cmp(&a.created));
    }

    fn remove(&mut self, id: &str) {
        self.notifications.retain(|n| n.id != id);
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Notification> {
        self.notifications.iter_mut().find(|n| n.id == id)
    }
}

/// Flags of one record before an optimistic change, keyed by the version
/// they belonged to.
#[derive(Debug, Clone)]
struct Snapshot {
    id: String,
    updated: String,
    is_seen: bool,
    is_confirmed: bool,
}

/// Local view of one user's notifications, kept in sync over a
/// de-duplicated connection.
///
/// Outgoing calls run on the runtime the controller was mounted in, so
/// `confirm`, `see` and `delete` may be called from any thread.
pub struct WidgetController {
    connection: Arc<dyn Connection>,
    view: Arc<Mutex<ViewState>>,
    queue: JobQueue,
}

impl WidgetController {
    /// Builds the transport for `options` and mounts on it.
    pub async fn mount(
        options: &ConnectionOptions,
        callbacks: WidgetCallbacks,
    ) -> ConnectionResult<Self> {
        let connection = build_connection(options)?;
        info!(
            target: "notifo.widget",
            mode = %options.mode,
            api_url = %options.api_url,
            "mounting widget"
        );
        Self::mount_on(connection, callbacks).await
    }

    /// Wraps `connection` in the de-duplication layer, registers the view
    /// handlers and starts it.
    ///
    /// A failed start is returned only when the transport will not retry on
    /// its own; otherwise the widget mounts disconnected and catches up once
    /// the transport recovers.
    pub async fn mount_on(
        connection: Arc<dyn Connection>,
        callbacks: WidgetCallbacks,
    ) -> ConnectionResult<Self> {
        let WidgetCallbacks {
            on_notification,
            on_connectivity,
        } = callbacks;
        let connection: Arc<dyn Connection> = Arc::new(Deduplicated::new(connection));
        let view = Arc::new(Mutex::new(ViewState::default()));

        {
            let view = Arc::clone(&view);
            connection.on_notifications(Arc::new(move |batch: &[Notification], is_update: bool| {
                view.lock().merge(batch);
                debug!(
                    target: "notifo.widget",
                    count = batch.len(),
                    is_update,
                    "merged notifications"
                );
                if let (true, Some(callback)) = (is_update, on_notification.as_ref()) {
                    for notification in batch.iter().filter(|n| !n.silent) {
                        callback(notification);
                    }
                }
            }));
        }
        {
            let view = Arc::clone(&view);
            connection.on_delete(Arc::new(move |deletion: &Deletion| {
                view.lock().remove(&deletion.id);
            }));
        }
        for connected in [true, false] {
            let view = Arc::clone(&view);
            let on_connectivity = on_connectivity.clone();
            let handler: ConnectivityHandler = Arc::new(move || {
                view.lock().is_connected = connected;
                if let Some(callback) = on_connectivity.as_ref() {
                    callback(connected);
                }
            });
            if connected {
                connection.on_reconnected(handler);
            } else {
                connection.on_disconnected(handler);
            }
        }

        if let Err(err) = connection.start().await {
            if connection.state() == ConnectionState::Pending {
                connection.stop();
                return Err(err);
            }
            warn!(target: "notifo.widget", error = %err, "initial connect failed, retrying in background");
        }
        view.lock().is_connected = connection.state() == ConnectionState::Connected;

        Ok(Self {
            connection,
            view,
            queue: JobQueue::new(),
        })
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.view.lock().notifications.clone()
    }

    pub fn unseen_count(&self) -> usize {
        self.view
            .lock()
            .notifications
            .iter()
            .filter(|n| !n.is_seen)
            .count()
    }

    pub fn is_connected(&self) -> bool {
        self.view.lock().is_connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Marks the notification confirmed (and seen) locally and tells the
    /// server. The local change is undone if the call fails.
    pub fn confirm(&self, notification: &Notification) {
        let snapshot = self.apply_locally(&notification.id, |n| {
            n.is_confirmed = true;
            n.is_seen = true;
        });
        let id = notification.id.clone();
        self.submit("confirm", snapshot, move |connection| async move {
            connection.confirm_many(&[], Some(&id)).await
        });
    }

    /// Marks the notification seen locally and tells the server.
    pub fn see(&self, notification: &Notification) {
        let snapshot = self.apply_locally(&notification.id, |n| n.is_seen = true);
        let id = notification.id.clone();
        self.submit("see", snapshot, move |connection| async move {
            connection.confirm_many(&[id], None).await
        });
    }

    /// Asks the server to delete the notification. The view changes only
    /// when the resulting deletion event arrives.
    pub fn delete(&self, notification: &Notification) {
        let id = notification.id.clone();
        self.submit("delete", None, move |connection| async move {
            connection.delete(&id).await
        });
    }

    /// Resolves once every submitted call has completed.
    pub async fn settle(&self) {
        self.queue.idle().await;
    }

    /// Stops the connection. Queued calls still run and fail with `Stopped`.
    pub fn unmount(&self) {
        self.connection.stop();
        self.view.lock().is_connected = false;
        info!(target: "notifo.widget", "widget unmounted");
    }

    fn apply_locally(&self, id: &str, change: impl FnOnce(&mut Notification)) -> Option<Snapshot> {
        let mut view = self.view.lock();
        let record = view.find_mut(id)?;
        let snapshot = Snapshot {
            id: record.id.clone(),
            updated: record.updated.clone(),
            is_seen: record.is_seen,
            is_confirmed: record.is_confirmed,
        };
        change(record);
        Some(snapshot)
    }

    fn submit<F, Fut>(&self, action: &'static str, snapshot: Option<Snapshot>, call: F)
    where
        F: FnOnce(Arc<dyn Connection>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ConnectionResult<()>> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        let view = Arc::clone(&self.view);
        self.queue.enqueue(move || async move {
            let outcome = call(connection).await;
            if outcome.is_err() {
                if let Some(snapshot) = snapshot {
                    rollback(&view, &snapshot);
                }
            }
            outcome.with_context(|| format!("{action} failed"))
        });
    }
}

/// Restores the flags unless the record has moved on to another version.
fn rollback(view: &Mutex<ViewState>, snapshot: &Snapshot) {
    let mut view = view.lock();
    match view.find_mut(&snapshot.id) {
        Some(record) if record.updated == snapshot.updated => {
            record.is_seen = snapshot.is_seen;
            record.is_confirmed = snapshot.is_confirmed;
            debug!(target: "notifo.widget", id = %snapshot.id, "rolled back optimistic update");
        }
        _ => debug!(
            target: "notifo.widget",
            id = %snapshot.id,
            "record changed since the call, keeping server state"
        ),
    }
}

impl Drop for WidgetController {
    fn drop(&mut self) {
        self.connection.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use notifo_connection::{
        ConnectionError, ConnectivityHandler, DeleteHandler, Handlers, NotificationsHandler,
    };
    use std::sync::atomic::{AtomicBool, Ordering};
    use test_timeout::tokio_timeout_test;
    use time::OffsetDateTime;

    /// Connection driven by the test; records outgoing calls.
    #[derive(Default)]
    struct StubConnection {
        handlers: Handlers,
        calls: Mutex<Vec<String>>,
        fail_calls: AtomicBool,
        fail_start: AtomicBool,
        state: Mutex<Option<ConnectionState>>,
    }

    impl StubConnection {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn call(&self, description: String) -> ConnectionResult<()> {
            self.calls.lock().push(description);
            if self.fail_calls.load(Ordering::SeqCst) {
                Err(ConnectionError::Disconnected)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn start(&self) -> ConnectionResult<()> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ConnectionError::NotConnected);
            }
            *self.state.lock() = Some(ConnectionState::Connected);
            Ok(())
        }

        fn on_notifications(&self, handler: NotificationsHandler) {
            self.handlers.add_notifications(handler);
        }

        fn on_delete(&self, handler: DeleteHandler) {
            self.handlers.add_delete(handler);
        }

        fn on_reconnected(&self, handler: ConnectivityHandler) {
            self.handlers.add_reconnected(handler);
        }

        fn on_disconnected(&self, handler: ConnectivityHandler) {
            self.handlers.add_disconnected(handler);
        }

        async fn delete(&self, id: &str) -> ConnectionResult<()> {
            self.call(format!("delete {id}"))
        }

        async fn confirm_many(&self, seen: &[String], confirmed: Option<&str>) -> ConnectionResult<()> {
            self.call(format!("confirm seen={seen:?} confirmed={confirmed:?}"))
        }

        fn state(&self) -> ConnectionState {
            self.state.lock().unwrap_or(ConnectionState::Pending)
        }

        fn stop(&self) {
            *self.state.lock() = Some(ConnectionState::Stopped);
            self.handlers.clear();
        }
    }

    fn notification(id: &str, created: i64, updated: &str) -> Notification {
        Notification {
            id: id.to_string(),
            subject: format!("subject {id}"),
            body: None,
            image_small: None,
            image_large: None,
            link_url: None,
            link_text: None,
            confirm_text: None,
            confirm_url: None,
            tracking_url: None,
            is_seen: false,
            is_confirmed: false,
            silent: false,
            created: OffsetDateTime::from_unix_timestamp(created).unwrap(),
            updated: updated.to_string(),
        }
    }

    fn ids(controller: &WidgetController) -> Vec<String> {
        controller.notifications().into_iter().map(|n| n.id).collect()
    }

    async fn mounted() -> (Arc<StubConnection>, WidgetController, Arc<Mutex<Vec<String>>>) {
        let stub = Arc::new(StubConnection::default());
        let announced: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let callback: NotificationCallback = {
            let announced = announced.clone();
            Arc::new(move |n: &Notification| announced.lock().push(n.id.clone()))
        };
        let controller = WidgetController::mount_on(stub.clone(), WidgetCallbacks::default().on_notification(callback))
            .await
            .unwrap();
        (stub, controller, announced)
    }

    #[tokio_timeout_test(5)]
    async fn snapshot_is_silent_and_updates_are_announced() {
        let (stub, controller, announced) = mounted().await;
        assert!(controller.is_connected());

        stub.handlers
            .notify(&[notification("a", 10, "1"), notification("b", 20, "1")], false);
        assert!(announced.lock().is_empty());
        assert_eq!(ids(&controller), ["b", "a"]);

        let mut quiet = notification("q", 40, "1");
        quiet.silent = true;
        stub.handlers
            .notify(&[notification("c", 30, "1"), quiet], true);
        assert_eq!(announced.lock().as_slice(), ["c"]);
        assert_eq!(ids(&controller), ["q", "c", "b", "a"]);
        assert_eq!(controller.unseen_count(), 4);
    }

    #[tokio_timeout_test(5)]
    async fn merges_by_id_and_drops_stale_versions() {
        let (stub, controller, _) = mounted().await;

        stub.handlers.notify(&[notification("a", 10, "2")], false);
        let mut newer = notification("a", 10, "3");
        newer.is_seen = true;
        stub.handlers.notify(&[newer], true);
        let mut stale = notification("a", 10, "1");
        stale.subject = "stale".into();
        stub.handlers.notify(&[stale], true);

        let list = controller.notifications();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].updated, "3");
        assert_eq!(controller.unseen_count(), 0);
    }

    #[tokio_timeout_test(5)]
    async fn deletions_remove_and_tombstone() {
        let (stub, controller, announced) = mounted().await;
        stub.handlers
            .notify(&[notification("a", 10, "1"), notification("b", 20, "1")], false);

        stub.handlers.delete(&Deletion::new("a"));
        stub.handlers.notify(&[notification("a", 10, "9")], true);

        assert_eq!(ids(&controller), ["b"]);
        assert!(announced.lock().is_empty());
    }

    #[tokio_timeout_test(5)]
    async fn confirm_and_see_are_optimistic_and_serialised() {
        let (stub, controller, _) = mounted().await;
        stub.handlers
            .notify(&[notification("a", 10, "1"), notification("b", 20, "1")], false);
        let list = controller.notifications();

        controller.confirm(&list[1]);
        controller.see(&list[0]);
        controller.delete(&list[0]);

        let local = controller.notifications();
        assert!(local[1].is_confirmed && local[1].is_seen);
        assert!(local[0].is_seen && !local[0].is_confirmed);
        assert_eq!(controller.unseen_count(), 0);

        controller.settle().await;
        assert_eq!(
            stub.calls(),
            [
                "confirm seen=[] confirmed=Some(\"a\")",
                "confirm seen=[\"b\"] confirmed=None",
                "delete b",
            ]
        );
        assert_eq!(ids(&controller), ["b", "a"]);
    }

    #[tokio_timeout_test(5)]
    async fn failed_calls_roll_back_unless_record_changed() {
        let (stub, controller, _) = mounted().await;
        stub.handlers
            .notify(&[notification("a", 10, "1"), notification("b", 20, "1")], false);
        stub.fail_calls.store(true, Ordering::SeqCst);
        let list = controller.notifications();

        controller.see(&list[0]);
        controller.settle().await;
        assert!(!controller.notifications()[0].is_seen);

        controller.confirm(&list[1]);
        let mut server_copy = notification("a", 10, "2");
        server_copy.is_confirmed = true;
        server_copy.is_seen = true;
        stub.handlers.notify(&[server_copy], true);
        controller.settle().await;

        let a = controller
            .notifications()
            .into_iter()
            .find(|n| n.id == "a")
            .unwrap();
        assert!(a.is_confirmed);
    }

    #[tokio_timeout_test(5)]
    async fn tracks_connectivity_and_unmounts() {
        let (stub, controller, _) = mounted().await;
        stub.handlers.disconnected();
        assert!(!controller.is_connected());
        stub.handlers.reconnected();
        assert!(controller.is_connected());

        controller.unmount();
        assert!(!controller.is_connected());
        assert_eq!(controller.connection_state(), ConnectionState::Stopped);
        stub.handlers.notify(&[notification("a", 10, "1")], false);
        assert!(controller.notifications().is_empty());
    }

    #[tokio_timeout_test(5)]
    async fn reports_every_connectivity_edge() {
        let stub = Arc::new(StubConnection::default());
        let edges: Arc<Mutex<Vec<bool>>> = Arc::new(Mutex::new(Vec::new()));
        let callbacks = WidgetCallbacks::default().on_connectivity({
            let edges = edges.clone();
            Arc::new(move |connected: bool| edges.lock().push(connected))
        });
        let controller = WidgetController::mount_on(stub.clone(), callbacks)
            .await
            .unwrap();

        stub.handlers.disconnected();
        stub.handlers.reconnected();
        stub.handlers.disconnected();

        assert_eq!(edges.lock().as_slice(), [false, true, false]);
        assert!(!controller.is_connected());
    }

    #[tokio_timeout_test(5)]
    async fn calls_from_plain_threads_run_on_the_mount_runtime() {
        let (stub, controller, _) = mounted().await;
        stub.handlers.notify(&[notification("a", 10, "1")], false);
        let first = controller.notifications()[0].clone();

        std::thread::scope(|scope| {
            scope.spawn(|| controller.see(&first));
        });
        controller.settle().await;

        assert_eq!(stub.calls(), ["confirm seen=[\"a\"] confirmed=None"]);
        assert_eq!(controller.unseen_count(), 0);
    }

    #[tokio_timeout_test(5)]
    async fn mount_fails_when_transport_gives_up() {
        let stub = Arc::new(StubConnection::default());
        stub.fail_start.store(true, Ordering::SeqCst);

        let result = WidgetController::mount_on(stub.clone(), WidgetCallbacks::default()).await;
        assert!(matches!(result, Err(ConnectionError::NotConnected)));
        assert_eq!(stub.state(), ConnectionState::Stopped);
    }
}
