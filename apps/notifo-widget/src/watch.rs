//! The `watch` command loop: prints live notifications and connectivity
//! edges until shut down.

use std::future::Future;
use std::io::Write;
use std::sync::Arc;

use notifo_model::Notification;
use tokio::sync::mpsc;

use crate::controller::{ConnectivityCallback, NotificationCallback, WidgetCallbacks};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Notification(Notification),
    Connectivity(bool),
}

/// Callbacks that forward every controller event into the returned channel.
pub fn forwarding_callbacks() -> (WidgetCallbacks, mpsc::UnboundedReceiver<WatchEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let on_notification: NotificationCallback = {
        let tx = tx.clone();
        Arc::new(move |notification: &Notification| {
            let _ = tx.send(WatchEvent::Notification(notification.clone()));
        })
    };
    let on_connectivity: ConnectivityCallback = Arc::new(move |connected: bool| {
        let _ = tx.send(WatchEvent::Connectivity(connected));
    });
    let callbacks = WidgetCallbacks::default()
        .on_notification(on_notification)
        .on_connectivity(on_connectivity);
    (callbacks, rx)
}

/// Writes one line per event until `shutdown` resolves or every sender is
/// gone. `on_notification` runs after each notification line.
///
/// `shutdown` is polled across iterations, so a signal that lands while an
/// event is being written still ends the loop.
pub async fn run<W, S, F>(
    events: &mut mpsc::UnboundedReceiver<WatchEvent>,
    shutdown: S,
    out: &mut W,
    mut on_notification: F,
) -> std::io::Result<()>
where
    W: Write,
    S: Future,
    F: FnMut(&Notification),
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => return Ok(()),
            event = events.recv() => match event {
                Some(WatchEvent::Notification(notification)) => {
                    writeln!(out, "{} {}", notification.id, notification.subject)?;
                    on_notification(&notification);
                }
                Some(WatchEvent::Connectivity(connected)) => {
                    writeln!(out, "{}", if connected { "connected" } else { "disconnected" })?;
                }
                None => return Ok(()),
            },
        }
    }
}
