//! Real-time notification delivery for Notifo widgets.
//!
//! A [`Connection`] delivers notification updates and deletions for one user
//! and carries acknowledgements (seen, confirmed, deleted) back to the server.
//! Two transports implement it:
//! - [`PollingConnection`]: self-scheduling HTTP loop against
//!   `/api/me/web/poll`, batching acknowledgements into each request
//! - [`SocketConnection`]: SignalR JSON hub over a WebSocket with automatic
//!   reconnect
//!
//! [`Deduplicated`] wraps either one and drops stale or deleted updates before
//! they reach application handlers. [`build_connection`] picks the transport
//! from a [`ConnectionMode`].

mod connection;
mod dedup;
mod error;
mod factory;
mod handlers;
mod polling;
pub mod socket;

#[cfg(test)]
pub(crate) mod fixtures;

pub use connection::{Connection, ConnectionState};
pub use dedup::Deduplicated;
pub use error::{ConnectionError, ConnectionResult};
pub use factory::{build_connection, join_api, ConnectionOptions, DEFAULT_POLLING_INTERVAL};
pub use handlers::{ConnectivityHandler, DeleteHandler, Handlers, NotificationsHandler};
pub use notifo_model::{ConnectionMode, Deletion, Notification};
pub use polling::{HttpPollApi, PollApi, PollingConnection};
pub use socket::{ReconnectPolicy, SocketConnection};
