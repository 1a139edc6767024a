//! Shared definitions for the Notifo delivery client.
//! Keeping the wire shapes in a dedicated crate lets the transports, the widget
//! and any test servers agree on them without pulling in runtime code.

mod mode;
mod notification;
mod poll;
mod registration;

pub use mode::{ConnectionMode, ParseModeError};
pub use notification::{ConfirmMany, Deletion, Notification};
pub use poll::{PollRequest, PollResponse};
pub use registration::{CreateUser, RegisterRequest, RegisterResponse};
