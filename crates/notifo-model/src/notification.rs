use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One delivery-worthy message as the server sends it to a user.
///
/// `updated` is an opaque version token. Two representations of the same id
/// are ordered by comparing it as a plain string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_small: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_large: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_url: Option<String>,
    #[serde(default)]
    pub is_seen: bool,
    #[serde(default)]
    pub is_confirmed: bool,
    #[serde(default)]
    pub silent: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created: OffsetDateTime,
    pub updated: String,
}

impl Notification {
    /// Whether the notification asks the user for an explicit confirmation.
    pub fn requires_confirmation(&self) -> bool {
        self.confirm_text.is_some() && self.confirm_url.is_some()
    }
}

/// Server-signalled removal of a notification from the live view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Deletion {
    pub id: String,
}

impl Deletion {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Argument of the hub's `confirmMany` method.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmMany {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<String>,
    #[serde(default)]
    pub seen: Vec<String>,
}
