use serde::{Deserialize, Serialize};

use crate::Notification;

/// Body of `POST /api/me/web/poll`.
///
/// The acknowledgement batches are left out of the JSON when empty; the token
/// is always present and `null` before the first successful poll.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollRequest {
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confirmed: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub seen: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deleted: Vec<String>,
}

impl PollRequest {
    pub fn has_acknowledgements(&self) -> bool {
        !(self.confirmed.is_empty() && self.seen.is_empty() && self.deleted.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub continuation_token: String,
    pub notifications: Vec<Notification>,
    #[serde(default)]
    pub deletions: Vec<String>,
}
