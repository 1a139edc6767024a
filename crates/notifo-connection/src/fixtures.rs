use notifo_model::Notification;
use time::OffsetDateTime;

pub(crate) fn notification(id: &str, updated: &str) -> Notification {
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
        created: OffsetDateTime::UNIX_EPOCH,
        updated: updated.to_string(),
    }
}
