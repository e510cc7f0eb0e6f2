//! Push payload decoding.

use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_TITLE: &str = "SafeRoute Alert";
pub const DEFAULT_BODY: &str = "You have a new safety notification";
pub const DEFAULT_TAG: &str = "saferoute-default";

/// What the host should display for a push message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub tag: Option<String>,
  /// Page to open when the notification is clicked
  pub url: Option<String>,
  pub require_interaction: bool,
}

impl Default for Notification {
  fn default() -> Self {
    Self {
      title: DEFAULT_TITLE.to_string(),
      body: DEFAULT_BODY.to_string(),
      tag: Some(DEFAULT_TAG.to_string()),
      url: None,
      require_interaction: false,
    }
  }
}

/// Decode a push payload. Missing, non-JSON, or non-object payloads yield
/// the default notification; missing fields take their defaults.
pub fn notification_from_push(payload: Option<&[u8]>) -> Notification {
  let Some(bytes) = payload.filter(|b| !b.is_empty()) else {
    return Notification::default();
  };

  match serde_json::from_slice::<Notification>(bytes) {
    Ok(mut notification) => {
      if notification.title.trim().is_empty() {
        notification.title = DEFAULT_TITLE.to_string();
      }
      notification
    }
    Err(e) => {
      warn!(error = %e, len = bytes.len(), "Malformed push payload, using default notification");
      Notification::default()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_missing_payload_uses_default() {
    assert_eq!(notification_from_push(None), Notification::default());
    assert_eq!(notification_from_push(Some(b"")), Notification::default());
  }

  #[test]
  fn test_malformed_payload_degrades_to_default() {
    let notification = notification_from_push(Some(b"not json {"));
    assert_eq!(notification.title, DEFAULT_TITLE);
    assert_eq!(notification.body, DEFAULT_BODY);
    assert_eq!(notification.tag.as_deref(), Some(DEFAULT_TAG));

    assert_eq!(notification_from_push(Some(b"[1, 2]")), Notification::default());
  }

  #[test]
  fn test_partial_payload_keeps_given_fields() {
    let notification = notification_from_push(Some(
      br#"{"title": "Flood warning", "url": "/alerts/42", "requireInteraction": true}"#,
    ));
    assert_eq!(notification.title, "Flood warning");
    assert_eq!(notification.body, DEFAULT_BODY);
    assert_eq!(notification.url.as_deref(), Some("/alerts/42"));
    assert!(notification.require_interaction);
  }

  #[test]
  fn test_blank_title_replaced() {
    let notification = notification_from_push(Some(br#"{"title": "  ", "body": "Check in"}"#));
    assert_eq!(notification.title, DEFAULT_TITLE);
    assert_eq!(notification.body, "Check in");
  }
}
