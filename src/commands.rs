//! Control messages the app can post to the worker.

use serde_json::Value;
use thiserror::Error;

use crate::outbox::OutboxKind;

#[derive(Debug, Clone)]
pub struct CommandSpec {
  pub name: &'static str,
  pub aliases: &'static [&'static str],
  pub description: &'static str,
}

/// All accepted message types, each with the alternate spellings it answers to.
pub const COMMANDS: &[CommandSpec] = &[
  CommandSpec {
    name: "STORE_ITEM",
    aliases: &["STORE_EMERGENCY", "STORE_LOCATION", "QUEUE_SOS"],
    description: "Queue a payload in the outbox",
  },
  CommandSpec {
    name: "PURGE_CACHES",
    aliases: &["CLEAR_CACHE", "CLEAR_CACHES"],
    description: "Delete every cache generation",
  },
  CommandSpec {
    name: "SKIP_WAITING",
    aliases: &["SKIP_WAIT", "ACTIVATE"],
    description: "Activate an installed version without waiting",
  },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
  #[error("message has no string `type` field")]
  MissingType,
  #[error("unsupported command '{0}'")]
  Unsupported(String),
  #[error("command {command} is missing field `{field}`")]
  MissingField {
    command: &'static str,
    field: &'static str,
  },
  #[error("command {command} has invalid `{field}`: {reason}")]
  InvalidField {
    command: &'static str,
    field: &'static str,
    reason: String,
  },
}

/// A parsed control message.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientCommand {
  StoreItem { kind: OutboxKind, payload: Value },
  PurgeCaches,
  SkipWaiting,
}

/// Find the command spec whose name or alias equals `tag` (case-insensitive).
pub fn lookup(tag: &str) -> Option<&'static CommandSpec> {
  let tag = tag.trim().to_ascii_uppercase();
  COMMANDS
    .iter()
    .find(|cmd| cmd.name == tag || cmd.aliases.contains(&tag.as_str()))
}

impl ClientCommand {
  /// Parse a `{"type": ..., ...}` message.
  pub fn from_message(message: &Value) -> Result<Self, CommandError> {
    let tag = message
      .get("type")
      .and_then(Value::as_str)
      .ok_or(CommandError::MissingType)?;
    let spec = lookup(tag).ok_or_else(|| CommandError::Unsupported(tag.to_string()))?;

    match spec.name {
      "STORE_ITEM" => Self::store_item(tag, message),
      "PURGE_CACHES" => Ok(Self::PurgeCaches),
      "SKIP_WAITING" => Ok(Self::SkipWaiting),
      _ => Err(CommandError::Unsupported(tag.to_string())),
    }
  }

  fn store_item(tag: &str, message: &Value) -> Result<Self, CommandError> {
    const COMMAND: &str = "STORE_ITEM";

    // The kind-specific aliases imply the kind.
    let implied = match tag.trim().to_ascii_uppercase().as_str() {
      "STORE_EMERGENCY" | "QUEUE_SOS" => Some(OutboxKind::Emergency),
      "STORE_LOCATION" => Some(OutboxKind::Location),
      _ => None,
    };

    let kind = match (message.get("kind").and_then(Value::as_str), implied) {
      (Some(kind), _) => kind.parse().map_err(|e: color_eyre::Report| CommandError::InvalidField {
        command: COMMAND,
        field: "kind",
        reason: e.to_string(),
      })?,
      (None, Some(kind)) => kind,
      (None, None) => {
        return Err(CommandError::MissingField {
          command: COMMAND,
          field: "kind",
        })
      }
    };

    let payload = match message.get("payload").or_else(|| message.get("data")) {
      Some(Value::Null) | None => {
        return Err(CommandError::MissingField {
          command: COMMAND,
          field: "payload",
        })
      }
      Some(payload) => payload.clone(),
    };

    Ok(Self::StoreItem { kind, payload })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_lookup_by_name_and_alias() {
    assert_eq!(lookup("STORE_ITEM").unwrap().name, "STORE_ITEM");
    assert_eq!(lookup("clear_cache").unwrap().name, "PURGE_CACHES");
    assert_eq!(lookup("SKIP_WAITING").unwrap().name, "SKIP_WAITING");
    assert!(lookup("REBOOT").is_none());
  }

  #[test]
  fn test_store_item() {
    let command = ClientCommand::from_message(&json!({
      "type": "STORE_ITEM",
      "kind": "location",
      "payload": { "lat": 48.85, "lng": 2.35 }
    }))
    .unwrap();
    assert_eq!(
      command,
      ClientCommand::StoreItem {
        kind: OutboxKind::Location,
        payload: json!({ "lat": 48.85, "lng": 2.35 }),
      }
    );
  }

  #[test]
  fn test_alias_implies_kind() {
    let command = ClientCommand::from_message(&json!({
      "type": "STORE_EMERGENCY",
      "data": { "message": "help" }
    }))
    .unwrap();
    assert!(matches!(
      command,
      ClientCommand::StoreItem {
        kind: OutboxKind::Emergency,
        ..
      }
    ));
  }

  #[test]
  fn test_simple_commands() {
    assert_eq!(
      ClientCommand::from_message(&json!({ "type": "SKIP_WAITING" })).unwrap(),
      ClientCommand::SkipWaiting
    );
    assert_eq!(
      ClientCommand::from_message(&json!({ "type": "CLEAR_CACHE" })).unwrap(),
      ClientCommand::PurgeCaches
    );
  }

  #[test]
  fn test_unknown_type_is_rejected() {
    assert_eq!(
      ClientCommand::from_message(&json!({ "type": "DEBUG_DUMP" })).unwrap_err(),
      CommandError::Unsupported("DEBUG_DUMP".to_string())
    );
    assert_eq!(
      ClientCommand::from_message(&json!({ "kind": "emergency" })).unwrap_err(),
      CommandError::MissingType
    );
  }

  #[test]
  fn test_store_item_validation() {
    assert_eq!(
      ClientCommand::from_message(&json!({ "type": "STORE_ITEM", "payload": {} })).unwrap_err(),
      CommandError::MissingField {
        command: "STORE_ITEM",
        field: "kind"
      }
    );
    assert_eq!(
      ClientCommand::from_message(&json!({ "type": "STORE_LOCATION" })).unwrap_err(),
      CommandError::MissingField {
        command: "STORE_ITEM",
        field: "payload"
      }
    );
    assert!(matches!(
      ClientCommand::from_message(&json!({
        "type": "STORE_ITEM",
        "kind": "weather",
        "payload": {}
      })),
      Err(CommandError::InvalidField { field: "kind", .. })
    ));
  }
}
