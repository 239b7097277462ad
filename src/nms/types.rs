//! Wire types for the NMS command contract.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A command issued by the NMS. Never mutated by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub id: String,
    pub action: String,
    pub args: Map<String, Value>,
    /// Set when the arguments arrived in a shape that is not a JSON object.
    pub args_error: Option<String>,
    /// Optional routing category; empty when absent.
    pub category: String,
    pub enqueued_at: Option<String>,
    /// Raw due time. `None` or blank means due now.
    pub execute_at: Option<String>,
}

impl Command {
    /// Build a command with object arguments. Mostly useful in tests and the CLI.
    #[must_use]
    pub fn new(id: impl Into<String>, action: impl Into<String>, args: Value) -> Self {
        let (args, args_error) = match args {
            Value::Object(map) => (map, None),
            Value::Null => (Map::new(), None),
            other => (Map::new(), Some(format!("args must be an object, got {other}"))),
        };
        Self {
            id: id.into(),
            action: action.into(),
            args,
            args_error,
            category: String::new(),
            enqueued_at: None,
            execute_at: None,
        }
    }

    #[must_use]
    pub fn with_execute_at(mut self, execute_at: impl Into<String>) -> Self {
        self.execute_at = Some(execute_at.into());
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Decode one poll item: a command object or a legacy `[xid, fields]` pair.
    ///
    /// Returns `None` when the item carries no command id, since such an item
    /// cannot be acknowledged.
    #[must_use]
    pub fn from_wire(item: &Value) -> Option<Self> {
        let fields = match item {
            Value::Object(map) => map,
            Value::Array(pair) => match pair.as_slice() {
                [_xid, Value::Object(map)] => map,
                _ => return None,
            },
            _ => return None,
        };

        let id = text_field(fields, &["cmd_id", "id"])?;
        let action = text_field(fields, &["action"]).unwrap_or_default();

        let (mut args, args_error) = decode_args(fields);
        // Older NMS builds put bundle fields next to the action.
        if action == "bundle.apply" {
            for key in ["bundle_id", "url", "checksum"] {
                if !args.contains_key(key)
                    && let Some(v) = fields.get(key).filter(|v| !v.is_null())
                {
                    args.insert(key.to_owned(), v.clone());
                }
            }
        }

        Some(Self {
            id,
            action,
            args,
            args_error,
            category: text_field(fields, &["category"]).unwrap_or_default(),
            enqueued_at: text_field(fields, &["enqueued_at", "created_at"]),
            execute_at: text_field(fields, &["execute_at"]),
        })
    }
}

/// First non-blank string (or number) among `keys`, trimmed.
fn text_field(fields: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match fields.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_owned()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

fn decode_args(fields: &Map<String, Value>) -> (Map<String, Value>, Option<String>) {
    match fields.get("args") {
        Some(Value::Object(map)) => return (map.clone(), None),
        Some(Value::Null) | None => {}
        Some(other) => return (Map::new(), Some(format!("args must be an object, got {other}"))),
    }
    match fields.get("args_json") {
        Some(Value::String(raw)) if raw.trim().is_empty() => (Map::new(), None),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => (map, None),
            Ok(_) => (Map::new(), Some("args_json must encode an object".to_owned())),
            Err(e) => (Map::new(), Some(format!("args_json is not valid JSON: {e}"))),
        },
        Some(Value::Object(map)) => (map.clone(), None),
        Some(Value::Null) | None => (Map::new(), None),
        Some(other) => (Map::new(), Some(format!("args_json must be a string, got {other}"))),
    }
}

/// Body of a poll response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PollResponse {
    #[serde(default)]
    pub commands: Vec<Value>,
}

impl PollResponse {
    /// Decode every item that carries an id; the rest are logged and dropped.
    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
            .iter()
            .filter_map(|item| {
                let cmd = Command::from_wire(item);
                if cmd.is_none() {
                    tracing::warn!(item = %item, "bad command item without id; skipped");
                }
                cmd
            })
            .collect()
    }
}

/// Outcome status reported to the NMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Ok,
    Error,
}

impl AckStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// The single outcome report for a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckResult {
    #[serde(rename = "cmd_id")]
    pub command_id: String,
    pub status: AckStatus,
    pub detail: String,
    #[serde(rename = "finished_at")]
    pub completed_at: String,
}

impl AckResult {
    #[must_use]
    pub fn ok(command_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(command_id, AckStatus::Ok, detail)
    }

    #[must_use]
    pub fn error(command_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(command_id, AckStatus::Error, detail)
    }

    fn new(command_id: impl Into<String>, status: AckStatus, detail: impl Into<String>) -> Self {
        Self {
            command_id: command_id.into(),
            status,
            detail: detail.into(),
            completed_at: crate::timefmt::now_string(),
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == AckStatus::Ok
    }
}

/// Bundle deployment telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleReport {
    pub status: AckStatus,
    pub detail: String,
    /// Active bundle after the attempt; empty when none is active.
    pub installed_version: String,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_object_item() {
        let cmd = Command::from_wire(&json!({
            "cmd_id": "c1",
            "action": "audio.play",
            "args": {"file": "/tmp/a.mp3"},
            "created_at": "2025-01-01-10:00:00",
            "execute_at": "",
        }))
        .unwrap();
        assert_eq!(cmd.id, "c1");
        assert_eq!(cmd.args["file"], "/tmp/a.mp3");
        assert_eq!(cmd.enqueued_at.as_deref(), Some("2025-01-01-10:00:00"));
        assert!(cmd.execute_at.is_none());
        assert!(cmd.args_error.is_none());
    }

    #[test]
    fn decodes_legacy_pair_with_args_json() {
        let cmd = Command::from_wire(&json!([
            "1700000000-0",
            {"cmd_id": "c2", "action": "tts.say", "args_json": "{\"text\":\"hi\"}", "category": "tts"}
        ]))
        .unwrap();
        assert_eq!(cmd.id, "c2");
        assert_eq!(cmd.category, "tts");
        assert_eq!(cmd.args["text"], "hi");
    }

    #[test]
    fn numeric_id_alias_is_accepted() {
        let cmd = Command::from_wire(&json!({"id": 42, "action": "scan.start"})).unwrap();
        assert_eq!(cmd.id, "42");
    }

    #[test]
    fn item_without_id_is_dropped() {
        let resp: PollResponse = serde_json::from_value(json!({
            "commands": [{"action": "scan.start"}, "junk", {"cmd_id": "ok1", "action": "scan.stop"}]
        }))
        .unwrap();
        let cmds = resp.into_commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].id, "ok1");
    }

    #[test]
    fn malformed_args_json_is_flagged_not_dropped() {
        let cmd = Command::from_wire(&json!({
            "cmd_id": "c3", "action": "audio.play", "args_json": "[1,2]"
        }))
        .unwrap();
        assert!(cmd.args_error.is_some());
    }

    #[test]
    fn legacy_bundle_fields_are_lifted_into_args() {
        let cmd = Command::from_wire(&json!({
            "cmd_id": "b1", "action": "bundle.apply",
            "bundle_id": "robotBundle1.1", "url": "http://nms/b.zip"
        }))
        .unwrap();
        assert_eq!(cmd.args["bundle_id"], "robotBundle1.1");
        assert_eq!(cmd.args["url"], "http://nms/b.zip");
    }

    #[test]
    fn ack_serializes_wire_names() {
        let ack = AckResult::error("c9", "unknown action=foo");
        let v = serde_json::to_value(&ack).unwrap();
        assert_eq!(v["cmd_id"], "c9");
        assert_eq!(v["status"], "error");
        assert_eq!(v["detail"], "unknown action=foo");
        assert!(v["finished_at"].as_str().is_some());
    }
}
