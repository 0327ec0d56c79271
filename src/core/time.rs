//! Timestamps, event ids and the `--format json` response envelope.

use serde_json::Value as JsonValue;
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// Unix seconds with a `Z` suffix, e.g. `1771220592Z`. Used for audit lines
/// and cache rows.
pub fn now_epoch_z() -> String {
    format!("{}Z", unix_seconds())
}

pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Wrap a command's payload. Object payloads are flattened into the envelope;
/// anything else lands under `data`.
pub fn command_envelope(cmd: &str, status: &str, payload: JsonValue) -> JsonValue {
    let mut envelope = serde_json::json!({
        "tool": "pluginctl",
        "tool_version": env!("CARGO_PKG_VERSION"),
        "ts": now_epoch_z(),
        "event_id": new_event_id(),
        "cmd": cmd,
        "status": status,
    });
    if let Some(fields) = envelope.as_object_mut() {
        match payload {
            JsonValue::Object(extra) => fields.extend(extra),
            JsonValue::Null => {}
            other => {
                fields.insert("data".to_string(), other);
            }
        }
    }
    envelope
}
