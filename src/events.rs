// 📨 Change Events - immutable messages pushed to subscribers
//
// Each event is a named event-stream frame with a JSON payload:
//   connected     { clientId, timestamp, message }
//   data-changed  { type, data, timestamp, file? }
//   heartbeat     { timestamp }
//   force-sync    { timestamp, source: "manual", message }
//
// Framing onto the wire is left to the HTTP layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;

// ============================================================================
// EVENT KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Connected,
    DataChanged,
    Heartbeat,
    ForceSync,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::DataChanged => "data-changed",
            EventKind::Heartbeat => "heartbeat",
            EventKind::ForceSync => "force-sync",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CHANGE EVENT
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: EventKind,

    /// Resource name, only set for `data-changed`
    pub resource: Option<String>,

    /// Wire payload, already in its final shape
    pub payload: Value,

    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// First event on every push connection
    pub fn connected(client_id: &str) -> Self {
        let timestamp = Utc::now();
        ChangeEvent {
            kind: EventKind::Connected,
            resource: None,
            payload: json!({
                "clientId": client_id,
                "timestamp": timestamp,
                "message": "Live sync connection established",
            }),
            timestamp,
        }
    }

    /// Current materialized view of a resource
    pub fn data_changed(resource: &str, data: Value, file: Option<&Path>) -> Self {
        let timestamp = Utc::now();
        let mut payload = json!({
            "type": resource,
            "data": data,
            "timestamp": timestamp,
        });
        if let Some(file) = file {
            payload["file"] = json!(file.display().to_string());
        }

        ChangeEvent {
            kind: EventKind::DataChanged,
            resource: Some(resource.to_string()),
            payload,
            timestamp,
        }
    }

    pub fn heartbeat() -> Self {
        let timestamp = Utc::now();
        ChangeEvent {
            kind: EventKind::Heartbeat,
            resource: None,
            payload: json!({ "timestamp": timestamp.timestamp_millis() }),
            timestamp,
        }
    }

    /// Administrative nudge telling clients to refetch everything
    pub fn force_sync() -> Self {
        let timestamp = Utc::now();
        ChangeEvent {
            kind: EventKind::ForceSync,
            resource: None,
            payload: json!({
                "timestamp": timestamp,
                "source": "manual",
                "message": "Forced synchronisation",
            }),
            timestamp,
        }
    }

    /// Payload serialized for the `data:` line
    pub fn data(&self) -> String {
        self.payload.to_string()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_data_changed_payload() {
        let file = PathBuf::from("db/products.json");
        let event = ChangeEvent::data_changed("products", json!([{"id": "1"}]), Some(&file));

        assert_eq!(event.kind, EventKind::DataChanged);
        assert_eq!(event.resource.as_deref(), Some("products"));
        assert_eq!(event.payload["type"], "products");
        assert_eq!(event.payload["data"][0]["id"], "1");
        assert_eq!(event.payload["file"], "db/products.json");
        assert!(event.payload.get("timestamp").is_some());
    }

    #[test]
    fn test_data_changed_without_file() {
        let event = ChangeEvent::data_changed("sales", json!([]), None);
        assert!(event.payload.get("file").is_none());
    }

    #[test]
    fn test_force_sync_payload() {
        let event = ChangeEvent::force_sync();

        assert_eq!(event.kind.as_str(), "force-sync");
        assert_eq!(event.payload["source"], "manual");
        assert!(event.resource.is_none());
    }

    #[test]
    fn test_connected_payload() {
        let event = ChangeEvent::connected("client_42");
        assert_eq!(event.payload["clientId"], "client_42");
    }

    #[test]
    fn test_data_is_single_line_json() {
        let event = ChangeEvent::data_changed("products", json!([{"description": "a\nb"}]), None);
        let data = event.data();

        assert!(!data.contains('\n'));
        let parsed: Value = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed, event.payload);
    }

    #[test]
    fn test_event_kind_serde_names() {
        assert_eq!(serde_json::to_value(EventKind::DataChanged).unwrap(), json!("data-changed"));
        assert_eq!(EventKind::ForceSync.to_string(), "force-sync");
    }
}
