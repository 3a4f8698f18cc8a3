//! Notification envelope pushed to the monitoring endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Notification envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Notification ID (UUIDv7 for ordering)
    pub id: Uuid,

    /// Emitting component (e.g. `lock-manager`)
    pub source: String,

    /// Event name (e.g. `lock_acquired`)
    pub event: String,

    /// Event payload
    pub data: serde_json::Value,

    /// Emission time
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Create new notification stamped with the current time
    pub fn new(
        source: impl Into<String>,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::at(source, event, data, Utc::now())
    }

    /// Create new notification with an explicit timestamp
    pub fn at(
        source: impl Into<String>,
        event: impl Into<String>,
        data: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            source: source.into(),
            event: event.into(),
            data,
            timestamp,
        }
    }

    /// Serialize to the JSON body posted to the endpoint
    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_creation() {
        let n = Notification::new("lock-manager", "lock_acquired", json!({"scope": "c1"}));

        assert_eq!(n.source, "lock-manager");
        assert_eq!(n.event, "lock_acquired");
        assert_eq!(n.data["scope"], "c1");
    }

    #[test]
    fn test_notification_wire_shape() {
        let n = Notification::new("orchestrator", "operation_completed", json!({}));
        let value: serde_json::Value = serde_json::from_slice(&n.to_bytes().unwrap()).unwrap();

        for field in ["id", "source", "event", "data", "timestamp"] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }
}
