use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit record. `event_type` is `<namespace>:<verb>`, for
/// example `review:start` or `hitl:escalated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub run_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub node: Option<String>,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// An event that has not been written yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: String,
    pub node: Option<String>,
    pub status: Option<String>,
    pub reason: Option<String>,
    pub payload: serde_json::Value,
}

impl NewEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            node: None,
            status: None,
            reason: None,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults_to_empty_object() {
        let event = NewEvent::new("dev:start").node("dev-execute");
        assert_eq!(event.event_type, "dev:start");
        assert_eq!(event.node.as_deref(), Some("dev-execute"));
        assert!(event.payload.as_object().is_some_and(|m| m.is_empty()));
        assert!(event.reason.is_none());
    }
}
