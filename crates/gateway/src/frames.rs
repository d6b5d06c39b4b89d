//! Inbound/outbound frame schema.
//!
//! A closed `#[serde(tag = "type")]` enum: unknown `type` strings fail
//! to deserialize into `InboundFrame`, and the dispatcher turns that
//! into an `error` frame without closing the connection — it never
//! happens via a `match` fallthrough on a string.

use chrono::{DateTime, Utc};
use relay_common::Role;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Heartbeat {
        id: Option<String>,
    },
    Publish {
        id: Option<String>,
        subject: String,
        payload: Value,
    },
    Subscribe {
        id: Option<String>,
        subject: String,
    },
    Unsubscribe {
        id: Option<String>,
        subject: String,
    },
    SubscribeChannel {
        id: Option<String>,
        #[serde(rename = "channel-id")]
        channel_id: String,
    },
    UnsubscribeChannel {
        id: Option<String>,
        #[serde(rename = "channel-id")]
        channel_id: String,
    },
    SubscribeTopicPreview {
        id: Option<String>,
    },
    UnsubscribeTopicPreview {
        id: Option<String>,
    },
}

impl InboundFrame {
    pub fn id(&self) -> Option<&str> {
        match self {
            InboundFrame::Heartbeat { id }
            | InboundFrame::Publish { id, .. }
            | InboundFrame::Subscribe { id, .. }
            | InboundFrame::Unsubscribe { id, .. }
            | InboundFrame::SubscribeChannel { id, .. }
            | InboundFrame::UnsubscribeChannel { id, .. }
            | InboundFrame::SubscribeTopicPreview { id }
            | InboundFrame::UnsubscribeTopicPreview { id } => id.as_deref(),
        }
    }

    /// The session role allowed to send this frame type, or `None` if
    /// both agent and dashboard sessions may send it.
    pub fn required_role(&self) -> Option<Role> {
        match self {
            InboundFrame::Heartbeat { .. } => None,
            InboundFrame::Publish { .. } | InboundFrame::Subscribe { .. } | InboundFrame::Unsubscribe { .. } => Some(Role::Agent),
            InboundFrame::SubscribeChannel { .. }
            | InboundFrame::UnsubscribeChannel { .. }
            | InboundFrame::SubscribeTopicPreview { .. }
            | InboundFrame::UnsubscribeTopicPreview { .. } => Some(Role::Dashboard),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Ack {
        id: Option<String>,
    },
    Error {
        id: Option<String>,
        message: String,
    },
    Message {
        subject: String,
        payload: Value,
        timestamp: DateTime<Utc>,
    },
}

/// Best-effort extraction of the echoed `id` from a frame that failed to
/// parse into `InboundFrame` — malformed JSON has none.
pub fn id_from_raw(raw: &str) -> Option<String> {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| v.get("id").and_then(|id| id.as_str().map(str::to_string)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_publish_frame() {
        let raw = r#"{"type":"publish","id":"1","subject":"events.x","payload":{"v":1}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, InboundFrame::Publish { .. }));
        assert_eq!(frame.id(), Some("1"));
    }

    #[test]
    fn unknown_type_fails_to_parse() {
        let raw = r#"{"type":"teleport","id":"1"}"#;
        assert!(serde_json::from_str::<InboundFrame>(raw).is_err());
        assert_eq!(id_from_raw(raw), Some("1".to_string()));
    }

    #[test]
    fn publish_requires_the_agent_role() {
        let raw = r#"{"type":"publish","subject":"events.x","payload":{}}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.required_role(), Some(Role::Agent));
    }

    #[test]
    fn subscribe_topic_preview_requires_the_dashboard_role() {
        let raw = r#"{"type":"subscribe_topic_preview"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.required_role(), Some(Role::Dashboard));
    }

    #[test]
    fn heartbeat_has_no_role_requirement() {
        let raw = r#"{"type":"heartbeat"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.required_role(), None);
    }

    #[test]
    fn channel_frame_uses_hyphenated_field_name() {
        let raw = r#"{"type":"subscribe_channel","channel-id":"c1"}"#;
        let frame: InboundFrame = serde_json::from_str(raw).unwrap();
        assert!(matches!(frame, InboundFrame::SubscribeChannel { channel_id, .. } if channel_id == "c1"));
    }

    #[test]
    fn outbound_message_frame_serializes_with_tag() {
        let frame = OutboundFrame::Message {
            subject: "tenant.t1.events.x".into(),
            payload: serde_json::json!({"v": 1}),
            timestamp: Utc::now(),
        };
        let value: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "message");
    }
}
