//! Push channel frame types and parser.
//!
//! The backend sends JSON frames with the shape
//! `{"type": "<kind>", "targetId": <id>, "payload": {...}}`. This module
//! deserializes them into a strongly-typed [`PushEvent`] enum.

use serde::{Deserialize, Serialize};

use crate::types::{DbId, Timestamp};

/// A message was delivered into a conversation.
pub const MSG_TYPE_MESSAGE_DELIVERED: &str = "message_delivered";

/// A lead showed a high-intent signal.
pub const MSG_TYPE_HIGH_INTENT_ALERT: &str = "high_intent_alert";

/// A non-priority alert was raised against an entity.
pub const MSG_TYPE_ALERT_RAISED: &str = "alert_raised";

/// All known push event kinds.
///
/// Deserialized via the internally-tagged `"type"` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum PushEvent {
    /// `targetId` is the conversation id.
    #[serde(rename = "message_delivered", rename_all = "camelCase")]
    MessageDelivered { target_id: DbId, payload: ChatMessage },

    /// `targetId` is the lead id.
    #[serde(rename = "high_intent_alert", rename_all = "camelCase")]
    HighIntentAlert { target_id: DbId, payload: Alert },

    #[serde(rename = "alert_raised", rename_all = "camelCase")]
    AlertRaised { target_id: DbId, payload: Alert },
}

impl PushEvent {
    /// Wire discriminant of this event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MessageDelivered { .. } => MSG_TYPE_MESSAGE_DELIVERED,
            Self::HighIntentAlert { .. } => MSG_TYPE_HIGH_INTENT_ALERT,
            Self::AlertRaised { .. } => MSG_TYPE_ALERT_RAISED,
        }
    }

    /// Entity the event applies to.
    pub fn target_id(&self) -> DbId {
        match self {
            Self::MessageDelivered { target_id, .. }
            | Self::HighIntentAlert { target_id, .. }
            | Self::AlertRaised { target_id, .. } => *target_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageDirection {
    #[default]
    Inbound,
    Outbound,
}

/// One message in a conversation, as pushed and as listed by the REST
/// messages endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: DbId,
    pub body: String,
    #[serde(default)]
    pub direction: MessageDirection,
    pub sent_at: Timestamp,
}

/// Alert payload shared by priority and ordinary alerts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    #[serde(default)]
    pub id: Option<DbId>,
    pub title: String,
    #[serde(default)]
    pub body: String,
    /// Intent score reported by the classifier, if any.
    #[serde(default)]
    pub score: Option<f64>,
}

/// Parse a push channel text frame into a typed event.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log and continue.
pub fn parse_event(text: &str) -> Result<PushEvent, serde_json::Error> {
    serde_json::from_str(text)
}
