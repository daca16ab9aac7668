//! Simulated inbound user message, as posted to `/scheduler/mobile-app`.

use serde::{Deserialize, Serialize};

/// Message class carried in `eventTypeCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    #[default]
    Text,
    QuickReply,
    /// Any other code; passed through unchanged.
    Other(u8),
}

impl EventType {
    pub fn code(self) -> u8 {
        match self {
            EventType::Text => 1,
            EventType::QuickReply => 2,
            EventType::Other(c) => c,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => EventType::Text,
            2 => EventType::QuickReply,
            c => EventType::Other(c),
        }
    }
}

/// One outbound payload. Built right before a send and discarded after it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub user_id: String,
    pub message_id: String,
    #[serde(rename = "messageText")]
    pub text: String,
    /// Unix seconds.
    #[serde(rename = "messageTime")]
    pub sent_at: i64,
    pub event_type_code: u8,
    #[serde(rename = "fcmToken")]
    pub device_token: String,
}

impl OutboundMessage {
    /// New message with a fresh UUID v4 id, stamped with the current time.
    pub fn new(
        user_id: impl Into<String>,
        text: impl Into<String>,
        event_type: EventType,
        device_token: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            message_id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            sent_at: chrono::Utc::now().timestamp(),
            event_type_code: event_type.code(),
            device_token: device_token.into(),
        }
    }
}
