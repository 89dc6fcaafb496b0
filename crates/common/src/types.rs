use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// An inbound text message, normalized from the network's event shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub session_id: String,
    /// Remote address of the conversation (a user or group jid).
    pub sender_id: String,
    pub text: String,
    /// Network timestamp in seconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Receipt returned by the network for an accepted outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipient_id: String,
    pub sent_at: u64,
}

impl DeliveryReceipt {
    pub fn new(message_id: impl Into<String>, recipient_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            recipient_id: recipient_id.into(),
            sent_at: now_ms(),
        }
    }
}
