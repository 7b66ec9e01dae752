// Chat message wire shape exchanged with the bus.
//
// Publish:   /publish/{roomId}
// Subscribe: /topic/stream/{roomId}/message
//
// Both directions carry the same JSON body.

use serde::{Deserialize, Serialize};

pub const PUBLISH_PREFIX: &str = "/publish";
pub const TOPIC_PREFIX: &str = "/topic/stream";

/// Destination a client sends chat messages to for `room_id`.
pub fn publish_destination(room_id: &str) -> String {
    format!("{PUBLISH_PREFIX}/{room_id}")
}

/// Destination a client subscribes to for messages broadcast in `room_id`.
pub fn topic_destination(room_id: &str) -> String {
    format!("{TOPIC_PREFIX}/{room_id}/message")
}

/// Sender identity attached to every chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SenderInfo {
    pub id: String,
    pub name: String,
    pub profile_image_url: String,
}

/// An outbound (or echoed inbound) chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender: SenderInfo,
    pub content: String,
    pub stream_id: String,
}

impl ChatMessage {
    pub fn new(sender: SenderInfo, content: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self { sender, content: content.into(), stream_id: room_id.into() }
    }
}
