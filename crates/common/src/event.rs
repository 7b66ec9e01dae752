// Recorded chat events.
//
// On disk a recording is a JSON array in the video platform's live-chat
// record shape, so archives fetched by any recorder replay the same way:
//
//   { "snippet": { "publishedAt": "...", "displayMessage": "..." },
//     "authorDetails": { "channelId": "...", "displayName": "...",
//                        "profileImageUrl": "..." } }
//
// Fields outside that shape are ignored on load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::chat::{ChatMessage, SenderInfo};

/// One recorded chat line with the time it was originally published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "LiveChatRecord", into = "LiveChatRecord")]
pub struct RecordedEvent {
    pub author_id: String,
    pub author_name: String,
    pub author_avatar: String,
    pub body: String,
    pub published_at: DateTime<Utc>,
}

impl RecordedEvent {
    /// Build the outbound message that replays this event into `room_id`.
    pub fn to_chat_message(&self, room_id: &str) -> ChatMessage {
        ChatMessage::new(
            SenderInfo {
                id: self.author_id.clone(),
                name: self.author_name.clone(),
                profile_image_url: self.author_avatar.clone(),
            },
            self.body.clone(),
            room_id,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveChatRecord {
    snippet: Snippet,
    author_details: AuthorDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    published_at: DateTime<Utc>,
    #[serde(default)]
    display_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorDetails {
    #[serde(default)]
    channel_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    profile_image_url: String,
}

impl From<LiveChatRecord> for RecordedEvent {
    fn from(record: LiveChatRecord) -> Self {
        Self {
            author_id: record.author_details.channel_id,
            author_name: record.author_details.display_name,
            author_avatar: record.author_details.profile_image_url,
            body: record.snippet.display_message,
            published_at: record.snippet.published_at,
        }
    }
}

impl From<RecordedEvent> for LiveChatRecord {
    fn from(event: RecordedEvent) -> Self {
        Self {
            snippet: Snippet { published_at: event.published_at, display_message: event.body },
            author_details: AuthorDetails {
                channel_id: event.author_id,
                display_name: event.author_name,
                profile_image_url: event.author_avatar,
            },
        }
    }
}
