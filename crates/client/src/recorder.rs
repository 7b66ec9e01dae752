// Live-chat recorder: pulls chat records from the video platform's API into
// an `EventSource` file that the replay engine can later re-emit.
//
// `archive` pages through everything available and writes once. `follow`
// keeps polling an active stream, appending each non-empty batch and
// rewriting the file, until the chat ends, access is revoked, or shutdown.

use std::future::Future;
use std::time::Duration;

use chatgen_common::event::RecordedEvent;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::events::{EventSource, EventSourceError};
use crate::shutdown::wait_for_shutdown;

pub const YOUTUBE_API_BASE: &str = "https://www.googleapis.com/youtube/v3";
pub const PAGE_DELAY: Duration = Duration::from_millis(200);
pub const FOLLOW_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const RETRY_DELAY: Duration = Duration::from_secs(10);
const MAX_RESULTS: &str = "2000";

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("video `{0}` has no active live chat")]
    NoLiveChat(String),
    #[error("live stream `{0}` has already ended")]
    StreamEnded(String),
    #[error("chat API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat API returned {status}: {message}")]
    Api { status: u16, reason: Option<String>, message: String },
    #[error(transparent)]
    Store(#[from] EventSourceError),
}

impl RecorderError {
    /// The platform's machine-readable reason, e.g. `liveChatEnded`.
    pub fn api_reason(&self) -> Option<&str> {
        match self {
            Self::Api { reason, .. } => reason.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatPage {
    pub events: Vec<RecordedEvent>,
    pub next_page_token: Option<String>,
}

/// Source of live-chat records.
pub trait ChatHistoryApi: Send + Sync {
    fn live_chat_id(&self, video_id: &str) -> impl Future<Output = Result<String, RecorderError>> + Send;

    fn messages_page(
        &self,
        live_chat_id: &str,
        page_token: Option<&str>,
    ) -> impl Future<Output = Result<ChatPage, RecorderError>> + Send;
}

// ── YouTube Data API ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct YouTubeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoList {
    #[serde(default)]
    items: Vec<Video>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Video {
    live_streaming_details: Option<LiveStreamingDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveStreamingDetails {
    active_live_chat_id: Option<String>,
    actual_end_time: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    items: Vec<RecordedEvent>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    reason: Option<String>,
}

impl YouTubeClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, YOUTUBE_API_BASE)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(
        &self,
        resource: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RecorderError> {
        let response = self
            .http
            .get(format!("{}/{resource}", self.base_url))
            .query(query)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }
        Ok(response.json::<T>().await?)
    }
}

fn api_error(status: u16, body: &str) -> RecorderError {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => RecorderError::Api {
            status,
            reason: envelope.error.errors.into_iter().find_map(|detail| detail.reason),
            message: envelope.error.message,
        },
        Err(_) => RecorderError::Api { status, reason: None, message: body.trim().to_string() },
    }
}

impl ChatHistoryApi for YouTubeClient {
    async fn live_chat_id(&self, video_id: &str) -> Result<String, RecorderError> {
        let videos: VideoList =
            self.get("videos", &[("part", "liveStreamingDetails"), ("id", video_id)]).await?;
        let details = videos.items.into_iter().find_map(|video| video.live_streaming_details);
        match details {
            Some(LiveStreamingDetails { active_live_chat_id: Some(id), .. }) => Ok(id),
            Some(LiveStreamingDetails { actual_end_time: Some(_), .. }) => {
                Err(RecorderError::StreamEnded(video_id.to_string()))
            }
            _ => Err(RecorderError::NoLiveChat(video_id.to_string())),
        }
    }

    async fn messages_page(
        &self,
        live_chat_id: &str,
        page_token: Option<&str>,
    ) -> Result<ChatPage, RecorderError> {
        let mut query = vec![
            ("liveChatId", live_chat_id),
            ("part", "snippet,authorDetails"),
            ("maxResults", MAX_RESULTS),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let page: MessageList = self.get("liveChat/messages", &query).await?;
        Ok(ChatPage { events: page.items, next_page_token: page.next_page_token })
    }
}

// ── Recording modes ─────────────────────────────────────────────────

/// Fetch every available page and write them to `source` in one go.
/// Returns the number of records written.
pub async fn archive<A: ChatHistoryApi>(
    api: &A,
    video_id: &str,
    source: &EventSource,
) -> Result<usize, RecorderError> {
    let live_chat_id = api.live_chat_id(video_id).await?;
    info!(video_id, %live_chat_id, "archiving live chat");

    let mut events = Vec::new();
    let mut page_token: Option<String> = None;
    let mut pages = 0usize;
    loop {
        pages += 1;
        let page = api.messages_page(&live_chat_id, page_token.as_deref()).await?;
        let fetched = page.events.len();
        events.extend(page.events);
        info!(page = pages, fetched, total = events.len(), "fetched chat page");

        // An active chat always hands out a next token; an empty page means
        // we have caught up.
        match page.next_page_token {
            Some(token) if fetched > 0 => page_token = Some(token),
            _ => break,
        }
        sleep(PAGE_DELAY).await;
    }

    if events.is_empty() {
        warn!(video_id, "no chat messages found, nothing written");
        return Ok(0);
    }
    source.write_all(&events)?;
    info!(count = events.len(), path = %source.path().display(), "chat history saved");
    Ok(events.len())
}

/// Poll an active chat every `poll_interval`, appending new records to
/// `source`. Returns the total number of records in the file when it stops.
pub async fn follow<A: ChatHistoryApi>(
    api: &A,
    video_id: &str,
    source: &EventSource,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<usize, RecorderError> {
    let live_chat_id = api.live_chat_id(video_id).await?;

    let mut events = source.load_or_empty()?;
    if events.is_empty() {
        source.write_all(&events)?;
        info!(path = %source.path().display(), "starting a new chat log");
    } else {
        info!(saved = events.len(), "resuming chat log");
    }

    let mut page_token: Option<String> = None;
    loop {
        let fetched = tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            fetched = api.messages_page(&live_chat_id, page_token.as_deref()) => fetched,
        };

        let wait = match fetched {
            Ok(page) => {
                page_token = page.next_page_token;
                if !page.events.is_empty() {
                    info!(fetched = page.events.len(), "new chat messages");
                    events.extend(page.events);
                    source.write_all(&events)?;
                    info!(total = events.len(), "chat log saved");
                }
                poll_interval
            }
            Err(error) => match error.api_reason() {
                Some("liveChatEnded") => {
                    info!("live chat has ended");
                    break;
                }
                Some("forbidden") => {
                    error!(%error, "chat access forbidden, stopping");
                    break;
                }
                _ => {
                    warn!(%error, retry_in_secs = RETRY_DELAY.as_secs(), "chat poll failed");
                    RETRY_DELAY
                }
            },
        };

        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => break,
            _ = sleep(wait) => {}
        }
    }

    info!(total = events.len(), path = %source.path().display(), "stopped following chat");
    Ok(events.len())
}
