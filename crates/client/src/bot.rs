// Single chat bot: connect, listen on the room topic, publish a fixed number
// of greetings at a fixed interval, disconnect.

use std::time::Duration;

use chatgen_common::protocol::chat::{publish_destination, topic_destination, ChatMessage, SenderInfo};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::auth::{Credential, CredentialRefresher};
use crate::session::{Session, SessionError, SessionEvent, SessionStats};
use crate::shutdown::wait_for_shutdown;
use crate::transport::TransportConnector;

pub const BOT_SUBJECT: &str = "chatbot";
pub const BOT_NAME: &str = "ChatBot";
pub const BOT_AVATAR: &str = "https://placehold.co/100x100/E83422/FFFFFF?text=BOT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotConfig {
    pub room_id: String,
    pub messages: usize,
    pub interval: Duration,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self { room_id: "1".to_string(), messages: 10, interval: Duration::from_secs(2) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotReport {
    /// Greetings the bot tried to publish.
    pub published: usize,
    pub stats: SessionStats,
    pub interrupted: bool,
}

pub fn bot_message(index: usize, room_id: &str) -> ChatMessage {
    ChatMessage::new(
        SenderInfo {
            id: BOT_SUBJECT.to_string(),
            name: BOT_NAME.to_string(),
            profile_image_url: BOT_AVATAR.to_string(),
        },
        format!("Hello from the bot! Message {index}"),
        room_id,
    )
}

pub async fn run<C, R>(
    session: &mut Session<C, R>,
    credential: Credential,
    config: &BotConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<BotReport, SessionError>
where
    C: TransportConnector,
    R: CredentialRefresher,
{
    if !connect_unless_interrupted(session, credential, &mut shutdown).await? {
        session.disconnect().await;
        info!("bot interrupted while connecting");
        return Ok(BotReport { published: 0, stats: session.stats(), interrupted: true });
    }
    let topic = topic_destination(&config.room_id);
    let destination = publish_destination(&config.room_id);
    subscribe_logging(session, &topic).await;

    let mut ticker = interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut published = 0;
    let mut interrupted = false;

    while published < config.messages {
        tokio::select! {
            _ = wait_for_shutdown(&mut shutdown) => {
                interrupted = true;
                break;
            }
            _ = ticker.tick() => {
                published += 1;
                let message = bot_message(published, &config.room_id);
                session.send(&destination, &message).await;
                info!("[Sent] {}", message.content);
            }
            event = session.next_event() => {
                if let SessionEvent::ConnectionLost { reason } = event {
                    warn!(%reason, "bot lost its connection, reconnecting");
                    let Some(latest) = session.credential().cloned() else {
                        break;
                    };
                    match connect_unless_interrupted(session, latest, &mut shutdown).await {
                        Ok(true) => subscribe_logging(session, &topic).await,
                        Ok(false) => {
                            interrupted = true;
                            break;
                        }
                        Err(error) => {
                            session.disconnect().await;
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    session.disconnect().await;
    info!(published, interrupted, "bot finished");
    Ok(BotReport { published, stats: session.stats(), interrupted })
}

/// Connect with backoff, giving up early on interrupt. `Ok(false)` means the
/// interrupt won.
async fn connect_unless_interrupted<C, R>(
    session: &mut Session<C, R>,
    credential: Credential,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<bool, SessionError>
where
    C: TransportConnector,
    R: CredentialRefresher,
{
    let connected = tokio::select! {
        result = session.connect_with_backoff(credential) => Some(result),
        _ = wait_for_shutdown(shutdown) => None,
    };
    match connected {
        Some(result) => result.map(|()| true),
        None => Ok(false),
    }
}

async fn subscribe_logging<C, R>(session: &mut Session<C, R>, topic: &str)
where
    C: TransportConnector,
    R: CredentialRefresher,
{
    session
        .subscribe(topic, |message: ChatMessage| {
            info!("[Received] {}: {}", message.sender.name, message.content);
        })
        .await;
}
