// `chatgen bot`: one greeting bot in a room.

use std::time::Duration;

use chatgen_client::bot::{self, BotConfig, BotReport, BOT_SUBJECT};
use chatgen_client::config::ChatgenConfig;
use clap::Args;
use serde::Serialize;
use tokio::sync::watch;

use super::bus_session;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct BotArgs {
    /// Room to publish into (defaults to CHATGEN_ROOM_ID).
    #[arg(long)]
    room: Option<String>,

    /// Number of greetings to publish.
    #[arg(long, default_value_t = 10)]
    messages: usize,

    /// Milliseconds between greetings.
    #[arg(long, default_value_t = 2_000)]
    interval_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
struct BotSummary {
    room: String,
    published: usize,
    sent: u64,
    dropped: u64,
    received: u64,
    interrupted: bool,
}

impl BotSummary {
    fn new(room: String, report: BotReport) -> Self {
        Self {
            room,
            published: report.published,
            sent: report.stats.sent,
            dropped: report.stats.dropped,
            received: report.stats.received,
            interrupted: report.interrupted,
        }
    }
}

pub async fn run(
    args: BotArgs,
    config: ChatgenConfig,
    format: OutputFormat,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bot_config = BotConfig {
        room_id: args.room.unwrap_or_else(|| config.room_id.clone()),
        messages: args.messages,
        interval: Duration::from_millis(args.interval_ms.max(1)),
    };
    let (credential, mut session) = bus_session(&config, BOT_SUBJECT)?;

    let report = bot::run(&mut session, credential, &bot_config, shutdown).await?;
    let summary = BotSummary::new(bot_config.room_id, report);
    output::print_output(format, &summary, format_human)?;
    Ok(())
}

fn format_human(summary: &BotSummary) -> String {
    let mut msg = format!(
        "bot published {} message(s) to room {} ({} sent, {} dropped, {} received)",
        summary.published, summary.room, summary.sent, summary.dropped, summary.received
    );
    if summary.interrupted {
        msg.push_str("\n  interrupted before finishing");
    }
    msg
}
