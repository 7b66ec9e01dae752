// `chatgen record`: save a live chat for later replay.

use std::path::PathBuf;
use std::time::Duration;

use chatgen_client::config::ChatgenConfig;
use chatgen_client::events::EventSource;
use chatgen_client::recorder::{self, YouTubeClient, FOLLOW_POLL_INTERVAL};
use clap::Args;
use serde::Serialize;
use tokio::sync::watch;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct RecordArgs {
    /// Video whose live chat to record (defaults to CHATGEN_YOUTUBE_VIDEO_ID).
    #[arg(long)]
    video_id: Option<String>,

    /// Output file (defaults to CHATGEN_HISTORY_FILE or chat-history-<video>.json).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Keep polling the live chat and append new messages until it ends.
    #[arg(long)]
    follow: bool,

    /// Seconds between polls in follow mode.
    #[arg(long, default_value_t = FOLLOW_POLL_INTERVAL.as_secs())]
    poll_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
struct RecordSummary {
    video_id: String,
    file: String,
    follow: bool,
    records: usize,
}

pub async fn run(
    args: RecordArgs,
    mut config: ChatgenConfig,
    format: OutputFormat,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    if let Some(video_id) = args.video_id {
        config.youtube_video_id = Some(video_id);
    }
    if let Some(output) = args.output {
        config.history_file = Some(output);
    }
    let settings = config.require_recorder()?;
    let api = YouTubeClient::new(settings.api_key);
    let source = EventSource::new(&settings.history_file);

    let records = if args.follow {
        let poll = Duration::from_secs(args.poll_secs.max(1));
        recorder::follow(&api, &settings.video_id, &source, poll, shutdown).await?
    } else {
        recorder::archive(&api, &settings.video_id, &source).await?
    };

    let summary = RecordSummary {
        video_id: settings.video_id,
        file: settings.history_file.display().to_string(),
        follow: args.follow,
        records,
    };
    output::print_output(format, &summary, format_human)?;
    Ok(())
}

fn format_human(summary: &RecordSummary) -> String {
    if summary.records == 0 && !summary.follow {
        return format!("no chat messages found for video {}", summary.video_id);
    }
    format!("{} chat record(s) for video {} in {}", summary.records, summary.video_id, summary.file)
}
