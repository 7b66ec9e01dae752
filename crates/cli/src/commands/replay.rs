// `chatgen replay`: re-emit a recorded chat into a room.

use std::path::PathBuf;

use anyhow::{bail, Context};
use chatgen_client::config::{ChatgenConfig, ConfigError, ENV_HISTORY_FILE};
use chatgen_client::events::{default_history_file, EventSource};
use chatgen_client::replay::{ReplayEngine, ReplayOutcome};
use chatgen_client::shutdown::wait_for_shutdown;
use chatgen_client::transport::StompWsConnector;
use clap::Args;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use super::{bus_session, AnyRefresher};
use crate::output::{self, OutputFormat};

const REPLAY_SUBJECT: &str = "replayer";

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Recording to replay. Defaults to CHATGEN_HISTORY_FILE, then to the
    /// recording named after CHATGEN_YOUTUBE_VIDEO_ID.
    #[arg(long)]
    file: Option<PathBuf>,

    /// Room to replay into (defaults to CHATGEN_ROOM_ID).
    #[arg(long)]
    room: Option<String>,

    /// Log each message instead of connecting to the bus.
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ReplaySummary {
    file: String,
    room: String,
    dry_run: bool,
    sent: usize,
    completed: bool,
}

pub async fn run(
    args: ReplayArgs,
    config: ChatgenConfig,
    format: OutputFormat,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let path = recording_path(args.file, &config)?;
    let room = args.room.unwrap_or_else(|| config.room_id.clone());
    let source = EventSource::new(&path);

    let mut engine = if args.dry_run {
        ReplayEngine::<StompWsConnector, AnyRefresher>::dry_run(source, room.clone())
    } else {
        let (credential, mut session) = bus_session(&config, REPLAY_SUBJECT)?;
        let connected = tokio::select! {
            result = session.connect_with_backoff(credential) => Some(result),
            _ = wait_for_shutdown(&mut shutdown) => None,
        };
        match connected {
            Some(result) => result.context("connecting replay session")?,
            None => {
                session.disconnect().await;
                info!("interrupted while connecting, nothing replayed");
                let summary = ReplaySummary {
                    file: path.display().to_string(),
                    room,
                    dry_run: false,
                    sent: 0,
                    completed: false,
                };
                output::print_output(format, &summary, format_human)?;
                return Ok(());
            }
        }
        ReplayEngine::new(session, source, room.clone())
    };

    let stopper = engine.stopper();
    let watcher = tokio::spawn(async move {
        wait_for_shutdown(&mut shutdown).await;
        stopper.stop();
    });
    let outcome = engine.start().await;
    watcher.abort();

    let (sent, completed) = match outcome {
        ReplayOutcome::Completed { sent } => (sent, true),
        ReplayOutcome::Stopped { sent } => (sent, false),
        ReplayOutcome::NotStarted { reason } => {
            engine.stop().await;
            bail!("replay of {} not started: {reason}", path.display());
        }
        ReplayOutcome::AlreadyRunning => bail!("replay already running"),
    };

    let summary = ReplaySummary {
        file: path.display().to_string(),
        room,
        dry_run: args.dry_run,
        sent,
        completed,
    };
    output::print_output(format, &summary, format_human)?;
    Ok(())
}

fn recording_path(file: Option<PathBuf>, config: &ChatgenConfig) -> Result<PathBuf, ConfigError> {
    file.or_else(|| config.history_file.clone())
        .or_else(|| config.youtube_video_id.as_deref().map(default_history_file))
        .ok_or(ConfigError::Missing { key: ENV_HISTORY_FILE })
}

fn format_human(summary: &ReplaySummary) -> String {
    let verb = if summary.dry_run { "logged" } else { "sent" };
    let status = if summary.completed { "complete" } else { "stopped" };
    format!(
        "replay {status}: {verb} {} message(s) from {} to room {}",
        summary.sent, summary.file, summary.room
    )
}
