// CLI subcommand dispatch and the wiring they share.

use std::sync::Arc;

use anyhow::Context;
use chatgen_client::auth::{
    Credential, CredentialRefresher, HttpRefresher, LocalRefresher, RefreshError, TokenProvider,
    TokenStore,
};
use chatgen_client::config::{ChatgenConfig, ConfigError, ENV_SECRET_KEY};
use chatgen_client::session::Session;
use chatgen_client::transport::StompWsConnector;
use clap::Subcommand;
use tokio::sync::watch;

use crate::output::OutputFormat;

pub mod bot;
pub mod load;
pub mod record;
pub mod replay;
pub mod token;

#[derive(Subcommand)]
pub enum Command {
    /// Run one chat bot that greets the room at a fixed interval
    Bot(bot::BotArgs),
    /// Replay a recorded chat into a room with its original pacing
    Replay(replay::ReplayArgs),
    /// Ramp up a fleet of publishing clients and report the outcome
    Load(load::LoadArgs),
    /// Record a live chat into a replayable history file
    Record(record::RecordArgs),
    /// Issue or verify a bus access token
    Token(token::TokenArgs),
}

pub async fn run(
    cmd: Command,
    config: ChatgenConfig,
    format: OutputFormat,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    match cmd {
        Command::Bot(args) => bot::run(args, config, format, shutdown).await,
        Command::Replay(args) => replay::run(args, config, format, shutdown).await,
        Command::Load(args) => load::run(args, config, format, shutdown).await,
        Command::Record(args) => record::run(args, config, format, shutdown).await,
        Command::Token(args) => token::run(args, config, format),
    }
}

pub(crate) fn token_provider(config: &ChatgenConfig) -> anyhow::Result<Arc<TokenProvider>> {
    let secret = config.secret_key.as_deref().ok_or(ConfigError::Missing { key: ENV_SECRET_KEY })?;
    let provider = TokenProvider::new(secret, config.secret_encoding, config.jwt_algorithm)
        .context("building token provider")?;
    Ok(Arc::new(provider))
}

/// Refresh locally with the signing secret, or through the chat server's
/// re-issue endpoint when one is configured.
#[derive(Debug, Clone)]
pub(crate) enum AnyRefresher {
    Local(LocalRefresher),
    Http(HttpRefresher),
}

impl CredentialRefresher for AnyRefresher {
    async fn refresh(&self) -> Result<Credential, RefreshError> {
        match self {
            Self::Local(refresher) => refresher.refresh().await,
            Self::Http(refresher) => refresher.refresh().await,
        }
    }
}

pub(crate) type BusSession = Session<StompWsConnector, AnyRefresher>;

/// A disconnected session for `subject` plus the credential to connect with.
pub(crate) fn bus_session(
    config: &ChatgenConfig,
    subject: &str,
) -> anyhow::Result<(Credential, BusSession)> {
    let bus = config.require_bus()?;
    let provider = token_provider(config)?;
    let connector = StompWsConnector::new(&bus.websocket_url)
        .with_context(|| format!("invalid bus endpoint {}", bus.websocket_url))?;

    let pair = provider.issue_pair(subject).context("issuing initial credential")?;
    let credential = pair.access.clone();
    let store = TokenStore::new(pair);
    let refresher = match config.reissue_url.as_deref() {
        Some(url) => AnyRefresher::Http(HttpRefresher::new(url, store)),
        None => AnyRefresher::Local(LocalRefresher::new(provider, store)),
    };

    let session = Session::new(subject, connector, refresher)
        .with_reconnect_policy(config.reconnect.clone());
    Ok((credential, session))
}
