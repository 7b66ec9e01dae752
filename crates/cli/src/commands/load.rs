// `chatgen load`: fleet load test.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chatgen_client::config::ChatgenConfig;
use chatgen_client::fleet::{self, FleetError, FleetReport, TokenSessionFactory};
use chatgen_client::transport::StompWsConnector;
use clap::Args;
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use super::token_provider;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct LoadArgs {
    /// Number of clients (defaults to CHATGEN_NUM_CLIENTS).
    #[arg(long)]
    clients: Option<usize>,

    /// Seconds over which client connects are spread.
    #[arg(long)]
    ramp_up_secs: Option<u64>,

    /// Messages per second per client.
    #[arg(long)]
    rate: Option<f64>,

    /// Seconds to observe after ramp-up before shutting down.
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Room to load (defaults to CHATGEN_ROOM_ID).
    #[arg(long)]
    room: Option<String>,
}

impl LoadArgs {
    fn apply(self, config: &mut ChatgenConfig) {
        if let Some(clients) = self.clients {
            config.num_clients = clients;
        }
        if let Some(secs) = self.ramp_up_secs {
            config.ramp_up = Duration::from_secs(secs);
        }
        if let Some(rate) = self.rate {
            config.messages_per_second = rate;
        }
        if let Some(secs) = self.duration_secs {
            config.test_duration = Duration::from_secs(secs);
        }
        if let Some(room) = self.room {
            config.room_id = room;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct LoadSummary {
    attempted: usize,
    connected: usize,
    failed: usize,
    failure_samples: Vec<String>,
    unreported_failures: usize,
    sent: u64,
    dropped: u64,
    received: u64,
    disconnected: usize,
    #[serde(skip)]
    text: String,
}

impl From<&FleetReport> for LoadSummary {
    fn from(report: &FleetReport) -> Self {
        Self {
            attempted: report.attempted,
            connected: report.connected,
            failed: report.failed,
            failure_samples: report.failure_samples.clone(),
            unreported_failures: report.unreported_failures,
            sent: report.messages.sent,
            dropped: report.messages.dropped,
            received: report.messages.received,
            disconnected: report.disconnected,
            text: report.to_string(),
        }
    }
}

pub async fn run(
    args: LoadArgs,
    mut config: ChatgenConfig,
    format: OutputFormat,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    args.apply(&mut config);
    config.validate()?;
    let bus = config.require_bus()?;
    let provider = token_provider(&config)?;
    let connector = StompWsConnector::new(&bus.websocket_url)
        .with_context(|| format!("invalid bus endpoint {}", bus.websocket_url))?;
    let factory = Arc::new(TokenSessionFactory::new(provider, connector, config.reconnect.clone()));
    let fleet_config = config.fleet_config();
    info!(
        clients = fleet_config.clients,
        rate = fleet_config.messages_per_second,
        room = %fleet_config.room_id,
        "starting load test"
    );

    match fleet::run(factory, fleet_config, shutdown).await {
        Ok(report) => {
            output::print_output(format, &LoadSummary::from(&report), |s| s.text.clone())?;
            Ok(())
        }
        Err(err) => {
            let FleetError::NoClientsConnected { report, .. } = &err;
            output::print_output(format, &LoadSummary::from(report.as_ref()), |s| s.text.clone())?;
            Err(err.into())
        }
    }
}
