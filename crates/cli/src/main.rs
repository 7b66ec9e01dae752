// chatgen CLI entry point.

use std::path::PathBuf;

use chatgen_client::config::ChatgenConfig;
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "chatgen", about = "Synthetic and replayed traffic for a STOMP chat server")]
struct Cli {
    /// TOML configuration file, applied beneath environment variables.
    #[arg(long, global = true, env = "CHATGEN_CONFIG")]
    config: Option<PathBuf>,

    /// Print the error summary as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: commands::Command,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return if err.use_stderr() { ExitCode::Usage } else { ExitCode::Success }.into();
        }
    };
    let format = OutputFormat::detect(cli.json);

    let config = match ChatgenConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            output::print_error(format, ExitCode::Config.name(), &err.to_string());
            return ExitCode::Config.into();
        }
    };
    init_tracing(&config.log_filter);

    match commands::run(cli.command, config, format, shutdown_signal()).await {
        Ok(()) => ExitCode::Success.into(),
        Err(err) => {
            let code = ExitCode::from_error(&err);
            error!(exit_code = code.code(), "{err:#}");
            output::print_error(format, code.name(), &format!("{err:#}"));
            code.into()
        }
    }
}

/// `RUST_LOG` wins; otherwise the configured filter.
fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

/// Flips to true on the first Ctrl-C.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                tx.send_replace(true);
            }
            Err(error) => warn!(%error, "cannot listen for Ctrl-C"),
        }
        // A dropped sender never reads as shutdown; hold it until every
        // receiver is gone.
        tx.closed().await;
    });
    rx
}
