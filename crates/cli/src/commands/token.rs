// `chatgen token`: issue or verify a bus access token.

use chatgen_client::config::ChatgenConfig;
use clap::Args;
use serde::Serialize;

use super::token_provider;
use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct TokenArgs {
    /// Subject to issue the token for.
    #[arg(long, default_value = "chatbot")]
    subject: String,

    /// Also issue a refresh token.
    #[arg(long, conflicts_with = "verify")]
    refresh: bool,

    /// Check an existing access token instead of issuing one.
    #[arg(long, value_name = "TOKEN")]
    verify: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
enum TokenOutput {
    Issued {
        subject: String,
        access_token: String,
        expires_at: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
    Verified {
        subject: String,
        valid: bool,
    },
}

pub fn run(args: TokenArgs, config: ChatgenConfig, format: OutputFormat) -> anyhow::Result<()> {
    let provider = token_provider(&config)?;

    let result = match args.verify {
        Some(token) => TokenOutput::Verified { subject: provider.validate(&token)?, valid: true },
        None if args.refresh => {
            let pair = provider.issue_pair(&args.subject)?;
            TokenOutput::Issued {
                subject: pair.access.subject,
                access_token: pair.access.token,
                expires_at: pair.access.expires_at,
                refresh_token: Some(pair.refresh.token),
            }
        }
        None => {
            let credential = provider.issue(&args.subject)?;
            TokenOutput::Issued {
                subject: credential.subject,
                access_token: credential.token,
                expires_at: credential.expires_at,
                refresh_token: None,
            }
        }
    };

    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn format_human(result: &TokenOutput) -> String {
    match result {
        TokenOutput::Issued { access_token, refresh_token: Some(refresh), .. } => {
            format!("{access_token}\nrefresh: {refresh}")
        }
        TokenOutput::Issued { access_token, .. } => access_token.clone(),
        TokenOutput::Verified { subject, .. } => format!("valid token for subject {subject}"),
    }
}
