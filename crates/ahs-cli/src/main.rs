//! ahs: operator CLI for the AHS admin panel.
//!
//! Creates the root key, derives and persists owner keys, issues and
//! verifies tokens, and sends single commands over the command WebSocket.

mod commands;
mod config;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::error;

use commands::call::{parse_kwargs, CallRequest};

/// ahs: AHS admin panel tooling
#[derive(Parser)]
#[command(name = "ahs", version, about = "AHS admin panel tooling: keys, tokens, and command calls")]
struct Cli {
    /// Config file path
    #[arg(long = "config", global = true, default_value = "~/.ahs/config.toml")]
    config: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a password-protected root key
    CreateRootKey {
        /// Curve (secp256r1, secp521r1)
        #[arg(long)]
        curve: Option<String>,
        /// Output path (defaults to the configured root key)
        #[arg(long)]
        out: Option<String>,
    },

    /// Derive and persist key INDEX of OWNER
    DeriveKey {
        owner: String,
        #[arg(default_value_t = 1)]
        index: u32,
    },

    /// Issue a signed token for OWNER
    IssueToken {
        owner: String,
        /// Token id (random when omitted)
        #[arg(long)]
        token_id: Option<String>,
    },

    /// Verify a token against the configured root key
    VerifyToken { token: String },

    /// Send one command and print its responses
    Call {
        /// WebSocket URL, e.g. ws://127.0.0.1:8420/ws/
        url: String,
        /// Command namespace
        app: String,
        /// Command name
        cmd: String,
        /// Keyword arguments as key=value (values parsed as JSON when possible)
        kwargs: Vec<String>,
        /// Bearer token
        #[arg(long, env = "AHS_TOKEN")]
        token: Option<String>,
        /// Logical stream to frame the request for
        #[arg(long)]
        stream: Option<String>,
        /// Send a bare frame, without stream framing
        #[arg(long, conflicts_with = "stream")]
        raw: bool,
        /// Seconds of silence before giving up
        #[arg(long)]
        wait: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("ahs=debug,ahs_cli=debug,ahs_core=debug")
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("ahs=warn,ahs_cli=warn")
            .with_target(false)
            .init();
    }

    let cfg = match config::Config::load(&PathBuf::from(&cli.config)) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ahs: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Command::CreateRootKey { curve, out } => {
            commands::keys::run_create_root(&cfg, curve.as_deref(), out.as_deref()).await
        }
        Command::DeriveKey { owner, index } => commands::keys::run_derive(&cfg, &owner, index).await,
        Command::IssueToken { owner, token_id } => {
            commands::token::run_issue(&cfg, &owner, token_id.as_deref()).await
        }
        Command::VerifyToken { token } => commands::token::run_verify(&cfg, &token).await,
        Command::Call {
            url,
            app,
            cmd,
            kwargs,
            token,
            stream,
            raw,
            wait,
        } => match parse_kwargs(&kwargs) {
            Ok(kwargs) => {
                let stream = match (raw, stream) {
                    (true, _) => None,
                    (false, Some(s)) => Some(s),
                    (false, None) => Some(cfg.client.stream.clone()).filter(|s| !s.is_empty()),
                };
                commands::call::run(CallRequest {
                    url,
                    app,
                    cmd,
                    kwargs,
                    token,
                    stream,
                    wait: Duration::from_secs(wait.unwrap_or(cfg.client.wait_secs)),
                })
                .await
            }
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("ahs: {e:#}");
        std::process::exit(1);
    }
}
