//! ahs-server: command WebSocket server for the AHS admin panel.
//!
//! Accepts WebSocket connections (optionally over TLS), authenticates them
//! with signed tokens, and dispatches `command.request` frames to the
//! registered command handlers.

mod auth;
mod channel_layer;
mod commands;
mod config;
mod demux;
mod dispatch;
mod scope;
mod server;
mod transport;

use clap::Parser;
use config::{Overrides, ServerConfig};
use server::AhsServer;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

/// ahs-server: command WebSocket server
#[derive(Parser, Debug)]
#[command(name = "ahs-server", version, about = "Command WebSocket server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// TLS certificate (PEM)
    #[arg(long)]
    cert: Option<String>,

    /// TLS private key (PEM)
    #[arg(long)]
    key: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.ahs/config.toml")]
    config: String,

    /// Generate self-signed certificate for development
    #[arg(long)]
    generate_cert: bool,

    /// Key derivation curve (secp256r1, secp521r1)
    #[arg(long)]
    curve: Option<String>,

    /// Accept connections that carry no valid token
    #[arg(long)]
    allow_anonymous: bool,

    /// Generate an in-memory root key instead of loading one
    #[arg(long)]
    ephemeral_keys: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting ahs-server");

    let (cert, key) = if cli.generate_cert {
        match generate_self_signed_cert() {
            Ok((c, k)) => {
                info!(cert = %c.display(), key = %k.display(), "generated self-signed certificate");
                (Some(c.display().to_string()), Some(k.display().to_string()))
            }
            Err(e) => {
                error!(error = %e, "failed to generate self-signed certificate");
                std::process::exit(1);
            }
        }
    } else {
        (cli.cert.clone(), cli.key.clone())
    };

    let overrides = Overrides {
        port: cli.port,
        bind: cli.bind.clone(),
        cert,
        key,
        curve: cli.curve.clone(),
        allow_anonymous: cli.allow_anonymous,
        ephemeral_keys: cli.ephemeral_keys,
    };
    let config_path = PathBuf::from(&cli.config);
    let server_config = match ServerConfig::load(Some(&config_path), overrides) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let tls_config = match (&server_config.cert_path, &server_config.key_path) {
        (Some(cert), Some(key)) => match load_tls_config(cert, key) {
            Ok(cfg) => Some(Arc::new(cfg)),
            Err(e) => {
                error!(error = %e, "failed to load TLS config");
                std::process::exit(1);
            }
        },
        (None, None) => {
            warn!("no TLS certificate configured, serving plain ws://");
            None
        }
        _ => {
            error!("both --cert and --key are required for TLS");
            std::process::exit(1);
        }
    };

    let ahs_server = match AhsServer::new(server_config).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to create server");
            std::process::exit(1);
        }
    };
    info!(
        signing_key = %ahs_core::short_fingerprint(&ahs_server.tokens().public_key().fingerprint()),
        "token signing key loaded"
    );

    // Run until shutdown signal
    tokio::select! {
        result = ahs_server.run(tls_config) => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                std::process::exit(1);
            }
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    info!("ahs-server stopped");
}

/// Load TLS certificate and key from PEM files, returning a rustls ServerConfig.
fn load_tls_config(cert_path: &Path, key_path: &Path) -> Result<rustls::ServerConfig, Box<dyn std::error::Error>> {
    let cert_pem =
        std::fs::read(cert_path).map_err(|e| format!("cannot read cert {}: {e}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path).map_err(|e| format!("cannot read key {}: {e}", key_path.display()))?;

    let certs: Vec<rustls::pki_types::CertificateDer<'static>> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect::<Result<Vec<_>, _>>()?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])?.ok_or("no private key found in PEM")?;

    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // WebSocket upgrades ride on HTTP/1.1
    tls_config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(tls_config)
}

/// Generate a self-signed certificate for development use.
fn generate_self_signed_cert() -> Result<(PathBuf, PathBuf), Box<dyn std::error::Error>> {
    let ahs_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")).join(".ahs");
    std::fs::create_dir_all(&ahs_dir)?;

    let cert_path = ahs_dir.join("cert.pem");
    let key_path = ahs_dir.join("key.pem");

    let mut params = rcgen::CertificateParams::new(vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "::1".to_string(),
    ])?;
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "ahs-server dev cert");

    let key_pair = rcgen::KeyPair::generate()?;
    let cert = params.self_signed(&key_pair)?;

    std::fs::write(&cert_path, cert.pem())?;
    std::fs::write(&key_path, key_pair.serialize_pem())?;

    Ok((cert_path, key_path))
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
