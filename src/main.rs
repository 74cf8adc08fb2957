//! wagate — a small HTTP gateway bridging a backend application to a
//! WhatsApp account via an unofficial WhatsApp Web client library.

mod channels;
mod config;
mod forward;
mod gateway;
mod qr;
mod security;

use clap::Parser;
use config::Config;
use qr::QrState;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(author, version, about = "WhatsApp HTTP gateway")]
struct Cli {
    /// Config file path (default: ~/.wagate/config.toml)
    #[arg(long, env = "WAGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host override
    #[arg(long, env = "WAGATE_HOST")]
    host: Option<String>,

    /// Bind port override
    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(host) = cli.host {
        config.gateway.host = host;
    }
    if let Some(port) = cli.port {
        config.gateway.port = port;
    }

    if config.gateway.api_key.is_none() {
        warn!("no api_key configured — /send and /reset-auth will reject every request");
    }
    if config.forward.backend_url.is_none() {
        warn!("no backend_url configured — inbound messages will be dropped");
    }

    let qr = QrState::new();
    let backend = channels::create_backend(&config, qr.clone())?;
    info!(
        "starting whatsapp gateway (backend: {}, data dir: {})",
        backend.name(),
        config.data_dir().display()
    );

    let rx = backend.start().await?;
    match config.forward.backend_url.as_deref() {
        Some(url) => {
            let forwarder = forward::Forwarder::new(url);
            tokio::spawn(forwarder.run(rx));
        }
        None => {
            tokio::spawn(forward::drain(rx));
        }
    }

    let state = gateway::AppState::new(backend, qr, &config);
    tokio::select! {
        result = gateway::run_gateway(&config, state) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
