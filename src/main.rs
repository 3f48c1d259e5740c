//! tunrelay - bridge a plugin channel and a tunnel channel
//!
//! Dials both peers, relays tasks between them, and keeps the tunnel alive
//! with keepalive probes and a reconnect on failure.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use tunrelay_proto::RequestKind;
use tunrelay_server::{DirectConnector, RelayAddresses, RelayConfig, Server};

/// tunrelay - resilient plugin/tunnel relay
#[derive(Parser, Debug)]
#[command(name = "tunrelay")]
#[command(about = "Relay tasks between a plugin and a tunnel, reconnecting the tunnel on failure")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Plugin address (empty disables the plugin connection)
    #[arg(long, env = "TUNRELAY_PLUGIN", default_value = "")]
    plugin: String,

    /// Tunnel address (empty disables the tunnel connection)
    #[arg(long, env = "TUNRELAY_TUNNEL", default_value = "")]
    tunnel: String,

    /// Data address handed to data connectors
    #[arg(long, env = "TUNRELAY_DATA", default_value = "")]
    data: String,

    /// JSON config file with timing parameters
    #[arg(long, env = "TUNRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Read deadline of one poll attempt in milliseconds
    #[arg(long)]
    read_timeout_ms: Option<u64>,

    /// Frame write deadline in milliseconds
    #[arg(long)]
    write_timeout_ms: Option<u64>,

    /// Dial deadline in milliseconds
    #[arg(long)]
    dial_timeout_ms: Option<u64>,

    /// Keepalive probe interval in milliseconds
    #[arg(long)]
    probe_interval_ms: Option<u64>,

    /// Tunnel silence window in milliseconds
    #[arg(long)]
    probe_timeout_ms: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn relay_config(&self) -> Result<RelayConfig> {
        let mut config = match &self.config {
            Some(path) => RelayConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => RelayConfig::default(),
        };

        let overrides = [
            (self.read_timeout_ms, &mut config.read_timeout),
            (self.write_timeout_ms, &mut config.write_timeout),
            (self.dial_timeout_ms, &mut config.dial_timeout),
            (self.probe_interval_ms, &mut config.probe_interval),
            (self.probe_timeout_ms, &mut config.probe_timeout),
        ];
        for (millis, field) in overrides {
            if let Some(millis) = millis {
                *field = Duration::from_millis(millis);
            }
        }

        config.validate().context("Invalid relay configuration")?;
        Ok(config)
    }
}

/// Setup logging; RUST_LOG takes precedence over --verbose
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    info!("tunrelay {} ({}) starting", env!("GIT_TAG"), env!("GIT_HASH"));

    let config = cli.relay_config()?;
    let addresses = RelayAddresses::new(&cli.plugin, &cli.tunnel, &cli.data);

    let server = Server::builder(addresses)
        .config(config)
        .connector(RequestKind::CreateDirectConnect, Arc::new(DirectConnector))
        .build()
        .await
        .context("Failed to start relay server")?;
    let server = Arc::new(server);

    let dispatcher = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    tokio::select! {
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
            server.shutdown().await;
        }
        result = dispatcher => {
            match result {
                Ok(Ok(())) => info!("Dispatch loop stopped"),
                Ok(Err(e)) => {
                    error!("Dispatch loop error: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    error!("Dispatch task panicked: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    info!("tunrelay stopped");
    Ok(())
}
