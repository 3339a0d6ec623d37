mod agent;
mod announce;
mod bridge;
mod config;
mod manager;
mod ndef;
mod protocol;
mod reader;
mod remote;
mod server;
mod tag;
mod tls;

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::agent::Agent;
use crate::announce::Announcer;
use crate::config::{Config, DEFAULT_CONSUMER_PORT, DEFAULT_INPUT_PORT};

/// Local NFC agent: bridges PC/SC readers and remote devices onto one
/// WebSocket event stream.
#[derive(Debug, Parser)]
#[command(name = "nfc-agent", version)]
struct Args {
    /// Reader to use (`pcsc:<name>` or a plain reader name); autodetects
    /// when omitted
    #[arg(short, long)]
    device: Option<String>,

    /// Address to bind both servers to
    #[arg(long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Device-facing (producer) port
    #[arg(long, default_value_t = DEFAULT_INPUT_PORT)]
    input_port: u16,

    /// Client-facing (consumer) port
    #[arg(long, default_value_t = DEFAULT_CONSUMER_PORT)]
    consumer_port: u16,

    /// Shared secret clients must present; first-connection-wins when unset
    #[arg(long)]
    api_secret: Option<String>,

    /// Allowed card type, repeatable; all types allowed when omitted
    #[arg(long = "allow-type")]
    allow_types: Vec<String>,

    /// Serve plain HTTP instead of TLS
    #[arg(long)]
    no_tls: bool,

    /// Directory for the CA and server certificate
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// Disable mDNS announcement
    #[arg(long)]
    no_mdns: bool,

    /// Expose POST /api/v1/tag for synthetic scans
    #[arg(long)]
    enable_tag_injection: bool,

    /// Run headless (no tray integration); currently the only mode
    #[arg(long)]
    cli: bool,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            device: self.device,
            bind_address: self.bind,
            input_port: self.input_port,
            consumer_port: self.consumer_port,
            api_secret: self.api_secret,
            allowed_types: (!self.allow_types.is_empty())
                .then(|| self.allow_types.into_iter().collect::<HashSet<_>>()),
            tls_enabled: !self.no_tls,
            cert_dir: self.cert_dir.unwrap_or(defaults.cert_dir),
            allow_injection: self.enable_tag_injection,
            mdns_enabled: !self.no_mdns,
            instance_name: defaults.instance_name,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nfc_agent=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config();
    let mdns_enabled = config.mdns_enabled;
    let instance = config.instance_name.clone();
    let (input_port, consumer_port) = (config.input_port, config.consumer_port);

    let agent = Agent::new(config);
    // A port conflict or TLS failure here is fatal: exit non-zero.
    agent.start().await?;
    tracing::info!(input_port, consumer_port, "nfc-agent running");

    let announcer = if mdns_enabled {
        match Announcer::start(&instance, input_port, consumer_port) {
            Ok(announcer) => Some(announcer),
            Err(err) => {
                tracing::warn!(error = %err, "mDNS announcement unavailable");
                None
            }
        }
    } else {
        None
    };

    wait_for_shutdown_signal().await;
    tracing::info!("shutting down");

    if let Some(announcer) = announcer {
        announcer.shutdown();
    }
    agent.stop().await;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
