//! Relay server binary.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: ingress on 5555, publish on 5556, discovery on 9999
//! roomcast-server
//!
//! # Config file plus overrides
//! roomcast-server --config relay.toml --dealer-port 6000 --log-format json
//! ```

use clap::Parser;
use roomcast_server::{Config, FileConfig, LogFormat, Overrides, Server};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// LAN relay server for location-based XR sessions.
#[derive(Parser, Debug)]
#[command(name = "roomcast-server")]
#[command(about = "LAN relay server for location-based XR sessions")]
#[command(version)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Request-socket port
    #[arg(long)]
    dealer_port: Option<u16>,

    /// Publish-socket port
    #[arg(long)]
    pub_port: Option<u16>,

    /// Discovery-beacon port
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Answer LAN discovery probes
    #[arg(long)]
    enable_discovery: Option<bool>,

    /// Name advertised in discovery replies
    #[arg(long)]
    server_name: Option<String>,

    /// Seconds of silence before a client is reaped
    #[arg(long)]
    inactivity_timeout_seconds: Option<f64>,

    /// Fastest broadcast period in milliseconds
    #[arg(long)]
    broadcast_min_period_ms: Option<u64>,

    /// Slowest broadcast period in milliseconds
    #[arg(long)]
    broadcast_max_period_ms: Option<u64>,

    /// Admin-interface port
    #[arg(long)]
    admin_port: Option<u16>,

    /// Serve the admin HTTP interface
    #[arg(long)]
    admin_enabled: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Args {
    fn overrides(self) -> (Option<std::path::PathBuf>, Overrides) {
        let Self {
            config,
            dealer_port,
            pub_port,
            discovery_port,
            enable_discovery,
            server_name,
            inactivity_timeout_seconds,
            broadcast_min_period_ms,
            broadcast_max_period_ms,
            admin_port,
            admin_enabled,
            log_level,
            log_format,
        } = self;
        (config, Overrides {
            dealer_port,
            pub_port,
            discovery_port,
            enable_discovery,
            server_name,
            inactivity_timeout_seconds,
            broadcast_min_period_ms,
            broadcast_max_period_ms,
            admin_port,
            admin_enabled,
            log_level,
            log_format,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (config_path, overrides) = Args::parse().overrides();

    let file = match &config_path {
        Some(path) => FileConfig::parse(&std::fs::read_to_string(path)?)?,
        None => FileConfig::default(),
    };
    let config = Config::resolve(file, overrides)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    match config.log_format {
        LogFormat::Text => {
            tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
        },
        LogFormat::Json => {
            tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
        },
    }

    tracing::info!("roomcast relay starting");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let server = Server::bind(config).await?;
    tracing::info!("ingress on {}", server.dealer_addr()?);
    tracing::info!("publish on {}", server.pub_addr()?);
    if let Some(addr) = server.discovery_addr() {
        tracing::info!("discovery on {addr}");
    }
    if let Some(addr) = server.admin_addr() {
        tracing::info!("admin on {addr}");
    }

    server.run(shutdown_rx).await?;
    Ok(())
}
