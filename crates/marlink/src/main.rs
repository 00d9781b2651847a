//! marlink: ADS-B / AIS forwarding daemon
//!
//! Runs one forwarding engine per instance (`adsb`, `ais`) and the HTTP
//! control plane. Other subcommands edit the instance files offline.

mod cli;
mod commands;
mod shutdown;

use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Args, Command, Instance};
use marlink_forwarder::{run_server, ControlPlane, DefaultSourceFactory, ForwardingEngine, SourceFactory};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command.clone().unwrap_or(Command::Serve) {
        Command::Serve => serve(&args.config_dir, args.http_addr, !args.no_autostart).await,
        command => {
            let stdout = std::io::stdout();
            commands::run(&args.config_dir, command, &mut stdout.lock())
        }
    }
}

async fn serve(config_dir: &Path, http_addr: SocketAddr, autostart: bool) -> anyhow::Result<()> {
    info!(config_dir = %config_dir.display(), "Starting marlink");

    let factory: Arc<dyn SourceFactory> = Arc::new(DefaultSourceFactory);
    let mut engines = Vec::new();
    for instance in Instance::ALL {
        let registry = commands::open_registry(config_dir, instance)?;
        engines.push(Arc::new(ForwardingEngine::new(
            Arc::new(registry),
            Arc::clone(&factory),
        )));
    }
    let plane = ControlPlane::new(engines);

    if autostart {
        for engine in plane.engines() {
            if let Err(e) = engine.start().await {
                warn!(instance = %engine.name(), error = %e, "Autostart failed");
            }
        }
    }

    run_server(http_addr, plane.clone(), shutdown::wait_for_shutdown(plane)).await?;

    info!("marlink stopped");
    Ok(())
}
