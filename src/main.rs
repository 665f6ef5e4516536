//! Rover camera and drive service

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use rover::context::AppContext;
use rover::error::StartupError;
use rover::utils::lock;
use rover::{web, Config};

#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// TOML configuration file (defaults to ./rover.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(short, long)]
    port: Option<u16>,
    /// Capture device; skips discovery
    #[arg(short, long)]
    device: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("{e}");
    }
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rover=info,tower_http=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Rover launching...");

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            error!("{report:?}");
            let code = report.downcast_ref::<StartupError>().map_or(1, StartupError::exit_code);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref()).map_err(StartupError::from)?;
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(device) = cli.device {
        config.capture.device = Some(device);
    }

    // device probing and GPIO export block
    let ctx = tokio::task::spawn_blocking(move || AppContext::open(config)).await??;
    let ctx = Arc::new(ctx);

    web::serve(ctx.clone()).await.map_err(StartupError::from)?;

    if let Err(e) = lock(&ctx.tracks).stop() {
        error!("Could not stop tracks: {e}");
    }
    info!("Rover stopped");
    Ok(())
}
