//! devac-hub: the supervised hub process.
//!
//! Owns `{hub_dir}/central.db` and serves newline-delimited JSON requests on
//! `{hub_dir}/{socket_name}` until a client sends `shutdown`.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use devac_core::config::DevacConfig;
use devac_core::hub::HubServer;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "devac-hub", version, about = "DevAC central hub server")]
struct Args {
    /// Config file (defaults to ./.devac/config.toml, then ~/.devac/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the hub directory.
    #[arg(long)]
    hub_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = match DevacConfig::load(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    if let Some(dir) = args.hub_dir {
        config.hub.hub_dir = dir.to_string_lossy().into_owned();
    }

    tracing::info!(
        "Starting devac-hub v{} in {}",
        env!("CARGO_PKG_VERSION"),
        config.hub.hub_dir().display()
    );
    match HubServer::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("Hub exited with error: {}", e);
            ExitCode::FAILURE
        }
    }
}
