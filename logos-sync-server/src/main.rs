//! Logos sync server binary

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::{error, info};
use logos_sync::{ServerConfig, SyncServer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "logos-sync-server")]
#[command(about = "Real-time canvas sync server for Logos workspaces")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 0.0.0.0:9090
    #[arg(short, long)]
    bind: Option<String>,

    /// RocksDB directory (in-memory store when omitted)
    #[arg(short, long)]
    storage: Option<PathBuf>,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig, BoxError> {
        let mut config = match &self.config {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                ServerConfig::load(path)?
            }
            None => ServerConfig::default(),
        };
        if let Some(bind) = &self.bind {
            config.bind_addr = bind.clone();
        }
        if let Some(storage) = &self.storage {
            config.storage_path = Some(storage.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let cli = Cli::parse();
    let config = cli.server_config()?;

    info!("Starting Logos sync server v{}", env!("CARGO_PKG_VERSION"));
    match &config.storage_path {
        Some(path) => info!("Persisting to {}", path.display()),
        None => info!("No storage path set, operations are kept in memory"),
    }

    let server = Arc::new(SyncServer::new(config)?);

    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            signal.shutdown();
        }
    });

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return Err(e);
    }

    info!("Server stopped");
    Ok(())
}
