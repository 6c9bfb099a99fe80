//! CLI binary to run a coordinator locally against in-memory backends.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use meshvault_coordinator::{Checkers, CooldownConfig, Coordinator, CoordinatorConfig};
use meshvault_locks_memory::MemoryLockManager;
use meshvault_storage_memory::MemoryStorage;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration file could not be read
    #[error("failed to read {0}: {1}")]
    ConfigRead(PathBuf, #[source] std::io::Error),

    /// Configuration file is not valid
    #[error("invalid configuration in {0}: {1}")]
    ConfigParse(PathBuf, #[source] serde_json::Error),

    /// Signal handler could not be installed
    #[error("signal handler error: {0}")]
    Signal(#[source] std::io::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// JSON coordinator configuration; defaults apply when omitted
    #[arg(long, env = "MESHVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Disable every cooldown gate
    #[arg(long, env = "MESHVAULT_NO_COOLDOWNS")]
    no_cooldowns: bool,

    /// Background workers
    #[arg(long, env = "MESHVAULT_WORKERS")]
    workers: Option<usize>,

    /// Maximum wait for a ledger lock, in milliseconds
    #[arg(long, env = "MESHVAULT_LOCK_WAIT_MS")]
    lock_wait_ms: Option<u64>,

    /// Delay before the node timeout reaper first runs, in seconds
    #[arg(long, env = "MESHVAULT_STARTUP_DELAY_SECS")]
    startup_delay_secs: Option<u64>,
}

/// Loads the configuration file, then applies command line overrides.
fn create_config(args: &Args) -> Result<CoordinatorConfig, Error> {
    let mut config = match &args.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .map_err(|e| Error::ConfigRead(path.clone(), e))?;
            serde_json::from_str(&raw).map_err(|e| Error::ConfigParse(path.clone(), e))?
        }
        None => CoordinatorConfig::default(),
    };

    if args.no_cooldowns {
        config.cooldowns = CooldownConfig::disabled();
    }
    if let Some(workers) = args.workers {
        config.workers.workers = workers;
    }
    if let Some(wait) = args.lock_wait_ms {
        config.locks.wait = Duration::from_millis(wait);
    }
    if let Some(delay) = args.startup_delay_secs {
        config.checkers.startup_delay = Duration::from_secs(delay);
    }

    Ok(config)
}

async fn wait_for_signal() -> Result<(), Error> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).map_err(Error::Signal)?;
        let mut sigint = signal(SignalKind::interrupt()).map_err(Error::Signal)?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.map_err(Error::Signal)?;
        info!("Received interrupt signal");
    }

    Ok(())
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = create_config(&args)?;

    let coordinator = Coordinator::new(MemoryStorage::new(), MemoryLockManager::new(), config);
    match coordinator.refresh_settings().await {
        Ok(loaded) => info!("loaded {} runtime settings", loaded),
        Err(e) => warn!("using default runtime settings: {}", e),
    }

    let checkers = Checkers::new(coordinator.clone());
    checkers.start();

    wait_for_signal().await?;

    info!("Shutting down");
    checkers.shutdown().await;
    coordinator.shutdown().await;

    Ok(())
}
