//! mcstore: a memcached-compatible cache with write-through persistence
//!
//! Speaks a subset of the memcached text protocol:
//! - set, add, replace, get, delete, flush_all
//! - stats, version, quit
//!
//! Features:
//! - Every mutation is persisted to a durable backend (SQLite by default)
//!   before it is acknowledged
//! - The store is reloaded from the backend at startup
//! - Configuration via CLI arguments or TOML file

mod backend;
mod config;
mod connection;
mod dispatcher;
mod protocol;
mod server;
mod stats;
mod storage;

use config::Config;
use server::Server;
use storage::Store;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        database = %config.database.display(),
        max_connections = config.max_connections,
        max_value_size = config.max_value_size,
        idle_timeout = ?config.idle_timeout,
        "Starting mcstore server"
    );

    // The store must be fully loaded before the first accept
    let backend = backend::open(&config)?;
    let store = match Store::load(backend) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to load store from backend");
            return Err(e.into());
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    Server::new(config, store).run(shutdown).await?;
    Ok(())
}
