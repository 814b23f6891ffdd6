//! Standalone sync server.
//!
//! Environment:
//! - `TANDEM_BIND_ADDR`: listen address (default `127.0.0.1:9090`)
//! - `TANDEM_DATA_DIR`: RocksDB directory; unset keeps documents in memory
//! - `TANDEM_SAVE_DEBOUNCE_MS`: quiet period before a dirty document is saved
//! - `TANDEM_UNLOAD_DELAY_MS`: grace period before idle documents unload
//! - `RUST_LOG`: log filter

use std::sync::Arc;
use std::time::Duration;

use log::{error, info};
use tandem_collab::{MemoryStorage, RocksConfig, RocksStorage, ServerConfig, Storage, SyncServer};

type BoxError = Box<dyn std::error::Error>;

fn millis_from_env(var: &str) -> Result<Option<Duration>, BoxError> {
    match std::env::var(var) {
        Ok(raw) => {
            let ms: u64 = raw
                .parse()
                .map_err(|e| format!("{var} must be a number of milliseconds: {e}"))?;
            Ok(Some(Duration::from_millis(ms)))
        }
        Err(_) => Ok(None),
    }
}

fn config_from_env() -> Result<ServerConfig, BoxError> {
    let mut config = ServerConfig::default();
    if let Ok(addr) = std::env::var("TANDEM_BIND_ADDR") {
        config.bind_addr = addr;
    }
    if let Some(debounce) = millis_from_env("TANDEM_SAVE_DEBOUNCE_MS")? {
        config.save_debounce = debounce;
    }
    if let Some(delay) = millis_from_env("TANDEM_UNLOAD_DELAY_MS")? {
        config.unload_delay = delay;
    }
    Ok(config)
}

fn storage_from_env() -> Result<Arc<dyn Storage>, BoxError> {
    match std::env::var("TANDEM_DATA_DIR") {
        Ok(path) => {
            info!("Opening RocksDB at {path}");
            let config = RocksConfig {
                path: path.into(),
                ..RocksConfig::default()
            };
            Ok(Arc::new(RocksStorage::open(config)?))
        }
        Err(_) => {
            info!("TANDEM_DATA_DIR not set, documents are kept in memory");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

async fn run() -> Result<(), BoxError> {
    let config = config_from_env()?;
    let storage = storage_from_env()?;
    let server = SyncServer::new(config, storage);
    server.init().await?;

    tokio::select! {
        result = tandem_collab::serve(server.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, flushing documents...");
            server.docs().flush_all().await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    info!("Starting tandem server...");

    if let Err(e) = run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
