//! Standalone room server.
//!
//! `LIVEROOM_BIND` sets the listen address, `LIVEROOM_DATA` a RocksDB
//! directory (in-memory when unset). Logging follows `RUST_LOG`.

use std::path::PathBuf;

use liveroom::{RoomServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Ok(bind) = std::env::var("LIVEROOM_BIND") {
        config.bind_addr = bind;
    }
    config.storage_path = std::env::var_os("LIVEROOM_DATA").map(PathBuf::from);

    log::info!(
        "Starting liveroom server ({})",
        match &config.storage_path {
            Some(path) => format!("data in {}", path.display()),
            None => "in-memory".to_string(),
        }
    );

    let server = RoomServer::new(config)?;
    server.run().await
}
