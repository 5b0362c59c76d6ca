//! Tandem server: hosts shared documents for sync clients.
//!
//! Configuration comes from the environment:
//! - `TANDEM_BIND`: listen address (default `127.0.0.1:8844`)
//! - `TANDEM_BROADCAST_CAPACITY`: presence messages buffered per connection
//! - `RUST_LOG`: log filter

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tandem_collab::server::{ServerConfig, SyncServer};

const STATS_INTERVAL: Duration = Duration::from_secs(60);

/// Build the server config from `lookup`, falling back to defaults for
/// missing or unparsable values.
fn config_from(lookup: impl Fn(&str) -> Option<String>) -> ServerConfig {
    let mut config = ServerConfig::default();
    if let Some(bind) = lookup("TANDEM_BIND") {
        config.bind_addr = bind;
    }
    if let Some(raw) = lookup("TANDEM_BROADCAST_CAPACITY") {
        match raw.parse::<usize>() {
            Ok(capacity) if capacity > 0 => config.broadcast_capacity = capacity,
            _ => log::warn!("Ignoring TANDEM_BROADCAST_CAPACITY={raw}"),
        }
    }
    config
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from(|key| std::env::var(key).ok());
    info!("Starting Tandem server on {}...", config.bind_addr);

    let server = Arc::new(SyncServer::new(config));

    let monitor = server.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = monitor.stats().await;
            info!(
                "{} users, {} documents, {} connections total, {} messages ({} bytes)",
                stats.active_users,
                stats.active_documents,
                stats.total_connections,
                stats.total_messages,
                stats.total_bytes
            );
        }
    });

    server.run().await
}
