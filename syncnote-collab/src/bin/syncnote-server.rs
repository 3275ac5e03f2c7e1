//! SyncNote relay server.
//!
//! Usage: `syncnote-server [config.toml]`
//!
//! Only the `[server]` section of the file applies here; `[client]` and
//! `[autosave]` are ignored by the relay.

use log::info;
use syncnote_collab::{CollabConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading configuration from {path}");
            CollabConfig::load(&path)?
        }
        None => {
            let mut config = CollabConfig::default();
            config.apply_env()?;
            config
        }
    };

    info!("Starting SyncNote relay on {}...", config.server.bind_addr);
    let server = SyncServer::new(config.server)?;
    server.run().await?;
    Ok(())
}
