//! File-based configuration.
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0:9090"
//! storage_path = "/var/lib/syncnote"
//!
//! [client]
//! server_url = "ws://sync.example.com:9090"
//!
//! [autosave]
//! debounce_ms = 500
//! ```
//!
//! Every section and field is optional. The relay binary reads `[server]`
//! only; `[client]` and `[autosave]` are for applications that embed
//! [`DocumentSession`](crate::session::DocumentSession) and build its
//! settings with [`CollabConfig::session`].

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

use crate::client::ClientConfig;
use crate::persistence::AutoSaveConfig;
use crate::server::ServerConfig;
use crate::session::SessionConfig;

/// Overrides `server.bind_addr`.
pub const BIND_ENV: &str = "SYNCNOTE_BIND";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid {BIND_ENV} value {0:?}")]
    BindAddr(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CollabConfig {
    pub server: ServerConfig,
    pub client: ClientConfig,
    pub autosave: AutoSaveConfig,
}

impl CollabConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path`, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Settings for an online document session announced as `peer_name`.
    pub fn session(&self, peer_name: impl Into<String>) -> SessionConfig {
        SessionConfig {
            peer_name: peer_name.into(),
            autosave: self.autosave.clone(),
            client: Some(self.client.clone()),
        }
    }

    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var(BIND_ENV) {
            self.server.bind_addr = parse_bind(&value)?.to_string();
        }
        Ok(())
    }
}

fn parse_bind(value: &str) -> Result<SocketAddr, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::BindAddr(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = CollabConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.bind_addr, ServerConfig::default().bind_addr);
        assert_eq!(config.client.server_url, ClientConfig::default().server_url);
        assert_eq!(config.autosave, AutoSaveConfig::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = CollabConfig::from_toml_str(
            r#"
            [server]
            bind_addr = "0.0.0.0:7000"
            max_peers_per_room = 4

            [autosave]
            debounce_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.server.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.server.max_peers_per_room, 4);
        assert_eq!(config.server.heartbeat_interval_secs, ServerConfig::default().heartbeat_interval_secs);
        assert_eq!(config.autosave.debounce_ms, 250);
    }

    #[test]
    fn test_session_uses_client_and_autosave_sections() {
        let config = CollabConfig::from_toml_str(
            r#"
            [client]
            server_url = "ws://relay.test:9090"

            [autosave]
            debounce_ms = 750
            "#,
        )
        .unwrap();
        let session = config.session("Alice");
        assert_eq!(session.peer_name, "Alice");
        assert_eq!(session.autosave.debounce_ms, 750);
        assert_eq!(session.client.unwrap().server_url, "ws://relay.test:9090");
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            CollabConfig::from_toml_str("[server\nbind_addr = 1"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nserver_url = \"ws://example.test:1\"").unwrap();
        let config = CollabConfig::load(file.path()).unwrap();
        assert_eq!(config.client.server_url, "ws://example.test:1");

        assert!(matches!(
            CollabConfig::load(file.path().with_extension("missing")),
            Err(ConfigError::Io(_))
        ));
    }

    #[test]
    fn test_parse_bind() {
        assert_eq!(parse_bind(" 127.0.0.1:1 ").unwrap(), "127.0.0.1:1".parse::<SocketAddr>().unwrap());
        assert!(matches!(parse_bind("nope"), Err(ConfigError::BindAddr(_))));
    }
}
