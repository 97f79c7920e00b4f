//! Server configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;
use crate::constants::{
    DEFAULT_ACCEPT_POLL_MS, DEFAULT_HOST, DEFAULT_LOG_PATH, DEFAULT_PORT, MAX_FRAME_LEN,
    MAX_USERNAME_LEN,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Append-only log of delivered messages
    pub log_path: PathBuf,

    /// How long the acceptor waits for a connection before re-checking for
    /// shutdown
    pub accept_poll_interval_ms: u64,

    /// Largest frame taken from a single read
    pub max_frame_len: usize,

    /// Longest username accepted at login
    pub max_username_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            accept_poll_interval_ms: DEFAULT_ACCEPT_POLL_MS,
            max_frame_len: MAX_FRAME_LEN,
            max_username_len: MAX_USERNAME_LEN,
        }
    }
}

impl ServerConfig {
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: ServerConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(ServerConfig::default())
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn accept_poll_interval(&self) -> Duration {
        Duration::from_millis(self.accept_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load_or_default(dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.port, 3490);
        assert_eq!(config.listen_addr(), "0.0.0.0:3490");
        assert_eq!(config.log_path, PathBuf::from("chats.txt"));
        assert_eq!(config.accept_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat-relay.toml");
        std::fs::write(&path, "port = 4000\nmax_username_len = 8\n").unwrap();

        let config = ServerConfig::load_or_default(&path).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.max_username_len, 8);
        assert_eq!(config.max_frame_len, 1024);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat-relay.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();

        assert!(matches!(
            ServerConfig::load_or_default(&path),
            Err(crate::Error::Config(_))
        ));
    }
}
