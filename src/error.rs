//! Error types for the chat-relay library.

use std::io;

/// Result type alias for chat-relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while serving or talking to the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Chat log is already closed")]
    LogSinkClosed,
}
