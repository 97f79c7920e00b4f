//! # chat-relay
//!
//! A minimal multi-client chat relay over TCP.
//!
//! Clients log in with a username and then send `recipient:payload` frames;
//! the server forwards each one to the named recipient as `sender:payload`
//! and appends it to a plain-text chat log.

pub mod chat_log;
pub mod client;
pub mod config;
pub mod constants;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;

pub use chat_log::{ChatLog, LogRecord};
pub use config::ServerConfig;
pub use error::{Error, Result};
pub use registry::{ConnectionHandle, ConnectionId, LoginOutcome, SessionRegistry};
pub use server::{ChatServer, ServerContext};
