//! Protocol constants.

/// Well-known port the relay listens on.
pub const DEFAULT_PORT: u16 = 3490;

/// Address the server binds to unless configured otherwise.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Maximum number of bytes the server takes from a single read.
pub const MAX_FRAME_LEN: usize = 1024;

/// Size of the client's reply buffer. One byte is kept back, so a reply
/// longer than `CLIENT_BUFFER_SIZE - 1` is truncated.
pub const CLIENT_BUFFER_SIZE: usize = 100;

/// Longest username accepted at login.
pub const MAX_USERNAME_LEN: usize = 32;

/// Separator between recipient (or sender) and payload in a chat frame.
pub const FRAME_SEPARATOR: char = ':';

/// Reply sent when a username is already bound to another connection.
pub const ALREADY_LOGGED_IN: &str = "User is already logged in from a different socket.\n";

/// Notice sent back to a sender whose recipient is not online, and the reply
/// to a malformed login.
pub const INVALID_USERNAME: &str = "Invalid username\n";

/// Default path of the append-only chat log.
pub const DEFAULT_LOG_PATH: &str = "chats.txt";

/// How long the acceptor waits for a pending connection before it re-checks
/// for shutdown.
pub const DEFAULT_ACCEPT_POLL_MS: u64 = 1000;
