//! Client side of the relay protocol.
//!
//! Login succeeds only when the server's reply is byte-for-byte the welcome
//! string for the requested name; anything else means "pick another name".

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::Result;
use crate::constants::CLIENT_BUFFER_SIZE;
pub use crate::protocol::welcome_message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginReply {
    Welcome,
    /// Any reply other than the expected welcome, as received.
    Retry(String),
    /// The server closed the connection without replying.
    Disconnected,
}

/// First whitespace-separated word of an input line, if any.
pub fn parse_username(line: &str) -> Option<&str> {
    line.split_whitespace().next()
}

/// Sends `username` and classifies the single reply that follows.
pub async fn attempt_login<S>(stream: &mut S, username: &str) -> Result<LoginReply>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(username.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; CLIENT_BUFFER_SIZE - 1];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(LoginReply::Disconnected);
    }

    let reply = String::from_utf8_lossy(&buf[..n]).into_owned();
    if reply == welcome_message(username) {
        Ok(LoginReply::Welcome)
    } else {
        Ok(LoginReply::Retry(reply))
    }
}

/// An input line as it goes on the wire: the raw text with any line ending
/// removed. The server treats each read as one message.
pub fn encode_chat_line(line: &str) -> &str {
    line.trim_end_matches(['\r', '\n'])
}
