//! Login handshake: one username frame in, one reply out.

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use super::ServerContext;
use crate::Result;
use crate::constants::{ALREADY_LOGGED_IN, FRAME_SEPARATOR, INVALID_USERNAME};
use crate::protocol::{FrameReader, welcome_message};
use crate::registry::{ConnectionHandle, LoginOutcome};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// The username is registered to this connection.
    Welcomed(String),
    /// A reply explaining the rejection was sent; the connection must close.
    Rejected(Rejection),
    /// The peer closed the connection, or the server began shutting down,
    /// before a username arrived.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    InvalidUsername,
    DuplicateElsewhere,
}

/// Returns the username if it is usable as a registry key: non-empty, no
/// longer than `max_len` bytes, and free of the frame separator (a name with
/// a colon could never be addressed).
pub fn validate_username(text: &str, max_len: usize) -> Option<&str> {
    if text.is_empty() || text.len() > max_len || text.contains(FRAME_SEPARATOR) {
        return None;
    }
    Some(text)
}

/// Reads the identity frame and registers it against `handle`.
///
/// On acceptance the welcome reply is written before any message routed to
/// the new session, since deliveries are queued on `handle` and only
/// written once the router starts.
pub async fn perform_handshake<R, W>(
    ctx: &ServerContext,
    frames: &mut FrameReader<R>,
    writer: &mut W,
    handle: &ConnectionHandle,
) -> Result<HandshakeOutcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let frame = tokio::select! {
        _ = ctx.shutdown.cancelled() => return Ok(HandshakeOutcome::Disconnected),
        frame = frames.next_frame() => frame?,
    };

    let Some(frame) = frame else {
        return Ok(HandshakeOutcome::Disconnected);
    };

    info!(username = %frame.text, "Received username");

    let Some(username) = validate_username(&frame.text, ctx.max_username_len) else {
        warn!(username = %frame.text, "Rejected malformed username");
        writer.write_all(INVALID_USERNAME.as_bytes()).await?;
        writer.flush().await?;
        return Ok(HandshakeOutcome::Rejected(Rejection::InvalidUsername));
    };

    match ctx.registry.login(username, handle.clone()).await {
        LoginOutcome::Accepted => {
            let welcome = welcome_message(username);
            let sent = async {
                writer.write_all(welcome.as_bytes()).await?;
                writer.flush().await
            }
            .await;

            if let Err(e) = sent {
                ctx.registry.remove(username).await;
                return Err(e.into());
            }

            info!(%username, "User logged in");
            Ok(HandshakeOutcome::Welcomed(username.to_string()))
        }
        LoginOutcome::RejectedDuplicateElsewhere => {
            warn!(%username, "User is already logged in from a different socket");
            writer.write_all(ALREADY_LOGGED_IN.as_bytes()).await?;
            writer.flush().await?;
            Ok(HandshakeOutcome::Rejected(Rejection::DuplicateElsewhere))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionId;
    use crate::server::tests::test_context;
    use tokio::sync::mpsc;
    use tokio_test::io::Builder;

    fn handle(id: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<bytes::Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnectionId(id), tx), rx)
    }

    #[test]
    fn test_validate_username() {
        assert_eq!(validate_username("alice", 32), Some("alice"));
        assert_eq!(validate_username("", 32), None);
        assert_eq!(validate_username("al:ce", 32), None);
        assert_eq!(validate_username("abcdefghi", 8), None);
        assert_eq!(validate_username("abcdefgh", 8), Some("abcdefgh"));
    }

    #[tokio::test]
    async fn test_welcome_echoes_username() {
        let (ctx, _dir) = test_context().await;
        let (conn, _rx) = handle(1);
        let mut frames = FrameReader::new(Builder::new().read(b"alice").build(), 1024);
        let mut writer = Builder::new().write(b"Welcome alice!\n").build();

        let outcome = perform_handshake(&ctx, &mut frames, &mut writer, &conn)
            .await
            .unwrap();

        assert_eq!(outcome, HandshakeOutcome::Welcomed("alice".into()));
        assert_eq!(ctx.registry().lookup("alice").await, Some(conn));
    }

    #[tokio::test]
    async fn test_line_terminated_username() {
        let (ctx, _dir) = test_context().await;
        let (conn, _rx) = handle(1);
        let mut frames = FrameReader::new(Builder::new().read(b"alice\r\n").build(), 1024);
        let mut writer = Builder::new().write(b"Welcome alice!\n").build();

        let outcome = perform_handshake(&ctx, &mut frames, &mut writer, &conn)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Welcomed("alice".into()));
    }

    #[tokio::test]
    async fn test_duplicate_rejected_without_takeover() {
        let (ctx, _dir) = test_context().await;
        let (owner, _rx1) = handle(1);
        let (intruder, _rx2) = handle(2);
        ctx.registry().login("alice", owner.clone()).await;

        let mut frames = FrameReader::new(Builder::new().read(b"alice").build(), 1024);
        let mut writer = Builder::new().write(ALREADY_LOGGED_IN.as_bytes()).build();

        let outcome = perform_handshake(&ctx, &mut frames, &mut writer, &intruder)
            .await
            .unwrap();

        assert_eq!(
            outcome,
            HandshakeOutcome::Rejected(Rejection::DuplicateElsewhere)
        );
        assert_eq!(ctx.registry().lookup("alice").await.unwrap().id(), owner.id());
    }

    #[tokio::test]
    async fn test_malformed_username_rejected() {
        let (ctx, _dir) = test_context().await;
        let (conn, _rx) = handle(1);
        let mut frames = FrameReader::new(Builder::new().read(b"bob:hi").build(), 1024);
        let mut writer = Builder::new().write(b"Invalid username\n").build();

        let outcome = perform_handshake(&ctx, &mut frames, &mut writer, &conn)
            .await
            .unwrap();

        assert_eq!(outcome, HandshakeOutcome::Rejected(Rejection::InvalidUsername));
        assert!(ctx.registry().is_empty().await);
    }

    #[tokio::test]
    async fn test_peer_gone_before_login() {
        let (ctx, _dir) = test_context().await;
        let (conn, _rx) = handle(1);
        let mut frames = FrameReader::new(Builder::new().build(), 1024);
        let mut writer = Builder::new().build();

        let outcome = perform_handshake(&ctx, &mut frames, &mut writer, &conn)
            .await
            .unwrap();
        assert_eq!(outcome, HandshakeOutcome::Disconnected);
    }

    #[tokio::test]
    async fn test_failed_welcome_releases_name() {
        let (ctx, _dir) = test_context().await;
        let (conn, _rx) = handle(1);
        let mut frames = FrameReader::new(Builder::new().read(b"alice").build(), 1024);
        let mut writer = Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();

        let result = perform_handshake(&ctx, &mut frames, &mut writer, &conn).await;

        assert!(result.is_err());
        assert!(ctx.registry().lookup("alice").await.is_none());
    }
}
