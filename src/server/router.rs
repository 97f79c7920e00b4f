//! Per-session receive loop, outbound writer and message routing.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ServerContext;
use crate::chat_log::LogRecord;
use crate::constants::INVALID_USERNAME;
use crate::protocol::{ChatFrame, Frame, FrameReader, forward_message};
use crate::registry::ConnectionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
}

/// A logged-in user bound to one connection.
#[derive(Debug)]
pub struct Session {
    username: String,
    handle: ConnectionHandle,
    state: SessionState,
}

impl Session {
    pub fn new(username: String, handle: ConnectionHandle) -> Self {
        Self {
            username,
            handle,
            state: SessionState::Active,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Marks the session as closing and drops its registry entry, so no
    /// new message can be routed to it.
    async fn close(&mut self, ctx: &ServerContext) {
        self.state = SessionState::Closing;

        match ctx.registry.remove(&self.username).await {
            Some(removed) if removed != self.handle => {
                warn!(username = %self.username, "Registry held another connection for this name");
            }
            Some(_) => {}
            None => debug!(username = %self.username, "Session already gone from registry"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Queued for the recipient and logged.
    Delivered,
    /// The recipient is offline; the sender was told (if still registered).
    RecipientNotFound,
    /// The recipient's connection closed before the message could be
    /// queued. The message is still logged.
    DeliveryFailed,
}

/// Routes one chat frame from `sender`. Delivery is attempted once and
/// never retried.
pub async fn route_frame(ctx: &ServerContext, sender: &str, frame: &Frame) -> RouteOutcome {
    let chat = ChatFrame::parse(&frame.text);

    let Some(recipient) = ctx.registry.lookup(chat.recipient).await else {
        match ctx.registry.lookup(sender).await {
            Some(own) => {
                if !own.send(Bytes::from_static(INVALID_USERNAME.as_bytes())) {
                    debug!(%sender, "Sender closed before invalid-username notice");
                }
            }
            None => debug!(%sender, "Sender no longer registered, notice skipped"),
        }
        return RouteOutcome::RecipientNotFound;
    };

    let message = forward_message(sender, chat.payload, frame.delimited);
    let outcome = if recipient.send(message) {
        RouteOutcome::Delivered
    } else {
        debug!(%sender, recipient = %chat.recipient, "Recipient closed, message dropped");
        RouteOutcome::DeliveryFailed
    };

    let record = LogRecord::new(sender, chat.recipient, chat.payload);
    if let Err(e) = ctx.chat_log.append(&record).await {
        warn!(error = %e, "Failed to write chat log");
    }

    outcome
}

/// Runs the receive loop for `session` until the peer leaves, its writer
/// fails, or shutdown is requested. Always removes the session from the
/// registry and cancels `closed` before returning.
pub(super) async fn run<R>(
    ctx: &ServerContext,
    mut session: Session,
    frames: &mut FrameReader<R>,
    closed: &CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        tokio::select! {
            _ = closed.cancelled() => {
                debug!("Session closed, leaving receive loop");
                break;
            }

            frame = frames.next_frame() => {
                match frame {
                    Ok(Some(frame)) => {
                        route_frame(ctx, &session.username, &frame).await;
                    }
                    Ok(None) => {
                        debug!("Peer disconnected");
                        break;
                    }
                    Err(e) => {
                        debug!(error = %e, "Read from peer failed");
                        break;
                    }
                }
            }
        }
    }

    session.close(ctx).await;
    closed.cancel();

    info!(username = %session.username(), state = ?session.state(), "Session closed");
}

/// Writes queued deliveries to the peer until `closed` is cancelled, every
/// sender is gone, or a write fails. Runs beside the receive loop, so a
/// peer that stops reading stalls only its own inbox.
///
/// The queue is unbounded: a recipient that never reads keeps its pending
/// messages in memory until its session closes.
pub(super) async fn write_outbound<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    closed: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            _ = closed.cancelled() => break,
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        tokio::select! {
            _ = closed.cancelled() => break,
            written = writer.write_all(&message) => {
                if let Err(e) = written {
                    debug!(error = %e, "Write to peer failed");
                    break;
                }
            }
        }
    }

    closed.cancel();
    outbound.close();

    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Error closing connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionId;
    use crate::server::tests::test_context;
    use tokio_test::io::Builder;

    fn handle(id: u64) -> (ConnectionHandle, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(ConnectionId(id), tx), rx)
    }

    #[tokio::test]
    async fn test_delivers_to_registered_recipient() {
        let (ctx, dir) = test_context().await;
        let (alice, mut alice_rx) = handle(1);
        let (bob, mut bob_rx) = handle(2);
        ctx.registry().login("alice", alice).await;
        ctx.registry().login("bob", bob).await;

        let outcome = route_frame(&ctx, "alice", &Frame::new("bob:hello", false)).await;

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(&bob_rx.recv().await.unwrap()[..], b"alice:hello");
        assert!(alice_rx.try_recv().is_err());

        ctx.chat_log().close().await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("chats.txt")).unwrap();
        assert_eq!(log, "alice to bob: hello\n");
    }

    #[tokio::test]
    async fn test_delimited_frame_forwarded_with_newline() {
        let (ctx, _dir) = test_context().await;
        let (bob, mut bob_rx) = handle(2);
        ctx.registry().login("bob", bob).await;

        route_frame(&ctx, "alice", &Frame::new("bob:hi there", true)).await;
        assert_eq!(&bob_rx.recv().await.unwrap()[..], b"alice:hi there\n");
    }

    #[tokio::test]
    async fn test_unknown_recipient_notifies_sender() {
        let (ctx, dir) = test_context().await;
        let (alice, mut alice_rx) = handle(1);
        ctx.registry().login("alice", alice).await;

        let outcome = route_frame(&ctx, "alice", &Frame::new("bob:hello", false)).await;

        assert_eq!(outcome, RouteOutcome::RecipientNotFound);
        assert_eq!(&alice_rx.recv().await.unwrap()[..], b"Invalid username\n");

        ctx.chat_log().close().await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("chats.txt")).unwrap();
        assert!(log.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipient_with_sender_gone() {
        let (ctx, _dir) = test_context().await;

        let outcome = route_frame(&ctx, "alice", &Frame::new("bob:hello", false)).await;
        assert_eq!(outcome, RouteOutcome::RecipientNotFound);
    }

    #[tokio::test]
    async fn test_frame_without_colon_targets_whole_text() {
        let (ctx, _dir) = test_context().await;
        let (bob, mut bob_rx) = handle(2);
        ctx.registry().login("bob", bob).await;

        let outcome = route_frame(&ctx, "alice", &Frame::new("bob", false)).await;

        assert_eq!(outcome, RouteOutcome::Delivered);
        assert_eq!(&bob_rx.recv().await.unwrap()[..], b"alice:");
    }

    #[tokio::test]
    async fn test_closed_recipient_is_still_logged() {
        let (ctx, dir) = test_context().await;
        let (bob, bob_rx) = handle(2);
        ctx.registry().login("bob", bob).await;
        drop(bob_rx);

        let outcome = route_frame(&ctx, "alice", &Frame::new("bob:hello", false)).await;
        assert_eq!(outcome, RouteOutcome::DeliveryFailed);

        ctx.chat_log().close().await.unwrap();
        let log = std::fs::read_to_string(dir.path().join("chats.txt")).unwrap();
        assert_eq!(log, "alice to bob: hello\n");
    }

    #[tokio::test]
    async fn test_session_close_unregisters() {
        let (ctx, _dir) = test_context().await;
        let (alice, _alice_rx) = handle(1);
        ctx.registry().login("alice", alice.clone()).await;

        let mut session = Session::new("alice".into(), alice);
        assert_eq!(session.state(), SessionState::Active);

        session.close(&ctx).await;
        assert_eq!(session.state(), SessionState::Closing);
        assert!(ctx.registry().lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_run_exits_and_unregisters_on_eof() {
        let (ctx, _dir) = test_context().await;
        let (alice, _alice_rx) = handle(1);
        let (bob, mut bob_rx) = handle(2);
        ctx.registry().login("alice", alice.clone()).await;
        ctx.registry().login("bob", bob).await;

        let mock = Builder::new().read(b"bob:hi").build();
        let mut frames = FrameReader::new(mock, 1024);
        let closed = CancellationToken::new();

        run(&ctx, Session::new("alice".into(), alice), &mut frames, &closed).await;

        assert_eq!(&bob_rx.recv().await.unwrap()[..], b"alice:hi");
        assert!(closed.is_cancelled());
        assert!(ctx.registry().lookup("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_writer_drains_queue_then_stops_when_senders_leave() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Bytes::from_static(b"alice:one")).unwrap();
        tx.send(Bytes::from_static(b"alice:two")).unwrap();
        drop(tx);

        let writer = Builder::new().write(b"alice:one").write(b"alice:two").build();
        let closed = CancellationToken::new();
        write_outbound(writer, rx, closed.clone()).await;

        assert!(closed.is_cancelled());
    }
}
