//! Relay server: connection acceptor, per-connection tasks and shutdown.
//!
//! ```text
//! ChatServer::run ──accept──▶ serve_connection (one task per client)
//!       │                         │
//!       │                         ├─ handshake: username → registry.login
//!       │                         ├─ router:    frames → registry.lookup → peer handle
//!       │                         └─ writer:    queued deliveries → socket
//!       ▼
//! drop listener → ServerContext::shutdown: cancel token → wait for tasks → close chat log
//! ```
//!
//! All shared state lives in one [`ServerContext`], so several independent
//! servers can run in the same process.

mod handshake;
mod router;

pub use handshake::{HandshakeOutcome, Rejection, perform_handshake, validate_username};
pub use router::{RouteOutcome, Session, SessionState, route_frame};

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, info, info_span, warn};

use crate::chat_log::ChatLog;
use crate::config::ServerConfig;
use crate::protocol::FrameReader;
use crate::registry::{ConnectionHandle, ConnectionId, SessionRegistry};
use crate::{Error, Result};

/// State shared by the acceptor and every connection task.
#[derive(Debug)]
pub struct ServerContext {
    registry: SessionRegistry,
    chat_log: ChatLog,
    shutdown: CancellationToken,
    workers: TaskTracker,
    connection_counter: AtomicU64,
    max_frame_len: usize,
    max_username_len: usize,
}

impl ServerContext {
    pub fn new(config: &ServerConfig, chat_log: ChatLog) -> Self {
        Self {
            registry: SessionRegistry::new(),
            chat_log,
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
            connection_counter: AtomicU64::new(1),
            max_frame_len: config.max_frame_len,
            max_username_len: config.max_username_len,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn chat_log(&self) -> &ChatLog {
        &self.chat_log
    }

    /// Token that is cancelled once shutdown starts.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Asks the acceptor and all connection tasks to stop. Safe to call
    /// any number of times.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Number of connection tasks still running.
    pub fn active_connections(&self) -> usize {
        self.workers.len()
    }

    fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.connection_counter.fetch_add(1, Ordering::Relaxed))
    }

    /// Stops all work and waits for it to finish: cancels the token, waits
    /// for every connection task to exit, then closes the chat log.
    ///
    /// Repeated calls wait for the same (already empty) set of tasks and
    /// leave the closed log alone.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        self.workers.close();

        info!(
            connections = self.workers.len(),
            "Waiting for connection tasks to finish"
        );
        self.workers.wait().await;

        if self.chat_log.close().await? {
            info!(path = %self.chat_log.path().display(), "Chat log flushed and closed");
        }

        Ok(())
    }

    /// Spawns a connection task tracked for shutdown.
    pub fn spawn_connection<S>(self: &Arc<Self>, stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let id = self.next_connection_id();
        let span = info_span!("connection", %id, %peer);
        self.workers
            .spawn(serve_connection(Arc::clone(self), stream, id).instrument(span));
    }
}

/// Listening socket plus the context it feeds.
pub struct ChatServer {
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    poll_interval: Duration,
}

impl ChatServer {
    /// Binds the configured address. A failure here is fatal for the process.
    pub async fn bind(config: &ServerConfig, ctx: Arc<ServerContext>) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;

        Ok(Self {
            listener,
            ctx,
            poll_interval: config.accept_poll_interval(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Accepts connections until shutdown is requested, then closes the
    /// listener, drains every connection task and closes the chat log.
    pub async fn run(self) -> Result<()> {
        let ChatServer {
            listener,
            ctx,
            poll_interval,
        } = self;

        info!(addr = %listener.local_addr()?, "Waiting for connections");

        while !ctx.is_shutting_down() {
            tokio::select! {
                _ = ctx.shutdown.cancelled() => break,

                accepted = tokio::time::timeout(poll_interval, listener.accept()) => {
                    match accepted {
                        // Nothing pending; loop around and re-check for shutdown.
                        Err(_) => continue,
                        Ok(Ok((stream, addr))) => dispatch(&ctx, stream, addr),
                        Ok(Err(e)) => {
                            if ctx.is_shutting_down() {
                                break;
                            }
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        info!("Server shutting down");
        drop(listener);
        ctx.shutdown().await?;
        info!("Server terminated");

        Ok(())
    }
}

fn dispatch(ctx: &Arc<ServerContext>, stream: TcpStream, addr: SocketAddr) {
    info!(peer = %addr, "Got connection");

    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    ctx.spawn_connection(stream, addr.to_string());
}

/// Drives one connection from login to teardown.
async fn serve_connection<S>(ctx: Arc<ServerContext>, stream: S, id: ConnectionId)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, mut writer) = tokio::io::split(stream);
    let mut frames = FrameReader::new(read_half, ctx.max_frame_len);
    let (tx, outbound) = mpsc::unbounded_channel();
    let handle = ConnectionHandle::new(id, tx);

    let username = match perform_handshake(&ctx, &mut frames, &mut writer, &handle).await {
        Ok(HandshakeOutcome::Welcomed(username)) => username,
        Ok(HandshakeOutcome::Rejected(reason)) => {
            debug!(?reason, "Closing rejected connection");
            return close_writer(writer).await;
        }
        Ok(HandshakeOutcome::Disconnected) => {
            debug!("Peer left before logging in");
            return close_writer(writer).await;
        }
        Err(e) => {
            debug!(error = %e, "Handshake failed");
            return close_writer(writer).await;
        }
    };

    let closed = ctx.shutdown.child_token();
    let write_task = tokio::spawn(
        router::write_outbound(writer, outbound, closed.clone()).instrument(Span::current()),
    );

    router::run(&ctx, Session::new(username, handle), &mut frames, &closed).await;

    if let Err(e) = write_task.await {
        warn!(error = %e, "Writer task failed");
    }
}

async fn close_writer<W>(mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "Error closing connection");
    }
}
