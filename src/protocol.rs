//! Wire format for the relay.
//!
//! The transport carries plain text with no length prefix. A login frame is
//! the raw username; a chat frame is `recipient:payload` going in and
//! `sender:payload` coming out, split on the first colon.
//!
//! Framing follows what one socket read returns, with one addition for
//! newline-terminated peers: a read holding newlines yields one frame per
//! complete line, and a trailing partial line waits for the rest. A read
//! with no newline and nothing pending is a frame on its own, so a client
//! that sends bare `bob:hello` gets one frame per read.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::Result;
use crate::constants::FRAME_SEPARATOR;

/// One logical unit read off a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame contents without any line terminator.
    pub text: String,
    /// Whether the frame ended with a newline on the wire.
    pub delimited: bool,
}

impl Frame {
    pub fn new(text: impl Into<String>, delimited: bool) -> Self {
        Self {
            text: text.into(),
            delimited,
        }
    }
}

/// Reads frames from a byte stream, never taking more than `max_len` bytes
/// per frame.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    max_len: usize,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(max_len),
            max_len: max_len.max(1),
        }
    }

    /// Returns the next frame, or `None` once the peer has closed the
    /// connection and nothing is left buffered.
    ///
    /// Cancel safe: the only suspension point is a single `read_buf`, so a
    /// frame is never lost when this future is dropped inside `select!`.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.take_line() {
                return Ok(Some(frame));
            }

            if self.buf.len() >= self.max_len {
                return Ok(Some(self.take_all()));
            }

            // Anything still buffered here is the tail of a line whose
            // terminator has not arrived yet.
            let pending = !self.buf.is_empty();

            let room = (self.max_len - self.buf.len()) as u64;
            let n = (&mut self.inner).take(room).read_buf(&mut self.buf).await?;

            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take_all()));
            }

            if !pending && !self.buf.contains(&b'\n') {
                return Ok(Some(self.take_all()));
            }
        }
    }

    fn take_line(&mut self) -> Option<Frame> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line = self.buf.split_to(pos + 1);

        let mut end = pos;
        if end > 0 && line[end - 1] == b'\r' {
            end -= 1;
        }

        Some(Frame::new(String::from_utf8_lossy(&line[..end]), true))
    }

    fn take_all(&mut self) -> Frame {
        let chunk = self.buf.split();
        Frame::new(String::from_utf8_lossy(&chunk), false)
    }
}

/// A chat frame split into its addressee and body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatFrame<'a> {
    pub recipient: &'a str,
    pub payload: &'a str,
}

impl<'a> ChatFrame<'a> {
    /// Splits on the first `:`. Without a colon the whole text is the
    /// recipient and the payload is empty.
    pub fn parse(text: &'a str) -> Self {
        match text.split_once(FRAME_SEPARATOR) {
            Some((recipient, payload)) => Self { recipient, payload },
            None => Self {
                recipient: text,
                payload: "",
            },
        }
    }
}

/// Login success reply, echoing the username exactly.
pub fn welcome_message(username: &str) -> String {
    format!("Welcome {username}!\n")
}

/// Message delivered to a recipient: `sender:payload`, newline-terminated
/// only when the inbound frame was.
pub fn forward_message(sender: &str, payload: &str, delimited: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(sender.len() + payload.len() + 2);
    buf.put_slice(sender.as_bytes());
    buf.put_u8(FRAME_SEPARATOR as u8);
    buf.put_slice(payload.as_bytes());
    if delimited {
        buf.put_u8(b'\n');
    }
    buf.freeze()
}
