//! Append-only record of delivered messages.
//!
//! Each record is written to the log file and mirrored to the console under
//! one lock, so concurrent deliveries never splice their lines together. The
//! lock belongs to the log alone and is never held together with the
//! registry's.

use std::fmt;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{Error, Result};

/// One delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub sender: String,
    pub recipient: String,
    pub payload: String,
}

impl LogRecord {
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            sender: sender.into(),
            recipient: recipient.into(),
            payload: payload.into(),
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} to {}: {}", self.sender, self.recipient, self.payload)
    }
}

#[derive(Debug)]
pub struct ChatLog {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl ChatLog {
    /// Opens `path` for appending, creating it if needed.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        debug!(path = %path.display(), "Chat log opened");

        Ok(Self {
            path,
            file: Mutex::new(Some(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one line and flushes it before returning.
    pub async fn append(&self, record: &LogRecord) -> Result<()> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(Error::LogSinkClosed)?;

        let line = format!("{record}\n");
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        info!(target: "chat_relay::chat", "{record}");
        Ok(())
    }

    /// Flushes and releases the file. Only the first call does any work and
    /// returns `true`.
    pub async fn close(&self) -> Result<bool> {
        let Some(mut file) = self.file.lock().await.take() else {
            return Ok(false);
        };

        file.flush().await?;
        file.sync_all().await?;
        debug!(path = %self.path.display(), "Chat log closed");
        Ok(true)
    }

    pub async fn is_closed(&self) -> bool {
        self.file.lock().await.is_none()
    }
}
