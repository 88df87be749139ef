//! Append-only record logs owned by a single task.
//!
//! The pool's share log and the relays' traffic capture are both "many
//! connections append, someone occasionally reads everything" logs. Each is
//! an [`AppendLog`]: a cloneable handle that sends records over a channel to
//! one writer task, which keeps them in memory and, if configured, mirrors
//! each record as one JSON line to a file opened in append mode.
//!
//! The writer task exits once every handle has been dropped.

use std::path::PathBuf;

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

use crate::stratum_v1::{Message, ShareSubmission};
use crate::tracing::prelude::*;

/// Pool share log.
pub type ShareLog = AppendLog<ShareSubmission>;

/// Relay traffic capture.
pub type CaptureLog = AppendLog<CaptureEntry>;

enum Command<T> {
    Append(T),
    Snapshot(oneshot::Sender<Vec<T>>),
    Clear,
}

/// Handle to an append-only log.
pub struct AppendLog<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T> Clone for AppendLog<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

/// Where an [`AppendLog`] keeps its records.
#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    /// JSON-lines file to append every record to
    pub path: Option<PathBuf>,
    /// Keep records in memory for [`AppendLog::snapshot`]
    pub keep_in_memory: bool,
}

impl LogConfig {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            keep_in_memory: true,
        }
    }
}

impl<T> AppendLog<T>
where
    T: Serialize + Clone + Send + Sync + 'static,
{
    /// Spawn the writer task.
    ///
    /// The file, if any, is opened before returning so a bad path is
    /// reported to the caller rather than lost in a background task.
    pub async fn spawn(config: LogConfig) -> anyhow::Result<Self> {
        let file = match &config.path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("failed to open log file {}", path.display()))?,
            ),
            None => None,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer(rx, file, config));
        Ok(Self { tx })
    }

    /// Append a record. Never blocks.
    pub fn append(&self, record: T) {
        if self.tx.send(Command::Append(record)).is_err() {
            warn!("Log writer stopped, record dropped");
        }
    }

    /// Every record kept in memory so far, in append order.
    pub async fn snapshot(&self) -> Vec<T> {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Forget the in-memory records. The file, if any, is left alone.
    pub fn clear(&self) {
        let _ = self.tx.send(Command::Clear);
    }
}

async fn writer<T: Serialize + Clone>(
    mut rx: mpsc::UnboundedReceiver<Command<T>>,
    mut file: Option<File>,
    config: LogConfig,
) {
    let mut records = Vec::new();

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Append(record) => {
                if let Some(f) = file.as_mut() {
                    if let Err(e) = write_line(f, &record).await {
                        error!(error = %e, "Failed to write log record, disabling file output");
                        file = None;
                    }
                }
                if config.keep_in_memory {
                    records.push(record);
                }
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(records.clone());
            }
            Command::Clear => records.clear(),
        }
    }
}

async fn write_line<T: Serialize>(file: &mut File, record: &T) -> anyhow::Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}

/// Which side of a relay a captured message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Miner,
    Pool,
}

/// One captured message.
#[derive(Debug, Clone, Serialize)]
pub struct CaptureEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: Source,
    pub message: Value,
}

impl CaptureEntry {
    pub fn new(source: Source, message: &Message) -> Self {
        Self {
            timestamp: OffsetDateTime::now_utc(),
            source,
            message: serde_json::to_value(message).unwrap_or(Value::Null),
        }
    }
}
