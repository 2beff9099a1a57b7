//! Storage sinks for decoded log messages.
//!
//! A sink receives batches of [`RelpMessage`]s drained from a session and
//! stores them durably. Only after `store` returns `Ok` does the connection
//! acknowledge the batch on the wire.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{RelpError, Result};
use crate::session::RelpMessage;

/// Durable destination for decoded messages.
///
/// `store` is called from a blocking thread and may block on disk I/O.
pub trait MessageSink: Send + Sync + 'static {
    /// Persist the whole batch, or fail without any of it counting as stored.
    fn store(&self, batch: &[RelpMessage]) -> Result<()>;
}

/// In-memory sink, mainly for tests and embedding.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<RelpMessage>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored so far.
    pub fn messages(&self) -> Vec<RelpMessage> {
        match self.messages.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn len(&self) -> usize {
        match self.messages.lock() {
            Ok(guard) => guard.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageSink for MemorySink {
    fn store(&self, batch: &[RelpMessage]) -> Result<()> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| RelpError::Storage("memory sink lock poisoned".to_string()))?;
        messages.extend_from_slice(batch);
        Ok(())
    }
}

/// One line of a [`JsonLinesSink`] file.
///
/// UTF-8 payloads are written as `payload`, anything else as
/// `payload_base64`; exactly one of the two is present.
#[derive(Debug, Serialize)]
struct StoredRecord<'a> {
    txid: u64,
    /// Unix time in milliseconds.
    received_at: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_base64: Option<String>,
}

impl<'a> StoredRecord<'a> {
    fn new(message: &'a RelpMessage, received_at: u64) -> Self {
        match std::str::from_utf8(&message.payload) {
            Ok(text) => Self {
                txid: message.txid,
                received_at,
                payload: Some(text),
                payload_base64: None,
            },
            Err(_) => Self {
                txid: message.txid,
                received_at,
                payload: None,
                payload_base64: Some(STANDARD.encode(&message.payload)),
            },
        }
    }
}

/// Appends one JSON object per message to a file.
///
/// A batch is encoded in memory, appended with a single write and
/// `fsync`ed before `store` returns. A failed append is truncated away.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    /// Open (or create) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MessageSink for JsonLinesSink {
    fn store(&self, batch: &[RelpMessage]) -> Result<()> {
        let encoded = encode_batch(batch, unix_millis())?;

        let mut file = self
            .file
            .lock()
            .map_err(|_| RelpError::Storage("json sink lock poisoned".to_string()))?;

        let start = file.metadata()?.len();
        if let Err(e) = append_synced(&mut file, &encoded) {
            if let Err(truncate_err) = file.set_len(start) {
                warn!(
                    path = %self.path.display(),
                    error = %truncate_err,
                    "could not roll back partial batch"
                );
            }
            return Err(e.into());
        }

        debug!(count = batch.len(), path = %self.path.display(), "stored batch");
        Ok(())
    }
}

/// Encode `batch` as newline-terminated JSON records.
fn encode_batch(batch: &[RelpMessage], received_at: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    for message in batch {
        serde_json::to_writer(&mut buf, &StoredRecord::new(message, received_at))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

fn append_synced(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes)?;
    file.sync_data()
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
