// Copyright 2025 Ojima Abraham
// SPDX-License-Identifier: Apache-2.0

//! Append-only persistence log with a durable flush fence.
//!
//! Format: each entry is `[4-byte CRC32][4-byte length][JSON envelope]`,
//! where the envelope carries the log sequence number and the record. On
//! recovery, valid entries are replayed in order; a corrupt or truncated
//! tail is dropped.
//!
//! Contract: any externally visible effect (an RPC reply, a PUSH decision
//! leaving the partition) must follow a successful [`Persistence::flush`]
//! covering the causing append. Appends may be batched between fences.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};

use crate::partition::indexer::Version;
use crate::schema::{Key, Record};
use crate::time::Timestamp;
use crate::txn::{EndAction, TxnId, TxnRecord, TxnState};

/// Log sequence number; strictly increasing per partition log.
pub type Lsn = u64;

/// Errors from the persistence facade.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("log serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Serializable image of a transaction record, for checkpoints.
///
/// Deadlines are wall-clock state and are rehydrated on recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnImage {
    pub txn_id: TxnId,
    pub state: TxnState,
    pub write_keys: Vec<(String, Key)>,
    pub has_intent: bool,
    pub finalize_action: Option<EndAction>,
}

impl From<&TxnRecord> for TxnImage {
    fn from(rec: &TxnRecord) -> Self {
        Self {
            txn_id: rec.txn_id.clone(),
            state: rec.state,
            write_keys: rec.write_keys.iter().cloned().collect(),
            has_intent: rec.has_intent,
            finalize_action: rec.finalize_action,
        }
    }
}

/// Periodic snapshot of indexer and transaction-manager state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointImage {
    pub retention_ts: Timestamp,
    pub versions: Vec<(Key, Vec<Version>)>,
    pub txns: Vec<TxnImage>,
}

/// A persisted log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogRecord {
    IntentAppend {
        key: Key,
        timestamp: Timestamp,
        owner: TxnId,
        value: Option<Record>,
    },
    TxnTransition {
        txn_id: TxnId,
        state: TxnState,
        write_keys: Vec<(String, Key)>,
    },
    Checkpoint(CheckpointImage),
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    lsn: Lsn,
    record: LogRecord,
}

/// The persistence seam the partition writes through.
#[async_trait]
pub trait Persistence: Send {
    /// Buffers a record; returns its assigned LSN. Not yet durable.
    async fn append(&mut self, record: LogRecord) -> Result<Lsn, LogError>;

    /// Durably fences every append issued so far; returns the highest
    /// durable LSN.
    async fn flush(&mut self) -> Result<Lsn, LogError>;

    /// Replaces the log's history with a checkpoint, enabling truncation.
    async fn checkpoint(&mut self, image: CheckpointImage) -> Result<Lsn, LogError>;
}

/// File-backed append-only log.
pub struct FileLog {
    writer: BufWriter<File>,
    path: PathBuf,
    next_lsn: Lsn,
    last_flushed: Lsn,
    pending: usize,
    flush_batch: usize,
}

impl FileLog {
    /// Opens or creates a log file, positioning the LSN counter after the
    /// last valid entry.
    pub fn open(path: &Path, flush_batch: usize) -> Result<Self, LogError> {
        let existing = Self::replay(path)?;
        let next_lsn = existing.last().map(|(lsn, _)| lsn + 1).unwrap_or(1);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            next_lsn,
            last_flushed: next_lsn.saturating_sub(1),
            pending: 0,
            flush_batch: flush_batch.max(1),
        })
    }

    /// Replays all valid entries from a log file in order.
    ///
    /// A missing file is an empty log. Replay stops at the first corrupt or
    /// truncated entry; everything before it is returned.
    pub fn replay(path: &Path) -> Result<Vec<(Lsn, LogRecord)>, LogError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(LogError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut records = Vec::new();

        loop {
            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(LogError::Io(e)),
            }
            let expected_crc = u32::from_le_bytes(crc_buf);

            let mut len_buf = [0u8; 4];
            if read_or_stop(&mut reader, &mut len_buf, records.len())? {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            if read_or_stop(&mut reader, &mut payload, records.len())? {
                break;
            }

            let mut hasher = Hasher::new();
            hasher.update(&payload);
            if hasher.finalize() != expected_crc {
                tracing::warn!(
                    entry = records.len(),
                    "log CRC mismatch; stopping replay"
                );
                break;
            }

            let envelope: Envelope = serde_json::from_slice(&payload)?;
            records.push((envelope.lsn, envelope.record));
        }

        Ok(records)
    }

    /// Rewrites the log as a single checkpoint record, atomically.
    ///
    /// Enables truncation of the history the checkpoint subsumes. The LSN
    /// counter keeps increasing across the rewrite.
    pub fn compact(&mut self, image: CheckpointImage) -> Result<Lsn, LogError> {
        self.writer.flush()?;

        let lsn = self.next_lsn;
        self.next_lsn += 1;

        let tmp_path = self.path.with_extension("compact");
        {
            let tmp = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp);
            write_framed(
                &mut writer,
                &Envelope {
                    lsn,
                    record: LogRecord::Checkpoint(image),
                },
            )?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.pending = 0;
        self.last_flushed = lsn;
        Ok(lsn)
    }

    /// Highest LSN known durable.
    pub fn last_flushed(&self) -> Lsn {
        self.last_flushed
    }
}

fn read_or_stop<R: Read>(reader: &mut R, buf: &mut [u8], entry: usize) -> Result<bool, LogError> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            tracing::warn!(entry, "log truncated mid-entry; stopping replay");
            Ok(true)
        }
        Err(e) => Err(LogError::Io(e)),
    }
}

fn write_framed<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), LogError> {
    let payload = serde_json::to_vec(envelope)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    let crc = hasher.finalize();

    writer.write_all(&crc.to_le_bytes())?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

#[async_trait]
impl Persistence for FileLog {
    async fn append(&mut self, record: LogRecord) -> Result<Lsn, LogError> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;
        write_framed(&mut self.writer, &Envelope { lsn, record })?;
        self.pending += 1;
        if self.pending >= self.flush_batch {
            self.flush().await?;
        }
        Ok(lsn)
    }

    async fn flush(&mut self) -> Result<Lsn, LogError> {
        if self.pending > 0 || self.last_flushed + 1 < self.next_lsn {
            self.writer.flush()?;
            self.writer.get_ref().sync_all()?;
            self.pending = 0;
            self.last_flushed = self.next_lsn - 1;
        }
        Ok(self.last_flushed)
    }

    async fn checkpoint(&mut self, image: CheckpointImage) -> Result<Lsn, LogError> {
        self.compact(image)
    }
}
