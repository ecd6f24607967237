//! Write-ahead log of committed transactions.
//!
//! # File format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec frame of WalRecord]
//! [RECORD 2: codec frame of WalRecord]
//! ...
//! ```
//!
//! A record is either one committed batch or a checkpoint holding the full
//! state. On open, records are read until the first torn or corrupt frame;
//! the file is truncated there so later appends start from a clean tail.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Result as IoResult, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::state::Mutation;

use super::codec;

/// One log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Monotonically increasing within one log file.
    pub sequence: u64,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Payload.
    pub kind: WalRecordKind,
}

/// Payload of a log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WalRecordKind {
    /// Redo batch of one transaction.
    Commit { mutations: Vec<Mutation> },
    /// Full state; replay discards everything before it.
    Checkpoint { mutations: Vec<Mutation> },
}

/// What was found on disk when the log was opened.
#[derive(Debug, Default)]
pub struct Replay {
    /// Intact records, in log order.
    pub records: Vec<WalRecord>,
    /// Bytes cut from a torn or corrupt tail.
    pub truncated_bytes: u64,
}

struct WalInner {
    writer: BufWriter<File>,
    sequence: u64,
    size: u64,
}

/// Append-only commit log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
    sync_on_write: bool,
}

fn poisoned() -> std::io::Error {
    std::io::Error::new(ErrorKind::Other, "poisoned lock: wal")
}

impl WriteAheadLog {
    /// Opens or creates the log and returns the records it holds.
    ///
    /// # Errors
    ///
    /// I/O failures, or an existing file whose header is not a commit log.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<(Self, Replay)> {
        let existing_len = match fs::metadata(path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e),
        };

        let mut replay = Replay::default();
        let mut valid_len = codec::HEADER_LEN;

        if existing_len < codec::HEADER_LEN {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            codec::write_header(&mut file)?;
            file.sync_all()?;
        } else {
            let mut reader = BufReader::new(File::open(path)?);
            codec::read_header(&mut reader)?;
            while valid_len < existing_len {
                match codec::decode::<WalRecord>(&mut reader) {
                    Ok((record, consumed)) => {
                        valid_len += consumed;
                        replay.records.push(record);
                    }
                    Err(e) => {
                        warn!(
                            path = %path.display(),
                            offset = valid_len,
                            error = %e,
                            "discarding torn or corrupt commit log tail"
                        );
                        break;
                    }
                }
            }
            if valid_len < existing_len {
                replay.truncated_bytes = existing_len - valid_len;
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        let sequence = replay.records.last().map_or(0, |r| r.sequence);
        let file = OpenOptions::new().append(true).open(path)?;
        debug!(
            path = %path.display(),
            records = replay.records.len(),
            sequence,
            "commit log opened"
        );

        Ok((
            Self {
                path: path.to_path_buf(),
                inner: Mutex::new(WalInner {
                    writer: BufWriter::new(file),
                    sequence,
                    size: valid_len,
                }),
                sync_on_write,
            },
            replay,
        ))
    }

    fn lock(&self) -> IoResult<MutexGuard<'_, WalInner>> {
        self.inner.lock().map_err(|_| poisoned())
    }

    /// Appends one record and returns its sequence number.
    ///
    /// # Errors
    ///
    /// I/O failures; the in-memory sequence is not advanced.
    pub fn append(&self, kind: WalRecordKind) -> IoResult<u64> {
        let mut inner = self.lock()?;
        let sequence = inner.sequence + 1;
        let encoded = codec::encode(&WalRecord {
            sequence,
            timestamp: Utc::now(),
            kind,
        })?;

        inner.writer.write_all(&encoded)?;
        inner.writer.flush()?;
        if self.sync_on_write {
            inner.writer.get_ref().sync_data()?;
        }

        inner.sequence = sequence;
        inner.size += encoded.len() as u64;
        Ok(sequence)
    }

    /// Replaces the whole log with a single checkpoint record.
    ///
    /// The new log is written to a temporary file, synced, then renamed over
    /// the old one, so a crash leaves either the old or the new log intact.
    ///
    /// # Errors
    ///
    /// I/O failures; the old log stays in place.
    pub fn checkpoint(&self, mutations: Vec<Mutation>) -> IoResult<()> {
        let mut inner = self.lock()?;
        inner.writer.flush()?;

        let tmp_path = self.path.with_extension("wal.tmp");
        let encoded = codec::encode(&WalRecord {
            sequence: 1,
            timestamp: Utc::now(),
            kind: WalRecordKind::Checkpoint { mutations },
        })?;
        {
            let mut tmp = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            codec::write_header(&mut tmp)?;
            tmp.write_all(&encoded)?;
            tmp.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        #[cfg(unix)]
        if let Some(parent) = self.path.parent() {
            File::open(parent)?.sync_all()?;
        }

        inner.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        inner.sequence = 1;
        inner.size = codec::HEADER_LEN + encoded.len() as u64;
        debug!(path = %self.path.display(), bytes = inner.size, "commit log checkpointed");
        Ok(())
    }

    /// Bytes currently in the log, header included.
    ///
    /// # Errors
    ///
    /// Lock poisoning.
    pub fn size_bytes(&self) -> IoResult<u64> {
        Ok(self.lock()?.size)
    }

    /// # Errors
    ///
    /// Lock poisoning.
    pub fn current_sequence(&self) -> IoResult<u64> {
        Ok(self.lock()?.sequence)
    }
}
