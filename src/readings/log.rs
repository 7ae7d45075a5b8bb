//! Append-only reading log.
//!
//! Every mutation (create, update, delete) is appended as a new entry; the
//! latest entry for an id wins when the index is rebuilt.

use crate::error::{FeedError, Result};
use crate::types::{ChangeOperation, Reading, ReadingId, ReadingInput, Timestamp};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for each log entry.
const LOG_MAGIC: &[u8; 4] = b"RDG\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Entry header size (fixed part).
const ENTRY_HEADER_SIZE: usize = 4 + 1 + 1 + 8 + 4; // magic + version + op + id + body len

/// Upper bound on a single entry body; anything larger is corruption.
const MAX_BODY_SIZE: u32 = 64 * 1024;

/// Body of an entry as written to disk. The value is kept as short text.
#[derive(Serialize, Deserialize)]
struct StoredBody {
    timestamp: i64,
    value: String,
    unit: String,
}

/// A decoded log entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogEntry {
    pub operation: ChangeOperation,
    pub reading: Reading,
}

struct LogInner {
    file: File,
    next_id: u64,
    file_size: u64,
    writes_since_sync: u64,
}

/// Append-only reading log.
pub struct ReadingLog {
    path: PathBuf,
    inner: Mutex<LogInner>,
    /// Sync every N writes (1 = every write).
    sync_interval: u64,
}

impl ReadingLog {
    /// Default sync interval: readings are small and rare, sync every write.
    const DEFAULT_SYNC_INTERVAL: u64 = 1;

    /// Open or create a reading log with default sync interval.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, Self::DEFAULT_SYNC_INTERVAL)
    }

    /// Open or create a reading log, syncing every `sync_interval` writes.
    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_size = file.metadata()?.len();
        let (max_id, good_end) = Self::scan(&mut file, file_size)?;

        // Drop a torn tail left by an interrupted write
        if good_end < file_size {
            tracing::warn!(
                path = %path.display(),
                dropped_bytes = file_size - good_end,
                "truncating torn tail of reading log"
            );
            file.set_len(good_end)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(LogInner {
                file,
                next_id: max_id + 1,
                file_size: good_end,
                writes_since_sync: 0,
            }),
            sync_interval: sync_interval.max(1),
        })
    }

    /// Append a new reading, assigning its id.
    ///
    /// Returns the stored reading and the offset where it was written.
    pub fn append_new(&self, input: ReadingInput) -> Result<(Reading, u64)> {
        let mut inner = self.inner.lock();

        let reading = input.into_reading(ReadingId(inner.next_id));
        let offset = Self::append_locked(&mut inner, ChangeOperation::Created, &reading, self.sync_interval)?;
        inner.next_id += 1;

        Ok((reading, offset))
    }

    /// Append an update or delete for an existing reading.
    pub fn append_change(&self, operation: ChangeOperation, reading: &Reading) -> Result<u64> {
        if reading.id.is_none() {
            return Err(FeedError::InvalidOperation(
                "cannot log a change for an unsaved reading".into(),
            ));
        }
        let mut inner = self.inner.lock();
        Self::append_locked(&mut inner, operation, reading, self.sync_interval)
    }

    fn append_locked(
        inner: &mut LogInner,
        operation: ChangeOperation,
        reading: &Reading,
        sync_interval: u64,
    ) -> Result<u64> {
        let bytes = encode_entry(operation, reading)?;

        let offset = inner.file_size;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&bytes)?;
        inner.file_size = offset + bytes.len() as u64;

        inner.writes_since_sync += 1;
        if inner.writes_since_sync >= sync_interval {
            inner.file.sync_data()?;
            inner.writes_since_sync = 0;
        }

        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_all()?;
        inner.writes_since_sync = 0;
        Ok(())
    }

    /// Read the entry at a given offset.
    pub fn read_at(&self, offset: u64) -> Result<LogEntry> {
        let mut inner = self.inner.lock();
        inner.file.seek(SeekFrom::Start(offset))?;
        let (entry, _) = read_entry(&mut inner.file)?;
        Ok(entry)
    }

    /// Iterate entries from a given offset.
    pub fn iter_from(&self, offset: u64) -> LogIterator<'_> {
        LogIterator {
            log: self,
            offset,
            end: self.size(),
        }
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.inner.lock().file_size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Walk entry headers, returning the max id and the end of the last
    /// complete entry.
    fn scan(file: &mut File, file_size: u64) -> Result<(u64, u64)> {
        file.seek(SeekFrom::Start(0))?;

        let mut max_id = 0u64;
        let mut pos = 0u64;

        while pos + ENTRY_HEADER_SIZE as u64 <= file_size {
            let mut header = [0u8; ENTRY_HEADER_SIZE];
            file.read_exact(&mut header)?;

            if &header[0..4] != LOG_MAGIC {
                return Err(FeedError::Corruption(format!(
                    "bad entry magic at offset {}",
                    pos
                )));
            }

            let id = u64::from_le_bytes(header[6..14].try_into().unwrap_or_default());
            let body_len = u32::from_le_bytes(header[14..18].try_into().unwrap_or_default());

            let entry_end = pos + ENTRY_HEADER_SIZE as u64 + body_len as u64 + 4;
            if entry_end > file_size {
                break;
            }

            max_id = max_id.max(id);
            file.seek(SeekFrom::Start(entry_end))?;
            pos = entry_end;
        }

        Ok((max_id, pos))
    }
}

/// Iterator over entries in the log, yielding `(offset, entry)`.
pub struct LogIterator<'a> {
    log: &'a ReadingLog,
    offset: u64,
    end: u64,
}

impl<'a> Iterator for LogIterator<'a> {
    type Item = Result<(u64, LogEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }

        let current = self.offset;
        let mut inner = self.log.inner.lock();
        let result = inner
            .file
            .seek(SeekFrom::Start(current))
            .map_err(FeedError::from)
            .and_then(|_| read_entry(&mut inner.file));

        match result {
            Ok((entry, len)) => {
                self.offset = current + len;
                Some(Ok((current, entry)))
            }
            Err(e) => {
                // Stop iteration on error
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}

fn op_byte(operation: ChangeOperation) -> u8 {
    match operation {
        ChangeOperation::Created => 0,
        ChangeOperation::Updated => 1,
        ChangeOperation::Deleted => 2,
    }
}

fn op_from_byte(byte: u8) -> Result<ChangeOperation> {
    match byte {
        0 => Ok(ChangeOperation::Created),
        1 => Ok(ChangeOperation::Updated),
        2 => Ok(ChangeOperation::Deleted),
        other => Err(FeedError::Corruption(format!("unknown entry op {}", other))),
    }
}

fn encode_entry(operation: ChangeOperation, reading: &Reading) -> Result<Vec<u8>> {
    let id = reading.id.map(|id| id.0).unwrap_or(0);
    let body = rmp_serde::to_vec(&StoredBody {
        timestamp: reading.timestamp.0,
        value: reading.value.to_string(),
        unit: reading.unit.clone(),
    })?;

    let mut buf = Vec::with_capacity(ENTRY_HEADER_SIZE + body.len() + 4);
    buf.extend_from_slice(LOG_MAGIC);
    buf.push(LOG_VERSION);
    buf.push(op_byte(operation));
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
    buf.extend_from_slice(&body);
    buf.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(buf)
}

/// Read one entry at the current position. Returns the entry and its length.
fn read_entry(file: &mut File) -> Result<(LogEntry, u64)> {
    let mut header = [0u8; ENTRY_HEADER_SIZE];
    file.read_exact(&mut header)?;

    if &header[0..4] != LOG_MAGIC {
        return Err(FeedError::InvalidFormat("Invalid entry magic".into()));
    }
    if header[4] != LOG_VERSION {
        return Err(FeedError::InvalidFormat(format!(
            "Unsupported log version: {}",
            header[4]
        )));
    }

    let operation = op_from_byte(header[5])?;
    let id = u64::from_le_bytes(header[6..14].try_into().unwrap_or_default());
    let body_len = u32::from_le_bytes(header[14..18].try_into().unwrap_or_default());
    if body_len > MAX_BODY_SIZE {
        return Err(FeedError::Corruption(format!(
            "entry body of {} bytes",
            body_len
        )));
    }

    let mut body = vec![0u8; body_len as usize];
    file.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(FeedError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let stored_body: StoredBody = rmp_serde::from_slice(&body)?;
    let value = stored_body.value.parse::<i32>().map_err(|_| {
        FeedError::Corruption(format!("reading {} has value {:?}", id, stored_body.value))
    })?;

    let entry = LogEntry {
        operation,
        reading: Reading {
            id: Some(ReadingId(id)),
            timestamp: Timestamp(stored_body.timestamp),
            value,
            unit: stored_body.unit,
        },
    };

    Ok((entry, ENTRY_HEADER_SIZE as u64 + body_len as u64 + 4))
}
