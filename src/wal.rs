//! Append-only epoch log files.
//!
//! A log is created as `<epoch>.log.inprogress` while the epoch is live
//! and renamed to `<epoch>.log` once completed. Records are framed per
//! [`crate::format`]; a batch collects whole records and `put` makes them
//! durable in one write + fsync. The savepoint/rollback pair undoes a
//! partially written record after an I/O failure.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::format::{
    self, RecordHeader, FILE_HEADER_SIZE, FLAG_DELETE, FLAG_EOF, FLAG_SET, RECORD_HEADER_SIZE,
};

/// Records per batch flush; each record contributes three segments
/// (header, key, value).
pub const BATCH_RECORDS: usize = 512;
const BATCH_SEGMENTS: usize = BATCH_RECORDS * 3;

pub fn log_path(dir: &Path, epoch: u64, sealed: bool) -> PathBuf {
    if sealed {
        dir.join(format!("{epoch}.log"))
    } else {
        dir.join(format!("{epoch}.log.inprogress"))
    }
}

/// Buffered run of record segments flushed to a log in one durable write.
pub struct Batch {
    buf: Vec<u8>,
    segments: usize,
}

impl Batch {
    pub fn new() -> Batch {
        Batch {
            buf: Vec::with_capacity(64 * 1024),
            segments: 0,
        }
    }

    /// Whether `n` more segments fit before a flush is required.
    pub fn ensure(&self, n: usize) -> bool {
        self.segments + n <= BATCH_SEGMENTS
    }

    pub fn add(&mut self, segment: &[u8]) {
        self.buf.extend_from_slice(segment);
        self.segments += 1;
    }

    pub fn has(&self) -> bool {
        self.segments > 0
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.segments = 0;
    }
}

/// Writer for one epoch's log file.
pub struct LogWriter {
    path: PathBuf,
    file: File,
    len: u64,
    svp: u64,
    sealed: bool,
    epoch: u64,
}

impl LogWriter {
    /// Creates the in-progress log for a fresh epoch. The header is
    /// written separately so rotation can report the two failures apart.
    pub fn create(dir: &Path, epoch: u64) -> Result<LogWriter> {
        let path = log_path(dir, epoch, false);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        Ok(LogWriter {
            path,
            file,
            len: 0,
            svp: 0,
            sealed: false,
            epoch,
        })
    }

    /// Reopens an existing log during recovery.
    pub fn reopen(path: PathBuf, epoch: u64, sealed: bool, read_only: bool) -> Result<LogWriter> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(LogWriter {
            path,
            file,
            len,
            svp: len,
            sealed,
            epoch,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.append(&format::encode_file_header())
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    /// Snapshots the current end offset for a later [`LogWriter::rollback`].
    pub fn savepoint(&mut self) {
        self.svp = self.len;
    }

    /// Undoes everything appended since the last savepoint.
    pub fn rollback(&mut self) -> Result<()> {
        self.file.set_len(self.svp)?;
        self.len = self.svp;
        Ok(())
    }

    /// Writes the batch and makes it durable. The batch is reset on
    /// success and left intact on failure so the caller can roll back.
    pub fn put(&mut self, batch: &mut Batch) -> Result<()> {
        self.append(batch.bytes())?;
        self.file.sync_all()?;
        batch.reset();
        Ok(())
    }

    /// Appends the EOF sentinel so recovery knows the file closed cleanly.
    pub fn write_eof(&mut self) -> Result<()> {
        self.append(&RecordHeader::eof().encode())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Seals the log by renaming it to its completed name.
    pub fn complete(&mut self) -> Result<()> {
        if self.sealed {
            return Ok(());
        }
        let sealed = log_path(self.path.parent().unwrap_or(Path::new("")), self.epoch, true);
        fs::rename(&self.path, &sealed)?;
        self.path = sealed;
        self.sealed = true;
        Ok(())
    }

    /// Removes the log file from disk (empty or fully transferred epochs).
    pub fn unlink(&self) -> Result<()> {
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Truncates a recovered log back to its last valid record boundary.
    pub fn truncate_to(&mut self, offset: u64) -> Result<()> {
        self.file.set_len(offset)?;
        self.len = offset;
        self.svp = offset;
        Ok(())
    }
}

/// One replayed log entry.
pub enum ReplayItem {
    Record {
        kind_flag: u8,
        crc: u32,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Eof,
}

/// CRC-validating reader over a log file, used by recovery.
pub struct LogReader {
    reader: BufReader<File>,
    /// Offset of the first byte not yet consumed by a valid entry.
    offset: u64,
    end: u64,
}

impl LogReader {
    pub fn open(path: &Path) -> Result<LogReader> {
        let file = File::open(path)?;
        let end = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header = [0u8; FILE_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .map_err(|_| Error::Corrupted("log file shorter than its header".to_string()))?;
        format::check_file_header(&header)?;
        Ok(LogReader {
            reader,
            offset: FILE_HEADER_SIZE as u64,
            end,
        })
    }

    /// Offset of the last cleanly decoded record boundary.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decodes the next entry. `Ok(None)` is the physical end of the
    /// file; a corrupt or truncated record surfaces as an error and
    /// leaves [`LogReader::offset`] at the last good boundary.
    pub fn next(&mut self) -> Result<Option<ReplayItem>> {
        if self.offset >= self.end {
            return Ok(None);
        }
        let mut hbuf = [0u8; RECORD_HEADER_SIZE];
        self.reader
            .read_exact(&mut hbuf)
            .map_err(|_| Error::Corrupted("truncated record header".to_string()))?;
        let header = RecordHeader::decode(&hbuf);
        match header.flags {
            FLAG_EOF => {
                if header.crc != format::seal_crc(0, &hbuf) || header.size != 0 || header.vsize != 0
                {
                    return Err(Error::Corrupted("bad eof marker".to_string()));
                }
                self.offset += RECORD_HEADER_SIZE as u64;
                Ok(Some(ReplayItem::Eof))
            }
            FLAG_SET | FLAG_DELETE => {
                let mut key = vec![0u8; header.size as usize];
                self.reader
                    .read_exact(&mut key)
                    .map_err(|_| Error::Corrupted("truncated record key".to_string()))?;
                let mut value = vec![0u8; header.vsize as usize];
                self.reader
                    .read_exact(&mut value)
                    .map_err(|_| Error::Corrupted("truncated record value".to_string()))?;
                let payload = format::payload_crc(&key, &value);
                if format::seal_crc(payload, &hbuf) != header.crc {
                    return Err(Error::Corrupted("record crc mismatch".to_string()));
                }
                self.offset +=
                    (RECORD_HEADER_SIZE + header.size as usize + header.vsize as usize) as u64;
                Ok(Some(ReplayItem::Record {
                    kind_flag: header.flags,
                    crc: payload,
                    key,
                    value,
                }))
            }
            other => Err(Error::Corrupted(format!("bad record flags {other:#x}"))),
        }
    }
}
