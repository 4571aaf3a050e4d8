//! Immutable sorted page files produced by the merger.
//!
//! A db file is written as `<epoch>.db.incomplete`, preallocated and
//! grown per the configured ratios, then truncated to its exact length,
//! fsynced and renamed to `<epoch>.db`. Its body is a run of pages: a
//! page header followed by crc-framed records in key order.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::format::{
    self, PageHeader, RecordHeader, FILE_HEADER_SIZE, PAGE_HEADER_SIZE, RECORD_HEADER_SIZE,
};
use crate::version::Version;

pub fn db_path(dir: &Path, epoch: u64, complete: bool) -> PathBuf {
    if complete {
        dir.join(format!("{epoch}.db"))
    } else {
        dir.join(format!("{epoch}.db.incomplete"))
    }
}

/// Sequential writer for one epoch's db file.
pub struct DbWriter {
    path: PathBuf,
    file: File,
    epoch: u64,
    len: u64,
    allocated: u64,
    grow_factor: f64,
}

impl DbWriter {
    pub fn create(dir: &Path, epoch: u64, new_size: u64, grow_factor: f64) -> Result<DbWriter> {
        let path = db_path(dir, epoch, false);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let allocated = new_size.max(FILE_HEADER_SIZE as u64);
        file.set_len(allocated)?;
        let mut writer = DbWriter {
            path,
            file,
            epoch,
            len: 0,
            allocated,
            grow_factor,
        };
        writer.append(&format::encode_file_header())?;
        Ok(writer)
    }

    fn append(&mut self, data: &[u8]) -> Result<()> {
        let need = self.len + data.len() as u64;
        if need > self.allocated {
            let mut next = self.allocated;
            while next < need {
                next = ((next as f64) * self.grow_factor) as u64 + 1;
            }
            self.file.set_len(next)?;
            self.allocated = next;
        }
        self.file.seek(SeekFrom::Start(self.len))?;
        self.file.write_all(data)?;
        self.len = need;
        Ok(())
    }

    /// Writes one page of records, returning its offset and body size.
    pub fn write_page(&mut self, records: &[&Version], psn: u64) -> Result<(u64, u32)> {
        let mut body = Vec::new();
        for v in records {
            body.extend_from_slice(&v.header().encode());
            body.extend_from_slice(&v.key);
            body.extend_from_slice(&v.value);
        }
        let header = PageHeader {
            crc: crc32c::crc32c(&body),
            psn,
            count: records.len() as u32,
            size: body.len() as u32,
        };
        let offset = self.len;
        self.append(&header.encode())?;
        self.append(&body)?;
        Ok((offset, header.size))
    }

    /// Truncates the preallocation slack, fsyncs and renames the file to
    /// its completed name.
    pub fn complete(mut self) -> Result<PathBuf> {
        self.file.set_len(self.len)?;
        self.file.sync_all()?;
        let dir = self.path.parent().unwrap_or(Path::new("")).to_path_buf();
        let complete = db_path(&dir, self.epoch, true);
        fs::rename(&self.path, &complete)?;
        Ok(complete)
    }
}

/// One record decoded from a db page.
pub struct PageRecord {
    pub kind_flag: u8,
    pub crc: u32,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Page metadata discovered while scanning a db file at open.
pub struct ScannedPage {
    pub psn: u64,
    pub offset: u64,
    pub size: u32,
    pub count: u32,
    pub min: Box<[u8]>,
    pub max: Box<[u8]>,
}

/// Read-only handle on a completed db file.
pub struct DbFile {
    file: File,
    len: u64,
}

impl DbFile {
    pub fn open(path: &Path) -> Result<DbFile> {
        let mut file = File::open(path)?;
        let len = file.metadata()?.len();
        let mut header = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut header)
            .map_err(|_| Error::Corrupted("db file shorter than its header".to_string()))?;
        format::check_file_header(&header)?;
        Ok(DbFile { file, len })
    }

    /// Walks every page, validating page CRCs and collecting the metadata
    /// the catalog needs.
    pub fn scan_pages(&mut self) -> Result<Vec<ScannedPage>> {
        let mut pages = Vec::new();
        let mut offset = FILE_HEADER_SIZE as u64;
        while offset < self.len {
            let header = self.read_page_header(offset)?;
            let body = self.read_body(offset, header.size)?;
            if crc32c::crc32c(&body) != header.crc {
                return Err(Error::Corrupted(format!("page crc mismatch at {offset}")));
            }
            let records = parse_records(&body, header.count)?;
            let min = records
                .first()
                .map(|r| r.key.clone().into_boxed_slice())
                .ok_or_else(|| Error::Corrupted("empty page".to_string()))?;
            let max = records
                .last()
                .map(|r| r.key.clone().into_boxed_slice())
                .unwrap();
            pages.push(ScannedPage {
                psn: header.psn,
                offset,
                size: header.size,
                count: header.count,
                min,
                max,
            });
            offset += (PAGE_HEADER_SIZE as u64) + header.size as u64;
        }
        Ok(pages)
    }

    /// Reads and decodes the records of one page.
    pub fn read_page(&mut self, offset: u64, size: u32, count: u32) -> Result<Vec<PageRecord>> {
        let body = self.read_body(offset, size)?;
        parse_records(&body, count)
    }

    fn read_page_header(&mut self, offset: u64) -> Result<PageHeader> {
        let mut buf = [0u8; PAGE_HEADER_SIZE];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file
            .read_exact(&mut buf)
            .map_err(|_| Error::Corrupted(format!("truncated page header at {offset}")))?;
        Ok(PageHeader::decode(&buf))
    }

    fn read_body(&mut self, offset: u64, size: u32) -> Result<Vec<u8>> {
        let mut body = vec![0u8; size as usize];
        self.file
            .seek(SeekFrom::Start(offset + PAGE_HEADER_SIZE as u64))?;
        self.file
            .read_exact(&mut body)
            .map_err(|_| Error::Corrupted(format!("truncated page body at {offset}")))?;
        Ok(body)
    }
}

fn parse_records(body: &[u8], count: u32) -> Result<Vec<PageRecord>> {
    let mut records = Vec::with_capacity(count as usize);
    let mut pos = 0usize;
    for _ in 0..count {
        let end = pos + RECORD_HEADER_SIZE;
        let hbuf: [u8; RECORD_HEADER_SIZE] = body
            .get(pos..end)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::Corrupted("truncated page record header".to_string()))?;
        let header = RecordHeader::decode(&hbuf);
        let ksize = header.size as usize;
        let vsize = header.vsize as usize;
        let key = body
            .get(end..end + ksize)
            .ok_or_else(|| Error::Corrupted("truncated page record key".to_string()))?
            .to_vec();
        let value = body
            .get(end + ksize..end + ksize + vsize)
            .ok_or_else(|| Error::Corrupted("truncated page record value".to_string()))?
            .to_vec();
        let payload = format::payload_crc(&key, &value);
        if format::seal_crc(payload, &hbuf) != header.crc {
            return Err(Error::Corrupted("page record crc mismatch".to_string()));
        }
        records.push(PageRecord {
            kind_flag: header.flags,
            crc: payload,
            key,
            value,
        });
        pos = end + ksize + vsize;
    }
    Ok(records)
}
