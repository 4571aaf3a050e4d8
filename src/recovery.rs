//! Directory recovery: rebuilds the repository, catalog and in-memory
//! index from the files an earlier incarnation left behind.
//!
//! State is inferred from filenames: `<id>.db` epochs are retired,
//! `<id>.log[.inprogress]` epochs are replayed record by record with CRC
//! validation, and `<id>.db.incomplete` is a crashed transfer whose log
//! still exists, so the partial file is discarded. When both a db file
//! and a log exist for the same id the transfer finished but the crash
//! hit before the log unlink; the db file wins.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::Path;

use fs2::FileExt;
use log::{debug, warn};

use crate::catalog::{Catalog, EpochPages, PageRef};
use crate::dbfile::{self, DbFile};
use crate::error::{Error, Result};
use crate::index::KeyIndex;
use crate::repository::{Epoch, EpochState, Repository};
use crate::version::{RecordKind, Version};
use crate::wal::{LogReader, LogWriter, ReplayItem};

pub const LOCK_FILE: &str = "lock";

/// Exclusive lock on the storage directory, held for the engine's
/// lifetime.
pub struct DirLock {
    file: File,
}

impl DirLock {
    pub fn acquire(dir: &Path) -> Result<DirLock> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;
        file.try_lock_exclusive()
            .map_err(|e| Error::Locked(e.to_string()))?;
        Ok(DirLock { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Default)]
struct EpochFiles {
    db: bool,
    db_incomplete: bool,
    sealed_log: bool,
    inprogress_log: bool,
}

fn classify(dir: &Path) -> Result<BTreeMap<u64, EpochFiles>> {
    let mut epochs: BTreeMap<u64, EpochFiles> = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if name == LOCK_FILE {
            continue;
        }
        let Some((id, rest)) = name.split_once('.') else {
            continue;
        };
        let Ok(id) = id.parse::<u64>() else {
            continue;
        };
        let files = epochs.entry(id).or_default();
        match rest {
            "db" => files.db = true,
            "db.incomplete" => files.db_incomplete = true,
            "log" => files.sealed_log = true,
            "log.inprogress" => files.inprogress_log = true,
            _ => {}
        }
    }
    Ok(epochs)
}

/// Replays the directory into the engine's structures. Returns the next
/// page sequence number.
pub fn recover(
    dir: &Path,
    read_only: bool,
    index: &mut KeyIndex,
    catalog: &mut Catalog,
    rep: &mut Repository,
) -> Result<u64> {
    let epochs = classify(dir)?;
    let mut psn_next = 1u64;
    let mut max_id = 0u64;

    for (&id, files) in &epochs {
        max_id = max_id.max(id);

        if files.db_incomplete {
            let path = dbfile::db_path(dir, id, false);
            warn!("epoch {id}: discarding incomplete db file {}", path.display());
            if !read_only {
                fs::remove_file(&path)?;
            }
        }

        if files.db {
            let path = dbfile::db_path(dir, id, true);
            let mut file = DbFile::open(&path)?;
            let pages: Vec<PageRef> = file.scan_pages()?.into_iter().map(PageRef::from).collect();
            for p in &pages {
                psn_next = psn_next.max(p.psn + 1);
            }
            debug!("epoch {id}: loaded {} pages from {}", pages.len(), path.display());
            catalog.install(EpochPages {
                epoch: id,
                path: path.clone(),
                file,
                pages,
            });
            rep.attach(Epoch {
                id,
                state: EpochState::Db { path },
                nupdate: 0,
            });
            // a leftover log for a retired epoch was fully transferred
            for (present, sealed) in [(files.sealed_log, true), (files.inprogress_log, false)] {
                if present && !read_only {
                    let stale = crate::wal::log_path(dir, id, sealed);
                    warn!("epoch {id}: removing transferred log {}", stale.display());
                    fs::remove_file(&stale)?;
                }
            }
            continue;
        }

        if !files.sealed_log && !files.inprogress_log {
            continue;
        }
        let sealed = files.sealed_log;
        if files.sealed_log && files.inprogress_log && !read_only {
            let dup = crate::wal::log_path(dir, id, false);
            warn!("epoch {id}: removing duplicate in-progress log {}", dup.display());
            fs::remove_file(&dup)?;
        }
        replay_log(dir, id, sealed, read_only, index, rep)?;
    }

    rep.resume_from(max_id);
    Ok(psn_next)
}

fn replay_log(
    dir: &Path,
    id: u64,
    sealed: bool,
    read_only: bool,
    index: &mut KeyIndex,
    rep: &mut Repository,
) -> Result<()> {
    let path = crate::wal::log_path(dir, id, sealed);
    let mut reader = match LogReader::open(&path) {
        Ok(reader) => reader,
        Err(Error::Corrupted(msg)) => {
            warn!("epoch {id}: unreadable log {}: {msg}", path.display());
            if !sealed && !read_only {
                fs::remove_file(&path)?;
            }
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    let mut count = 0u64;
    let mut valid_end = reader.offset();
    loop {
        match reader.next() {
            Ok(Some(ReplayItem::Record {
                kind_flag,
                crc,
                key,
                value,
            })) => {
                let Some(kind) = RecordKind::from_flag(kind_flag) else {
                    continue;
                };
                let old = index.set(Version::from_parts(kind, id, crc, key, value));
                drop(old);
                count += 1;
                valid_end = reader.offset();
            }
            Ok(Some(ReplayItem::Eof)) => {
                valid_end = reader.offset();
                break;
            }
            Ok(None) => break,
            Err(Error::Corrupted(msg)) => {
                warn!(
                    "epoch {id}: log {} cut short at offset {valid_end}: {msg}",
                    path.display()
                );
                break;
            }
            Err(e) => return Err(e),
        }
    }
    drop(reader);

    if count == 0 {
        debug!("epoch {id}: empty log, discarding");
        if !read_only {
            fs::remove_file(&path)?;
        }
        return Ok(());
    }

    let mut log = LogWriter::reopen(path, id, sealed, read_only)?;
    if !sealed && !read_only {
        log.truncate_to(valid_end)?;
    }
    debug!("epoch {id}: replayed {count} records");
    rep.attach(Epoch {
        id,
        state: EpochState::Xfer(log),
        nupdate: count,
    });
    Ok(())
}
