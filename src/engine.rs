//! The storage engine: open/close lifecycle, the write path, the
//! transaction protocol and the background merger.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, warn};

use crate::catalog::Catalog;
use crate::config::{Comparator, Config};
use crate::error::{Error, Result};
use crate::index::{KeyIndex, INDEX_PAGE_CAP};
use crate::recovery::{self, DirLock};
use crate::repository::{Epoch, EpochState, Repository};
use crate::task::Task;
use crate::version::{RecordKind, Version};
use crate::wal::{Batch, LogWriter};

/// Snapshot of the engine counters, taken under the full lock hierarchy.
#[derive(Debug, Clone, Default)]
pub struct Stat {
    /// Latest minted epoch id
    pub epoch: u64,
    /// Next page sequence number
    pub psn: u64,
    /// Epochs tracked by the repository
    pub epochs: u32,
    /// Retired epochs backed by db files
    pub db_epochs: u32,
    /// Sealed epochs awaiting or undergoing transfer
    pub xfer_epochs: u32,
    /// Pages in the on-disk catalog
    pub pages: usize,
    /// Entries in the in-memory index
    pub index_count: usize,
    /// Pages of the in-memory index
    pub index_pages: usize,
}

/// State guarded by the log lock: the repository (including the live
/// epoch's log) and the write batch.
pub(crate) struct LogState {
    pub rep: Repository,
    pub batch: Batch,
}

/// State guarded by the index lock: the live/shadow index pair with its
/// selector, the transaction staging index, and the snapshot of entries
/// a running merge keeps visible to readers.
pub(crate) struct IndexState {
    i0: KeyIndex,
    i1: KeyIndex,
    current_is_i1: bool,
    pub itxn: KeyIndex,
    pub merging: Option<Arc<Vec<Version>>>,
}

impl IndexState {
    fn new(cmp: &Comparator) -> IndexState {
        IndexState {
            i0: KeyIndex::new(INDEX_PAGE_CAP, cmp.clone()),
            i1: KeyIndex::new(INDEX_PAGE_CAP, cmp.clone()),
            current_is_i1: false,
            itxn: KeyIndex::new(INDEX_PAGE_CAP, cmp.clone()),
            merging: None,
        }
    }

    pub fn current(&self) -> &KeyIndex {
        if self.current_is_i1 {
            &self.i1
        } else {
            &self.i0
        }
    }

    pub fn current_mut(&mut self) -> &mut KeyIndex {
        if self.current_is_i1 {
            &mut self.i1
        } else {
            &mut self.i0
        }
    }

    /// The index sealed by the last swap.
    pub fn sealed_mut(&mut self) -> &mut KeyIndex {
        if self.current_is_i1 {
            &mut self.i0
        } else {
            &mut self.i1
        }
    }

    /// Redirects writes to the shadow index; the previous current index
    /// becomes the sealed one.
    pub fn swap(&mut self) {
        debug_assert_eq!(self.sealed_mut().count(), 0);
        self.current_is_i1 = !self.current_is_i1;
    }
}

pub(crate) struct Shared {
    pub config: Config,
    pub dir: PathBuf,
    pub cmp: Comparator,
    pub stop: AtomicBool,
    pub fatal: AtomicBool,
    pub txn_multi: AtomicBool,
    pub cursors: AtomicU32,
    pub psn: AtomicU64,
    pub log: Mutex<LogState>,
    pub catalog: Mutex<Catalog>,
    pub index: Mutex<IndexState>,
}

/// A poisoned mutex means a thread panicked inside the engine; treat it
/// like the fatal error state.
pub(crate) fn lock<T>(m: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    m.lock().map_err(|_| Error::Fatal)
}

/// Creates the next live epoch: mint an id, create its log, write the
/// log header, attach it to the repository.
pub(crate) fn rotate(dir: &Path, state: &mut LogState) -> Result<()> {
    let id = state.rep.mint();
    let mut log = LogWriter::create(dir, id)?;
    log.write_header()?;
    debug!("rotated to epoch {id}");
    state.rep.attach(Epoch {
        id,
        state: EpochState::Live(log),
        nupdate: 0,
    });
    Ok(())
}

/// An embedded, single-writer key-value store persisted as an
/// epoch-partitioned log-structured store.
///
/// Writes append to the live epoch's log before they land in the
/// in-memory index; a background merger promotes the index into
/// immutable sorted page files once it crosses the configured
/// watermark. See the crate docs for an end-to-end example.
pub struct Database {
    pub(crate) shared: Arc<Shared>,
    merger: Option<Task>,
    _dirlock: Option<DirLock>,
    closed: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

impl Database {
    /// Opens (creating if necessary) the database in `config.dir`.
    pub fn open(config: Config) -> Result<Database> {
        config.validate()?;
        let dir = config.dir.clone().expect("validated");
        let cmp = config
            .comparator
            .clone()
            .unwrap_or_else(Comparator::lexicographic);

        std::fs::create_dir_all(&dir)?;
        let dirlock = DirLock::acquire(&dir)?;

        let mut index = IndexState::new(&cmp);
        let mut catalog = Catalog::new();
        let mut rep = Repository::new();
        let psn = recovery::recover(
            &dir,
            config.read_only,
            index.current_mut(),
            &mut catalog,
            &mut rep,
        )?;

        let mut log = LogState {
            rep,
            batch: Batch::new(),
        };
        if !config.read_only {
            rotate(&dir, &mut log)?;
        }

        let run_merger = config.merge && !config.read_only;
        let shared = Arc::new(Shared {
            config,
            dir,
            cmp,
            stop: AtomicBool::new(false),
            fatal: AtomicBool::new(false),
            txn_multi: AtomicBool::new(false),
            cursors: AtomicU32::new(0),
            psn: AtomicU64::new(psn),
            log: Mutex::new(log),
            catalog: Mutex::new(catalog),
            index: Mutex::new(index),
        });

        let merger = if run_merger {
            let task = start_merger(shared.clone())?;
            task.wakeup();
            Some(task)
        } else {
            None
        };

        Ok(Database {
            shared,
            merger,
            _dirlock: Some(dirlock),
            closed: false,
        })
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.shared.fatal.load(Ordering::Acquire) {
            return Err(Error::Fatal);
        }
        Ok(())
    }

    fn check_writable(&self, key: &[u8]) -> Result<()> {
        self.validate()?;
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }
        if key.len() > u16::MAX as usize {
            return Err(Error::KeyTooLarge(key.len()));
        }
        if self.shared.cursors.load(Ordering::Acquire) > 0 {
            return Err(Error::OpenCursor("modify"));
        }
        Ok(())
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check_writable(key)?;
        if value.len() as u64 > u32::MAX as u64 {
            return Err(Error::ValueTooLarge(value.len()));
        }
        self.write_version(Version::set(key, value))
    }

    /// Removes `key`. Deleting an absent key is recorded all the same.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.check_writable(key)?;
        self.write_version(Version::delete(key))
    }

    /// One record write: log first, index second. In a multi-statement
    /// transaction the version only reaches the staging index.
    fn write_version(&self, mut v: Version) -> Result<()> {
        // header and crc are composed outside the locks
        let header = v.header().encode();

        if self.shared.txn_multi.load(Ordering::Acquire) {
            let mut idx = lock(&self.shared.index)?;
            let old = idx.itxn.set(v);
            drop(idx);
            drop(old);
            return Ok(());
        }

        let mut log = lock(&self.shared.log)?;
        let mut idx = lock(&self.shared.index)?;

        let LogState { rep, batch } = &mut *log;
        let live = rep
            .live_mut()
            .ok_or_else(|| Error::Other("no live epoch".to_string()))?;
        let epoch = live.id;
        let writer = live.log_mut().expect("live epoch carries a log");
        writer.savepoint();
        batch.add(&header);
        batch.add(&v.key);
        batch.add(&v.value);
        if let Err(e) = writer.put(batch) {
            batch.reset();
            if writer.rollback().is_err() {
                self.shared.fatal.store(true, Ordering::Release);
            }
            drop(idx);
            return Err(e);
        }

        v.epoch = epoch;
        let old = idx.current_mut().set(v);
        live.nupdate += 1;
        let wake = live.nupdate % self.shared.config.merge_watermark == 0;
        drop(idx);
        drop(log);
        // displaced version freed outside the locks
        drop(old);

        if wake {
            if let Some(task) = &self.merger {
                task.wakeup();
            }
        }
        Ok(())
    }

    /// Looks up `key`, newest version first: current index, then the
    /// snapshot of a running merge, then the on-disk catalog.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.validate()?;
        if key.len() > u16::MAX as usize {
            return Err(Error::KeyTooLarge(key.len()));
        }
        {
            let idx = lock(&self.shared.index)?;
            if let Some(v) = idx.current().get(key) {
                return Ok(match v.kind {
                    RecordKind::Set => Some(v.value.to_vec()),
                    RecordKind::Delete => None,
                });
            }
            if let Some(merging) = &idx.merging {
                if let Ok(i) =
                    merging.binary_search_by(|e| self.shared.cmp.cmp(&e.key, key))
                {
                    let v = &merging[i];
                    return Ok(match v.kind {
                        RecordKind::Set => Some(v.value.to_vec()),
                        RecordKind::Delete => None,
                    });
                }
            }
        }
        let mut cat = lock(&self.shared.catalog)?;
        Ok(match cat.search(key, &self.shared.cmp)? {
            Some((RecordKind::Set, value)) => Some(value),
            Some((RecordKind::Delete, _)) | None => None,
        })
    }

    /// Enters a multi-statement transaction.
    pub fn begin(&self) -> Result<()> {
        self.validate()?;
        if self.shared.txn_multi.load(Ordering::Acquire) {
            return Err(Error::TransactionActive);
        }
        if self.shared.cursors.load(Ordering::Acquire) > 0 {
            return Err(Error::OpenCursor("begin"));
        }
        self.shared.txn_multi.store(true, Ordering::Release);
        Ok(())
    }

    /// Flushes the staged transaction to the live log and the index.
    pub fn commit(&self) -> Result<()> {
        self.validate()?;
        if !self.shared.txn_multi.load(Ordering::Acquire) {
            return Err(Error::NoTransaction("commit"));
        }
        if self.shared.cursors.load(Ordering::Acquire) > 0 {
            return Err(Error::OpenCursor("commit"));
        }

        let mut log = lock(&self.shared.log)?;
        let mut idx = lock(&self.shared.index)?;
        if idx.itxn.count() == 0 {
            drop(idx);
            drop(log);
            self.shared.txn_multi.store(false, Ordering::Release);
            return Ok(());
        }
        let n = idx.itxn.count() as u64;

        let LogState { rep, batch } = &mut *log;
        let live = rep
            .live_mut()
            .ok_or_else(|| Error::Other("no live epoch".to_string()))?;
        let epoch = live.id;
        let writer = live.log_mut().expect("live epoch carries a log");
        writer.savepoint();

        let staged = idx.itxn.take_sorted();
        let mut failed: Option<Error> = None;
        for mut v in staged {
            if !batch.ensure(3) {
                if let Err(e) = writer.put(batch) {
                    failed = Some(e);
                    break;
                }
            }
            v.epoch = epoch;
            batch.add(&v.header().encode());
            batch.add(&v.key);
            batch.add(&v.value);
            let old = idx.current_mut().set(v);
            drop(old);
        }
        if failed.is_none() && batch.has() {
            if let Err(e) = writer.put(batch) {
                failed = Some(e);
            }
        }

        if let Some(e) = failed {
            // a half-applied commit poisons the engine: the index may be
            // ahead of the rolled-back log
            self.shared.fatal.store(true, Ordering::Release);
            batch.reset();
            let _ = writer.rollback();
            idx.itxn.truncate();
            drop(idx);
            drop(log);
            self.shared.txn_multi.store(false, Ordering::Release);
            return Err(e);
        }

        live.nupdate += n;
        let wake = live.nupdate >= self.shared.config.merge_watermark;
        drop(idx);
        drop(log);
        self.shared.txn_multi.store(false, Ordering::Release);
        if wake {
            if let Some(task) = &self.merger {
                task.wakeup();
            }
        }
        Ok(())
    }

    /// Discards the staged transaction.
    pub fn rollback(&self) -> Result<()> {
        self.validate()?;
        if !self.shared.txn_multi.load(Ordering::Acquire) {
            return Err(Error::NoTransaction("rollback"));
        }
        if self.shared.cursors.load(Ordering::Acquire) > 0 {
            return Err(Error::OpenCursor("rollback"));
        }
        let mut idx = lock(&self.shared.index)?;
        idx.itxn.truncate();
        drop(idx);
        self.shared.txn_multi.store(false, Ordering::Release);
        Ok(())
    }

    /// Runs one merge synchronously. Only available when the background
    /// merger is disabled, so the two drivers cannot race.
    pub fn merge(&self) -> Result<()> {
        self.validate()?;
        if self.shared.config.merge {
            return Err(Error::MergerActive);
        }
        if self.shared.config.read_only {
            return Err(Error::ReadOnly);
        }
        crate::merge::merge(&self.shared)
    }

    pub fn stat(&self) -> Result<Stat> {
        let log = lock(&self.shared.log)?;
        let cat = lock(&self.shared.catalog)?;
        let idx = lock(&self.shared.index)?;
        Ok(Stat {
            epoch: log.rep.epoch(),
            psn: self.shared.psn.load(Ordering::Acquire),
            epochs: log.rep.count(),
            db_epochs: log.rep.db_count(),
            xfer_epochs: log.rep.xfer_count(),
            pages: cat.page_count(),
            index_count: idx.current().count(),
            index_pages: idx.current().page_count(),
        })
    }

    /// Closes the database, completing every epoch log. Dropping the
    /// handle does the same best-effort.
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.stop.store(true, Ordering::Release);
        if let Some(mut task) = self.merger.take() {
            task.stop();
        }

        let read_only = self.shared.config.read_only;
        let mut first: Option<Error> = None;
        match self.shared.log.lock() {
            Ok(mut log) => {
                for e in log.rep.drain() {
                    match e.state {
                        EpochState::Live(mut writer) => {
                            if e.nupdate == 0 {
                                record(&mut first, writer.unlink());
                            } else {
                                // a non-empty live log is sealed like a
                                // transferring one so recovery replays it
                                record(&mut first, writer.write_eof());
                                record(&mut first, writer.complete());
                            }
                        }
                        EpochState::Xfer(mut writer) => {
                            if !read_only {
                                record(&mut first, writer.complete());
                            }
                        }
                        EpochState::Db { .. } | EpochState::Undef => {}
                    }
                }
            }
            Err(_) => first = Some(Error::Fatal),
        }
        // catalog file handles close when the engine state drops

        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        // Ignore errors during drop, but complete every epoch
        let _ = self.shutdown();
    }
}

fn record(first: &mut Option<Error>, result: Result<()>) {
    if let Err(e) = result {
        warn!("close: {e}");
        if first.is_none() {
            *first = Some(e);
        }
    }
}

/// The background merger: re-check the watermark after every wakeup,
/// merge when crossed, exit on error or stop.
fn start_merger(shared: Arc<Shared>) -> Result<Task> {
    let task = Task::spawn("epochdb-merger", move |ctx| loop {
        let should = match shared.index.lock() {
            Ok(idx) => idx.current().count() as u64 > shared.config.merge_watermark,
            Err(_) => return,
        };
        if should {
            if let Err(e) = crate::merge::merge(&shared) {
                warn!("merger exiting: {e}");
                ctx.done();
                return;
            }
        }
        if !ctx.wait() {
            return;
        }
    })
    .map_err(Error::Io)?;
    Ok(task)
}
