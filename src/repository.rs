//! Epoch repository: the ordered list of storage generations and their
//! lifecycle states.
//!
//! ```text
//! Undef -> scheduled for recovery, not yet processed
//! Live  -> open log file, receiving appends
//! Xfer  -> sealed log, being converted into a db file
//! Db    -> immutable sorted page file; log unlinked
//! ```
//!
//! At most one epoch is Live and it always carries the largest id.

use std::path::PathBuf;

use crate::wal::LogWriter;

pub enum EpochState {
    Undef,
    Live(LogWriter),
    Xfer(LogWriter),
    Db { path: PathBuf },
}

pub struct Epoch {
    pub id: u64,
    pub state: EpochState,
    /// Records appended while this epoch was live
    pub nupdate: u64,
}

impl Epoch {
    pub fn log_mut(&mut self) -> Option<&mut LogWriter> {
        match &mut self.state {
            EpochState::Live(log) | EpochState::Xfer(log) => Some(log),
            _ => None,
        }
    }
}

pub struct Repository {
    /// Ascending by id
    epochs: Vec<Epoch>,
    /// Monotonic counter minting epoch ids
    epoch: u64,
    ndb: u32,
    nxfer: u32,
}

impl Repository {
    pub fn new() -> Repository {
        Repository {
            epochs: Vec::new(),
            epoch: 0,
            ndb: 0,
            nxfer: 0,
        }
    }

    /// Mints the next epoch id.
    pub fn mint(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Latest minted epoch id.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Resumes the id counter after recovery.
    pub fn resume_from(&mut self, max_seen: u64) {
        self.epoch = self.epoch.max(max_seen);
    }

    pub fn count(&self) -> u32 {
        self.epochs.len() as u32
    }

    pub fn db_count(&self) -> u32 {
        self.ndb
    }

    pub fn xfer_count(&self) -> u32 {
        self.nxfer
    }

    pub fn attach(&mut self, e: Epoch) {
        debug_assert!(self.epochs.last().map_or(true, |last| last.id < e.id));
        match e.state {
            EpochState::Db { .. } => self.ndb += 1,
            EpochState::Xfer(_) => self.nxfer += 1,
            _ => {}
        }
        self.epochs.push(e);
    }

    pub fn live_mut(&mut self) -> Option<&mut Epoch> {
        self.epochs
            .iter_mut()
            .find(|e| matches!(e.state, EpochState::Live(_)))
    }

    /// Marks the live epoch as transferring, returning its id.
    pub fn seal_live(&mut self) -> Option<u64> {
        let e = self
            .epochs
            .iter_mut()
            .find(|e| matches!(e.state, EpochState::Live(_)))?;
        if let EpochState::Live(log) = std::mem::replace(&mut e.state, EpochState::Undef) {
            e.state = EpochState::Xfer(log);
            self.nxfer += 1;
        }
        Some(e.id)
    }

    /// Completes a transfer: the epoch becomes a db epoch and its log
    /// writer is handed back for unlinking.
    pub fn promote_db(&mut self, id: u64, path: PathBuf) -> Option<LogWriter> {
        let e = self.epochs.iter_mut().find(|e| e.id == id)?;
        match std::mem::replace(&mut e.state, EpochState::Db { path }) {
            EpochState::Xfer(log) => {
                self.nxfer -= 1;
                self.ndb += 1;
                Some(log)
            }
            other => {
                e.state = other;
                None
            }
        }
    }

    /// Sealed epochs below `id`, i.e. the recovered transfers whose
    /// replayed records a finishing merge has just made durable.
    pub fn xfer_ids_below(&self, id: u64) -> Vec<u64> {
        self.epochs
            .iter()
            .filter(|e| e.id < id && matches!(e.state, EpochState::Xfer(_)))
            .map(|e| e.id)
            .collect()
    }

    /// Retires an epoch, dropping it from the counters.
    pub fn remove(&mut self, id: u64) -> Option<Epoch> {
        let at = self.epochs.iter().position(|e| e.id == id)?;
        let e = self.epochs.remove(at);
        match e.state {
            EpochState::Db { .. } => self.ndb -= 1,
            EpochState::Xfer(_) => self.nxfer -= 1,
            _ => {}
        }
        Some(e)
    }

    /// Empties the repository for the close path.
    pub fn drain(&mut self) -> Vec<Epoch> {
        self.ndb = 0;
        self.nxfer = 0;
        std::mem::take(&mut self.epochs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mint_is_monotonic() {
        let mut rep = Repository::new();
        rep.resume_from(7);
        assert_eq!(rep.mint(), 8);
        assert_eq!(rep.mint(), 9);
        assert_eq!(rep.epoch(), 9);
    }

    #[test]
    fn counters_track_states() {
        let dir = tempfile::tempdir().unwrap();
        let mut rep = Repository::new();
        let id = rep.mint();
        let log = LogWriter::create(dir.path(), id).unwrap();
        rep.attach(Epoch {
            id,
            state: EpochState::Live(log),
            nupdate: 0,
        });
        assert_eq!(rep.count(), 1);
        assert_eq!(rep.xfer_count(), 0);

        assert_eq!(rep.seal_live(), Some(id));
        assert!(rep.live_mut().is_none());
        assert_eq!(rep.xfer_count(), 1);

        let log = rep.promote_db(id, dir.path().join("1.db")).unwrap();
        log.unlink().unwrap();
        assert_eq!(rep.xfer_count(), 0);
        assert_eq!(rep.db_count(), 1);

        rep.remove(id).unwrap();
        assert_eq!(rep.count(), 0);
        assert_eq!(rep.db_count(), 0);
    }
}
