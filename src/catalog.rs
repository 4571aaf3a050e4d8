//! Catalog of the immutable pages produced by the merger.
//!
//! The catalog owns the read handles of every db epoch together with the
//! per-page key ranges, so the read path only needs the catalog lock to
//! resolve a key against disk. Pages within one epoch are sorted by their
//! minimum key and do not overlap; across epochs the newest one wins.

use std::cmp::Ordering;
use std::path::PathBuf;

use crate::config::Comparator;
use crate::dbfile::{DbFile, PageRecord, ScannedPage};
use crate::error::Result;
use crate::version::{RecordKind, Version};

/// Location and key range of one page inside its epoch's db file.
pub struct PageRef {
    pub psn: u64,
    pub offset: u64,
    pub size: u32,
    pub count: u32,
    pub min: Box<[u8]>,
    pub max: Box<[u8]>,
}

impl From<ScannedPage> for PageRef {
    fn from(p: ScannedPage) -> PageRef {
        PageRef {
            psn: p.psn,
            offset: p.offset,
            size: p.size,
            count: p.count,
            min: p.min,
            max: p.max,
        }
    }
}

/// All pages of one retired epoch.
pub struct EpochPages {
    pub epoch: u64,
    pub path: PathBuf,
    pub file: DbFile,
    pub pages: Vec<PageRef>,
}

impl EpochPages {
    fn locate(&self, key: &[u8], cmp: &Comparator) -> Option<usize> {
        let idx = self
            .pages
            .partition_point(|p| cmp.cmp(&p.min, key) != Ordering::Greater);
        if idx == 0 {
            return None;
        }
        let candidate = idx - 1;
        if cmp.cmp(key, &self.pages[candidate].max) == Ordering::Greater {
            return None;
        }
        Some(candidate)
    }
}

pub struct Catalog {
    /// Ascending by epoch id
    epochs: Vec<EpochPages>,
}

impl Catalog {
    pub fn new() -> Catalog {
        Catalog { epochs: Vec::new() }
    }

    pub fn page_count(&self) -> usize {
        self.epochs.iter().map(|e| e.pages.len()).sum()
    }

    pub fn install(&mut self, ep: EpochPages) {
        let at = self.epochs.partition_point(|e| e.epoch < ep.epoch);
        self.epochs.insert(at, ep);
    }

    pub fn remove(&mut self, epoch: u64) -> Option<EpochPages> {
        let at = self.epochs.iter().position(|e| e.epoch == epoch)?;
        Some(self.epochs.remove(at))
    }

    /// Resolves `key` against the newest epoch whose pages contain it.
    pub fn search(&mut self, key: &[u8], cmp: &Comparator) -> Result<Option<(RecordKind, Vec<u8>)>> {
        for ep in self.epochs.iter_mut().rev() {
            let Some(p) = ep.locate(key, cmp) else {
                continue;
            };
            let page = &ep.pages[p];
            let records = ep.file.read_page(page.offset, page.size, page.count)?;
            if let Ok(i) = records.binary_search_by(|r| cmp.cmp(&r.key, key)) {
                let r = &records[i];
                let kind = match RecordKind::from_flag(r.kind_flag) {
                    Some(kind) => kind,
                    None => continue,
                };
                return Ok(Some((kind, r.value.clone())));
            }
        }
        Ok(None)
    }

    /// Epoch ids whose page ranges contain `key`, newest first. Used by
    /// the merger to estimate how many records a merge supersedes.
    pub fn range_hits(&self, key: &[u8], cmp: &Comparator, out: &mut Vec<u64>) {
        out.clear();
        for ep in self.epochs.iter().rev() {
            if ep.locate(key, cmp).is_some() {
                out.push(ep.epoch);
            }
        }
    }

    /// Record totals per epoch, ascending by id.
    pub fn epoch_totals(&self) -> Vec<(u64, u64)> {
        self.epochs
            .iter()
            .map(|e| (e.epoch, e.pages.iter().map(|p| p.count as u64).sum()))
            .collect()
    }

    /// Whether any epoch accepted by `pred` actually stores `key`.
    pub fn contains_key_where(
        &mut self,
        key: &[u8],
        cmp: &Comparator,
        pred: impl Fn(u64) -> bool,
    ) -> Result<bool> {
        for ep in self.epochs.iter_mut() {
            if !pred(ep.epoch) {
                continue;
            }
            let Some(p) = ep.locate(key, cmp) else {
                continue;
            };
            let page = &ep.pages[p];
            let records = ep.file.read_page(page.offset, page.size, page.count)?;
            if records.binary_search_by(|r| cmp.cmp(&r.key, key)).is_ok() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Every record of one epoch in key order, rebuilt as versions
    /// stamped with that epoch.
    pub fn epoch_records(&mut self, epoch: u64) -> Result<Vec<Version>> {
        let Some(ep) = self.epochs.iter_mut().find(|e| e.epoch == epoch) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for page in &ep.pages {
            let records = ep.file.read_page(page.offset, page.size, page.count)?;
            for PageRecord {
                kind_flag,
                crc,
                key,
                value,
            } in records
            {
                if let Some(kind) = RecordKind::from_flag(kind_flag) {
                    out.push(Version::from_parts(kind, epoch, crc, key, value));
                }
            }
        }
        Ok(out)
    }

    /// Streams every record of every epoch, newest epoch first, for
    /// cursor materialization.
    pub fn all_records(&mut self) -> Result<Vec<(u64, Vec<Version>)>> {
        let mut out = Vec::new();
        for ep in self.epochs.iter_mut().rev() {
            let mut records = Vec::new();
            for page in &ep.pages {
                for PageRecord {
                    kind_flag,
                    crc,
                    key,
                    value,
                } in ep.file.read_page(page.offset, page.size, page.count)?
                {
                    if let Some(kind) = RecordKind::from_flag(kind_flag) {
                        records.push(Version::from_parts(kind, ep.epoch, crc, key, value));
                    }
                }
            }
            out.push((ep.epoch, records));
        }
        Ok(out)
    }
}
