//! Snapshot cursors.
//!
//! A cursor materializes the merged live state (in-memory index, the
//! snapshot of a running merge, and the on-disk catalog, newest epoch
//! winning) into its own refset at open, so iteration never touches the
//! engine again. While any cursor is open every mutation on the engine
//! is rejected; reads stay allowed.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;

use crate::config::Comparator;
use crate::engine::{lock, Database};
use crate::error::{Error, Result};
use crate::refset::{RefSet, RefSlot};
use crate::version::RecordKind;

/// Iteration direction and bound comparison of a cursor.
///
/// `Gte`/`Gt` iterate ascending from the bound, `Lte`/`Lt` descending.
/// Without a bound key the whole store is iterated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Gte,
    Gt,
    Lte,
    Lt,
}

fn in_bound(cmp: &Comparator, key: &[u8], bound: Option<&[u8]>, order: Order) -> bool {
    let Some(bound) = bound else {
        return true;
    };
    let ord = cmp.cmp(key, bound);
    match order {
        Order::Gte => ord != CmpOrdering::Less,
        Order::Gt => ord == CmpOrdering::Greater,
        Order::Lte => ord != CmpOrdering::Greater,
        Order::Lt => ord == CmpOrdering::Less,
    }
}

/// A snapshot reader over the database, created by
/// [`Database::cursor`]. Dropping it releases the mutation block.
pub struct Cursor<'a> {
    db: &'a Database,
    refset: RefSet,
    entries: Vec<(RefSlot, RefSlot)>,
    pos: usize,
}

impl Database {
    /// Opens a cursor at `key` (or the store boundary when `None`),
    /// iterating in the direction `order` implies.
    pub fn cursor(&self, order: Order, key: Option<&[u8]>) -> Result<Cursor<'_>> {
        self.validate()?;
        if let Some(k) = key {
            if k.len() > u16::MAX as usize {
                return Err(Error::KeyTooLarge(k.len()));
            }
        }
        let cmp = &self.shared.cmp;

        // (key, value, kind, rank): highest rank is the newest source
        let mut candidates: Vec<(Vec<u8>, Vec<u8>, RecordKind, u64)> = Vec::new();
        {
            let mut cat = lock(&self.shared.catalog)?;
            let idx = lock(&self.shared.index)?;
            for v in idx.current().iter() {
                candidates.push((v.key.to_vec(), v.value.to_vec(), v.kind, u64::MAX));
            }
            if let Some(merging) = &idx.merging {
                for v in merging.iter() {
                    candidates.push((v.key.to_vec(), v.value.to_vec(), v.kind, u64::MAX - 1));
                }
            }
            for (epoch, records) in cat.all_records()? {
                for v in records {
                    candidates.push((v.key.into_vec(), v.value.into_vec(), v.kind, epoch));
                }
            }
            self.shared.cursors.fetch_add(1, Ordering::AcqRel);
        }

        candidates.sort_by(|a, b| cmp.cmp(&a.0, &b.0).then(b.3.cmp(&a.3)));

        let mut refset = RefSet::new(self.shared.config.page as usize);
        let mut entries = Vec::new();
        for i in 0..candidates.len() {
            if i > 0 && cmp.cmp(&candidates[i].0, &candidates[i - 1].0) == CmpOrdering::Equal {
                continue;
            }
            let (k, v, kind, _) = &candidates[i];
            if *kind != RecordKind::Set || !in_bound(cmp, k, key, order) {
                continue;
            }
            let kslot = refset.push(k);
            let vslot = refset.push(v);
            entries.push((kslot, vslot));
        }
        if matches!(order, Order::Lte | Order::Lt) {
            entries.reverse();
        }

        Ok(Cursor {
            db: self,
            refset,
            entries,
            pos: 0,
        })
    }
}

impl Cursor<'_> {
    /// Advances to the next entry; `false` once the snapshot is
    /// exhausted. Must be called before the first [`Cursor::key`].
    pub fn fetch(&mut self) -> bool {
        if self.pos < self.entries.len() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    pub fn key(&self) -> Option<&[u8]> {
        if self.pos == 0 {
            return None;
        }
        Some(self.refset.get(self.entries[self.pos - 1].0))
    }

    pub fn value(&self) -> Option<&[u8]> {
        if self.pos == 0 {
            return None;
        }
        Some(self.refset.get(self.entries[self.pos - 1].1))
    }
}

impl Drop for Cursor<'_> {
    fn drop(&mut self) {
        self.db.shared.cursors.fetch_sub(1, Ordering::AcqRel);
    }
}
