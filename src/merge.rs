//! The merge procedure: promotes the in-memory index of a sealed epoch
//! into an immutable sorted page file and retires the logs it replaces.
//!
//! Crash ordering keeps every window recoverable: the db file is
//! renamed into place before any log or folded file is unlinked, an
//! incomplete output is deleted by the next recovery, and a tombstone is
//! only dropped when no surviving older epoch still holds its key.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::catalog::{EpochPages, PageRef};
use crate::dbfile::{DbFile, DbWriter};
use crate::engine::{lock, rotate, Shared};
use crate::error::Result;
use crate::repository::EpochState;
use crate::version::{RecordKind, Version};
use crate::wal::LogWriter;

pub(crate) fn merge(s: &Shared) -> Result<()> {
    if s.stop.load(Ordering::Acquire) {
        return Ok(());
    }

    // seal the live epoch and rotate a fresh one
    let sealed_id = {
        let mut log = lock(&s.log)?;
        let count = lock(&s.index)?.current().count();
        if count == 0 {
            return Ok(());
        }
        let Some(sealed_id) = log.rep.seal_live() else {
            return Ok(());
        };
        rotate(&s.dir, &mut log)?;
        sealed_id
    };

    // swap indexes; the sealed entries stay visible to readers as an
    // ordered snapshot until the catalog install below
    let batch: Arc<Vec<Version>> = {
        let mut idx = lock(&s.index)?;
        idx.swap();
        let snapshot = Arc::new(idx.sealed_mut().take_sorted());
        idx.merging = Some(snapshot.clone());
        snapshot
    };
    debug!("merge: epoch {sealed_id}, {} entries", batch.len());

    let victims = if s.config.gc {
        plan_gc(s, &batch)?
    } else {
        Vec::new()
    };
    let survivors = if victims.is_empty() {
        Vec::new()
    } else {
        collect_survivors(s, &batch, &victims)?
    };

    // transfer: write the sorted stream, batch shadowing folded records
    let page_records = s.config.page as usize;
    let mut writer = DbWriter::create(&s.dir, sealed_id, s.config.db_new_size, s.config.db_grow_factor)?;
    let mut pages: Vec<PageRef> = Vec::new();
    let mut chunk: Vec<&Version> = Vec::with_capacity(page_records);
    let (mut bi, mut si) = (0usize, 0usize);
    loop {
        let next = match (batch.get(bi), survivors.get(si)) {
            (Some(b), Some(sv)) => match s.cmp.cmp(&b.key, &sv.key) {
                CmpOrdering::Less => {
                    bi += 1;
                    b
                }
                CmpOrdering::Greater => {
                    si += 1;
                    sv
                }
                CmpOrdering::Equal => {
                    bi += 1;
                    si += 1;
                    b
                }
            },
            (Some(b), None) => {
                bi += 1;
                b
            }
            (None, Some(sv)) => {
                si += 1;
                sv
            }
            (None, None) => break,
        };
        chunk.push(next);
        if chunk.len() == page_records {
            flush_page(s, &mut writer, &mut chunk, &mut pages)?;
        }
    }
    flush_page(s, &mut writer, &mut chunk, &mut pages)?;
    let db_file_path = writer.complete()?;

    // install the new epoch and retire everything it replaces
    let (sealed_log, stale_logs, folded_paths) = {
        let mut log = lock(&s.log)?;
        let mut cat = lock(&s.catalog)?;
        let mut idx = lock(&s.index)?;

        let file = DbFile::open(&db_file_path)?;
        cat.install(EpochPages {
            epoch: sealed_id,
            path: db_file_path.clone(),
            file,
            pages,
        });
        let sealed_log = log.rep.promote_db(sealed_id, db_file_path.clone());

        // recovered transfers below the sealed epoch were drained into
        // this merge together with the live entries
        let mut stale_logs: Vec<LogWriter> = Vec::new();
        for id in log.rep.xfer_ids_below(sealed_id) {
            if let Some(e) = log.rep.remove(id) {
                if let EpochState::Xfer(stale) = e.state {
                    stale_logs.push(stale);
                }
            }
        }

        let mut folded_paths: Vec<PathBuf> = Vec::new();
        for &vid in &victims {
            if let Some(ep) = cat.remove(vid) {
                folded_paths.push(ep.path);
            }
            log.rep.remove(vid);
        }

        idx.merging = None;
        (sealed_log, stale_logs, folded_paths)
    };

    if let Some(log) = sealed_log {
        if let Err(e) = log.unlink() {
            warn!("merge: leaving transferred log of epoch {sealed_id}: {e}");
        }
    }
    for stale in stale_logs {
        if let Err(e) = stale.unlink() {
            warn!("merge: leaving recovered log {}: {e}", stale.epoch());
        }
    }
    for path in folded_paths {
        if let Err(e) = fs::remove_file(&path) {
            warn!("merge: leaving folded db file {}: {e}", path.display());
        }
    }

    info!(
        "merge: epoch {sealed_id} -> {} ({} records, {} folded epochs)",
        db_file_path.display(),
        batch.len() + survivors.len(),
        victims.len()
    );
    Ok(())
}

fn flush_page(
    s: &Shared,
    writer: &mut DbWriter,
    chunk: &mut Vec<&Version>,
    pages: &mut Vec<PageRef>,
) -> Result<()> {
    if chunk.is_empty() {
        return Ok(());
    }
    let psn = s.psn.fetch_add(1, Ordering::SeqCst);
    let (offset, size) = writer.write_page(chunk, psn)?;
    pages.push(PageRef {
        psn,
        offset,
        size,
        count: chunk.len() as u32,
        min: chunk[0].key.clone(),
        max: chunk[chunk.len() - 1].key.clone(),
    });
    chunk.clear();
    Ok(())
}

/// Retired epochs whose dead fraction crosses the configured threshold.
/// Supersession is estimated from page key ranges, so the fold-in below
/// still re-checks every record it keeps.
fn plan_gc(s: &Shared, batch: &[Version]) -> Result<Vec<u64>> {
    let cat = lock(&s.catalog)?;
    let totals = cat.epoch_totals();
    if totals.is_empty() {
        return Ok(Vec::new());
    }
    let mut hits: HashMap<u64, u64> = HashMap::new();
    let mut scratch = Vec::new();
    for v in batch {
        cat.range_hits(&v.key, &s.cmp, &mut scratch);
        for &id in &scratch {
            *hits.entry(id).or_insert(0) += 1;
        }
    }
    let mut victims: Vec<u64> = totals
        .into_iter()
        .filter(|&(id, total)| {
            let dead = hits.get(&id).copied().unwrap_or(0);
            total > 0 && dead as f64 / total as f64 >= s.config.gc_factor
        })
        .map(|(id, _)| id)
        .collect();
    victims.sort_unstable();
    if !victims.is_empty() {
        debug!("merge: folding epochs {victims:?}");
    }
    Ok(victims)
}

/// Still-live records of the folded epochs, in key order. A record
/// survives unless the merge batch or a newer surviving epoch holds its
/// key; a surviving tombstone is dropped once no older surviving epoch
/// stores the key it deletes.
fn collect_survivors(s: &Shared, batch: &[Version], victims: &[u64]) -> Result<Vec<Version>> {
    let mut cat = lock(&s.catalog)?;

    // newest folded copy per key; victims ascend, so later wins
    let mut newest: Vec<Version> = Vec::new();
    for &vid in victims {
        for v in cat.epoch_records(vid)? {
            match newest.binary_search_by(|e| s.cmp.cmp(&e.key, &v.key)) {
                Ok(i) => newest[i] = v,
                Err(i) => newest.insert(i, v),
            }
        }
    }

    let mut out = Vec::new();
    for v in newest {
        if batch
            .binary_search_by(|e| s.cmp.cmp(&e.key, &v.key))
            .is_ok()
        {
            continue;
        }
        if cat.contains_key_where(&v.key, &s.cmp, |id| !victims.contains(&id) && id > v.epoch)? {
            continue;
        }
        if v.kind == RecordKind::Delete
            && !cat.contains_key_where(&v.key, &s.cmp, |id| {
                !victims.contains(&id) && id < v.epoch
            })?
        {
            continue;
        }
        out.push(v);
    }
    Ok(out)
}
