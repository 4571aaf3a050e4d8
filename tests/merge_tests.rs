//! Epoch promotion: forced merges, the watermark-driven background
//! merger, reads spanning memory and db epochs, and GC fold-in.

use std::time::{Duration, Instant};

use epochdb::{Config, Database, Error, Result};
use tempfile::tempdir;

/// Forced-merge configuration: merger thread off, small pages.
fn manual(dir: &std::path::Path) -> Config {
    let mut config = Config::new(dir);
    config.merge = false;
    config.page = 4;
    config.merge_watermark = 2;
    config.db_new_size = 4096;
    config
}

#[test]
fn forced_merge_retires_the_live_epoch() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(manual(dir.path()))?;
    for n in 0..10u32 {
        db.set(format!("key{n:02}").as_bytes(), &n.to_le_bytes())?;
    }
    assert_eq!(db.stat()?.db_epochs, 0);

    db.merge()?;

    let stat = db.stat()?;
    assert_eq!(stat.db_epochs, 1);
    assert_eq!(stat.xfer_epochs, 0);
    assert_eq!(stat.index_count, 0, "merged entries must leave the index");
    assert!(stat.pages >= 1);

    // reads now come from the page file
    for n in 0..10u32 {
        assert_eq!(
            db.get(format!("key{n:02}").as_bytes())?,
            Some(n.to_le_bytes().to_vec())
        );
    }
    db.close()?;
    Ok(())
}

#[test]
fn merged_data_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = Database::open(manual(dir.path()))?;
        for n in 0..20u32 {
            db.set(format!("key{n:02}").as_bytes(), &n.to_le_bytes())?;
        }
        db.merge()?;
        db.set(b"after-merge", b"live")?;
        db.close()?;
    }
    let db = Database::open(manual(dir.path()))?;
    assert_eq!(db.stat()?.db_epochs, 1);
    assert_eq!(db.get(b"key07")?, Some(7u32.to_le_bytes().to_vec()));
    assert_eq!(db.get(b"after-merge")?, Some(b"live".to_vec()));
    db.close()?;
    Ok(())
}

#[test]
fn merge_on_empty_index_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(manual(dir.path()))?;
    db.merge()?;
    let stat = db.stat()?;
    assert_eq!(stat.db_epochs, 0);
    assert_eq!(stat.epochs, 1);
    db.close()?;
    Ok(())
}

#[test]
fn forced_merge_conflicts_with_background_merger() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(Config::new(dir.path()))?;
    let err = db.merge().unwrap_err();
    assert!(matches!(err, Error::MergerActive));
    db.close()?;
    Ok(())
}

#[test]
fn newer_epochs_shadow_older_ones() -> Result<()> {
    let dir = tempdir()?;
    let mut config = manual(dir.path());
    config.gc = false;
    let db = Database::open(config)?;

    db.set(b"stale", b"old")?;
    db.set(b"stable", b"same")?;
    db.merge()?;
    db.set(b"stale", b"new")?;
    db.delete(b"stable")?;
    db.merge()?;

    assert_eq!(db.stat()?.db_epochs, 2);
    assert_eq!(db.get(b"stale")?, Some(b"new".to_vec()));
    assert_eq!(db.get(b"stable")?, None, "tombstone must shadow the old value");
    db.close()?;

    let db = Database::open(manual(dir.path()))?;
    assert_eq!(db.get(b"stale")?, Some(b"new".to_vec()));
    assert_eq!(db.get(b"stable")?, None);
    db.close()?;
    Ok(())
}

#[test]
fn gc_folds_fully_superseded_epochs() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(manual(dir.path()))?;

    for n in 0..8u32 {
        db.set(format!("key{n:02}").as_bytes(), b"v1")?;
    }
    db.merge()?;
    assert_eq!(db.stat()?.db_epochs, 1);

    // rewrite every key; the first epoch is fully dead and folds away
    for n in 0..8u32 {
        db.set(format!("key{n:02}").as_bytes(), b"v2")?;
    }
    db.merge()?;

    assert_eq!(db.stat()?.db_epochs, 1, "dead epoch should be folded");
    for n in 0..8u32 {
        assert_eq!(db.get(format!("key{n:02}").as_bytes())?, Some(b"v2".to_vec()));
    }
    db.close()?;
    Ok(())
}

#[test]
fn gc_fold_keeps_live_records_of_the_victim() -> Result<()> {
    let dir = tempdir()?;
    let mut config = manual(dir.path());
    config.gc_factor = 0.5;
    let db = Database::open(config)?;

    for n in 0..8u32 {
        db.set(format!("key{n:02}").as_bytes(), b"v1")?;
    }
    db.merge()?;

    // supersede six of eight records: fraction 0.75 >= 0.5 folds the
    // epoch, the two untouched records must be carried over
    for n in 0..6u32 {
        db.set(format!("key{n:02}").as_bytes(), b"v2")?;
    }
    db.merge()?;

    assert_eq!(db.stat()?.db_epochs, 1);
    assert_eq!(db.get(b"key05")?, Some(b"v2".to_vec()));
    assert_eq!(db.get(b"key06")?, Some(b"v1".to_vec()));
    assert_eq!(db.get(b"key07")?, Some(b"v1".to_vec()));
    db.close()?;

    let db = Database::open(manual(dir.path()))?;
    assert_eq!(db.get(b"key06")?, Some(b"v1".to_vec()));
    db.close()?;
    Ok(())
}

#[test]
fn fully_deleted_store_gcs_down_to_nothing() -> Result<()> {
    let dir = tempdir()?;
    let db = Database::open(manual(dir.path()))?;

    db.set(b"k", b"v")?;
    db.merge()?;
    db.delete(b"k")?;
    db.merge()?;

    // the set epoch folded away and the tombstone had nothing older
    // left to shadow
    assert_eq!(db.get(b"k")?, None);
    assert_eq!(db.stat()?.db_epochs, 1);
    db.close()?;

    let db = Database::open(manual(dir.path()))?;
    assert_eq!(db.get(b"k")?, None);
    db.close()?;
    Ok(())
}

#[test]
fn background_merger_promotes_on_watermark() -> Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir()?;
    let mut config = Config::new(dir.path());
    config.merge_watermark = 2;
    config.page = 4;
    let db = Database::open(config)?;

    // a committed transaction crossing the watermark wakes the merger
    db.begin()?;
    db.set(b"a", b"1")?;
    db.set(b"b", b"2")?;
    db.set(b"c", b"3")?;
    db.commit()?;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stat = db.stat()?;
        if stat.db_epochs >= 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "merger did not promote an epoch in time"
        );
        std::thread::sleep(Duration::from_millis(10));
    }

    assert_eq!(db.get(b"b")?, Some(b"2".to_vec()));
    db.close()?;
    Ok(())
}

#[test]
fn single_statement_writes_cross_the_watermark() -> Result<()> {
    let dir = tempdir()?;
    let mut config = Config::new(dir.path());
    config.merge_watermark = 2;
    config.page = 4;
    let db = Database::open(config)?;

    for n in 0..4u32 {
        db.set(format!("k{n}").as_bytes(), b"v")?;
    }

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let stat = db.stat()?;
        if stat.db_epochs >= 1 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "merger did not promote an epoch in time"
        );
        std::thread::sleep(Duration::from_millis(10));
    }
    db.close()?;
    Ok(())
}

#[test]
fn psn_is_monotonic_across_merges_and_reopens() -> Result<()> {
    let dir = tempdir()?;
    let first_psn;
    {
        let db = Database::open(manual(dir.path()))?;
        for n in 0..8u32 {
            db.set(format!("key{n:02}").as_bytes(), b"v")?;
        }
        db.merge()?;
        first_psn = db.stat()?.psn;
        assert!(first_psn > 1);
        db.close()?;
    }
    let db = Database::open(manual(dir.path()))?;
    assert!(db.stat()?.psn >= first_psn);
    for n in 8..16u32 {
        db.set(format!("key{n:02}").as_bytes(), b"v")?;
    }
    db.merge()?;
    assert!(db.stat()?.psn > first_psn);
    db.close()?;
    Ok(())
}
