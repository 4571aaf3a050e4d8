//! Basic engine operations: point writes, lookups, durability across
//! reopen, size guards and handle-level preconditions.

use epochdb::{Config, Database, Error, Result};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Result<Database> {
    // small pages keep the tests snappy without changing behavior
    let mut config = Config::new(dir);
    config.page = 16;
    Database::open(config)
}

#[test]
fn set_get_delete() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    db.set(b"key", b"value")?;
    assert_eq!(db.get(b"key")?, Some(b"value".to_vec()));

    db.delete(b"key")?;
    assert_eq!(db.get(b"key")?, None);

    assert_eq!(db.get(b"missing")?, None);
    db.close()?;
    Ok(())
}

#[test]
fn values_survive_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(b"a", b"1")?;
        db.close()?;
    }
    {
        let db = open(dir.path())?;
        assert_eq!(db.get(b"a")?, Some(b"1".to_vec()), "value not persisted");
        db.close()?;
    }
    Ok(())
}

#[test]
fn last_writer_wins() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    db.set(b"k", b"v1")?;
    db.set(b"k", b"v2")?;
    assert_eq!(db.get(b"k")?, Some(b"v2".to_vec()));

    let stat = db.stat()?;
    assert_eq!(stat.index_count, 1, "replacement must not grow the index");
    db.close()?;
    Ok(())
}

#[test]
fn delete_survives_reopen() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(b"gone", b"x")?;
        db.delete(b"gone")?;
        db.close()?;
    }
    let db = open(dir.path())?;
    assert_eq!(db.get(b"gone")?, None);
    db.close()?;
    Ok(())
}

#[test]
fn oversized_key_is_rejected_without_mutation() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;

    let huge = vec![0u8; (u16::MAX as usize) + 1];
    assert!(matches!(db.set(&huge, b"v"), Err(Error::KeyTooLarge(_))));
    assert!(matches!(db.delete(&huge), Err(Error::KeyTooLarge(_))));
    assert!(matches!(db.get(&huge), Err(Error::KeyTooLarge(_))));
    assert_eq!(db.stat()?.index_count, 0);

    // the largest admissible key still works
    let max = vec![7u8; u16::MAX as usize];
    db.set(&max, b"v")?;
    assert_eq!(db.get(&max)?, Some(b"v".to_vec()));
    db.close()?;
    Ok(())
}

#[test]
fn missing_directory_is_reported() {
    let err = Database::open(Config::default()).unwrap_err();
    assert_eq!(err.to_string(), "directory is not specified");
}

#[test]
fn directory_is_exclusively_locked() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    assert!(matches!(open(dir.path()), Err(Error::Locked(_))));
    db.close()?;
    // released on close
    let db = open(dir.path())?;
    db.close()?;
    Ok(())
}

#[test]
fn read_only_rejects_writes() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(b"k", b"v")?;
        db.close()?;
    }
    let mut config = Config::new(dir.path());
    config.read_only = true;
    let db = Database::open(config)?;
    assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
    assert!(matches!(db.set(b"k", b"w"), Err(Error::ReadOnly)));
    assert!(matches!(db.delete(b"k"), Err(Error::ReadOnly)));
    db.close()?;

    // nothing changed on disk
    let db = open(dir.path())?;
    assert_eq!(db.get(b"k")?, Some(b"v".to_vec()));
    db.close()?;
    Ok(())
}

#[test]
fn stat_reports_engine_counters() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    db.set(b"a", b"1")?;
    db.set(b"b", b"2")?;

    let stat = db.stat()?;
    assert_eq!(stat.index_count, 2);
    assert!(stat.index_pages >= 1);
    assert_eq!(stat.epochs, 1);
    assert_eq!(stat.db_epochs, 0);
    assert!(stat.epoch >= 1);
    db.close()?;
    Ok(())
}

#[test]
fn format_version_is_exposed() {
    let (major, _minor) = epochdb::version();
    assert_eq!(major, 1);
}

#[test]
fn drop_closes_cleanly() -> Result<()> {
    let dir = tempdir()?;
    {
        let db = open(dir.path())?;
        db.set(b"dropped", b"v")?;
        // no explicit close
    }
    let db = open(dir.path())?;
    assert_eq!(db.get(b"dropped")?, Some(b"v".to_vec()));
    db.close()?;
    Ok(())
}

#[test]
fn empty_value_round_trips() -> Result<()> {
    let dir = tempdir()?;
    let db = open(dir.path())?;
    db.set(b"empty", b"")?;
    assert_eq!(db.get(b"empty")?, Some(Vec::new()));
    db.close()?;

    let db = open(dir.path())?;
    assert_eq!(db.get(b"empty")?, Some(Vec::new()));
    db.close()?;
    Ok(())
}

#[test]
fn custom_comparator_is_honored() -> Result<()> {
    let dir = tempdir()?;
    let mut config = Config::new(dir.path());
    config.merge = false;
    config.comparator = Some(epochdb::Comparator::new(|a: &[u8], b: &[u8]| b.cmp(a)));
    let db = Database::open(config)?;
    db.set(b"a", b"1")?;
    db.set(b"b", b"2")?;
    db.set(b"c", b"3")?;
    assert_eq!(db.get(b"b")?, Some(b"2".to_vec()));

    let mut cursor = db.cursor(epochdb::Order::Gte, None)?;
    let mut keys = Vec::new();
    while cursor.fetch() {
        keys.push(cursor.key().unwrap().to_vec());
    }
    drop(cursor);
    assert_eq!(keys, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    db.close()?;
    Ok(())
}
