//! An embedded, single-writer key-value store organized as an
//! epoch-partitioned log-structured store.
//!
//! Writes append to the live epoch's log (CRC-32C framed, fsynced) and
//! land in an in-memory index; a background merger promotes the index
//! into immutable sorted page files once it crosses a watermark. Point
//! lookups, ranged cursors, and single- or multi-statement transactions
//! are supported; recovery replays the epoch logs left on disk.
//!
//! # Examples
//!
//! ```no_run
//! use tempfile::tempdir;
//! use epochdb::{Config, Database, Order, Result};
//!
//! # fn main() -> Result<()> {
//!     let dir = tempdir()?;
//!     let db = Database::open(Config::new(dir.path()))?;
//!
//!     db.set(b"foo", b"bar")?;
//!     assert_eq!(db.get(b"foo")?, Some(b"bar".to_vec()));
//!
//!     db.begin()?;
//!     db.set(b"a", b"1")?;
//!     db.set(b"b", b"2")?;
//!     db.commit()?;
//!
//!     let mut cursor = db.cursor(Order::Gte, Some(b"a".as_slice()))?;
//!     while cursor.fetch() {
//!         println!("{:?} = {:?}", cursor.key(), cursor.value());
//!     }
//!     # drop(cursor);
//!     # Ok(())
//! # }
//! ```

mod catalog;
mod config;
mod cursor;
mod dbfile;
mod engine;
mod error;
mod format;
mod index;
mod merge;
mod recovery;
mod refset;
mod repository;
mod task;
mod version;
mod wal;

pub use config::{Comparator, Config};
pub use cursor::{Cursor, Order};
pub use engine::{Database, Stat};
pub use error::{Error, Result};

/// On-disk format version, also stamped into every log and db file
/// header.
pub fn version() -> (u32, u32) {
    (format::VERSION_MAJOR as u32, format::VERSION_MINOR as u32)
}
