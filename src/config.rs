use std::cmp::Ordering;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Default records per db page and refset page size in bytes
pub const DEFAULT_PAGE: u32 = 2048;
/// Default in-memory entry count that wakes the merger
pub const DEFAULT_MERGE_WATERMARK: u64 = 100_000;
/// Default db file preallocation (2 MiB)
pub const DEFAULT_DB_NEW_SIZE: u64 = 2 * 1024 * 1024;
/// Default db file growth ratio
pub const DEFAULT_DB_GROW_FACTOR: f64 = 1.4;
/// Default dead-record fraction at which a retired epoch is folded into a merge
pub const DEFAULT_GC_FACTOR: f64 = 0.5;

/// Total-order key comparator injected through [`Config`].
///
/// The default compares keys lexicographically. A custom comparator must
/// define a total order over all byte strings the database will see.
#[derive(Clone)]
pub struct Comparator(Arc<dyn Fn(&[u8], &[u8]) -> Ordering + Send + Sync>);

impl Comparator {
    pub fn new(f: impl Fn(&[u8], &[u8]) -> Ordering + Send + Sync + 'static) -> Self {
        Comparator(Arc::new(f))
    }

    /// Byte-wise lexicographic order, shorter key first on a shared prefix.
    pub fn lexicographic() -> Self {
        Comparator::new(|a: &[u8], b: &[u8]| a.cmp(b))
    }

    pub fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        (self.0.as_ref())(a, b)
    }
}

impl fmt::Debug for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Comparator(..)")
    }
}

/// Config options for the database engine
#[derive(Debug, Clone)]
pub struct Config {
    /// Storage directory (required)
    pub dir: Option<PathBuf>,
    /// Reject writes, skip rotation and the merger
    pub read_only: bool,
    /// Key comparator; lexicographic when unset
    pub comparator: Option<Comparator>,
    /// Records per db page and refset page size in bytes; must be >= 2 and even
    pub page: u32,
    /// Fold retired db epochs into merges once their dead fraction crosses `gc_factor`
    pub gc: bool,
    /// Dead-record fraction that selects a retired epoch for folding
    pub gc_factor: f64,
    /// Initial db file size in bytes
    pub db_new_size: u64,
    /// db file growth ratio
    pub db_grow_factor: f64,
    /// Run the background merger thread
    pub merge: bool,
    /// In-memory entry count that triggers a merge; must be >= 2
    pub merge_watermark: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: None,
            read_only: false,
            comparator: None,
            page: DEFAULT_PAGE,
            gc: true,
            gc_factor: DEFAULT_GC_FACTOR,
            db_new_size: DEFAULT_DB_NEW_SIZE,
            db_grow_factor: DEFAULT_DB_GROW_FACTOR,
            merge: true,
            merge_watermark: DEFAULT_MERGE_WATERMARK,
        }
    }
}

impl Config {
    /// Shorthand for a default configuration rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.dir.is_none() {
            return Err(Error::Config("directory is not specified"));
        }
        if self.merge_watermark < 2 {
            return Err(Error::Config("bad merge watermark count"));
        }
        if self.page < 2 {
            return Err(Error::Config("bad page size"));
        }
        if self.page % 2 > 0 {
            return Err(Error::Config("bad page size must be even"));
        }
        Ok(())
    }
}
