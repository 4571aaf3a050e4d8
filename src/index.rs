use std::cmp::Ordering;

use crate::config::Comparator;
use crate::version::Version;

/// Page capacity of the in-memory key index
pub const INDEX_PAGE_CAP: usize = 1024;

/// Ordered key -> latest [`Version`] mapping, chunked into fixed-capacity
/// pages so bulk operations (drain, split, page count) stay cheap.
///
/// `set` is last-writer-wins: an equal key replaces in place and the
/// displaced version is returned to the caller.
pub struct KeyIndex {
    pages: Vec<Vec<Version>>,
    page_cap: usize,
    count: usize,
    cmp: Comparator,
}

impl KeyIndex {
    pub fn new(page_cap: usize, cmp: Comparator) -> KeyIndex {
        KeyIndex {
            pages: Vec::new(),
            page_cap,
            count: 0,
            cmp,
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Index of the page whose key range should contain `key`.
    fn locate_page(&self, key: &[u8]) -> usize {
        debug_assert!(!self.pages.is_empty());
        let cmp = &self.cmp;
        let idx = self
            .pages
            .partition_point(|page| match page.last() {
                Some(last) => cmp.cmp(&last.key, key) == Ordering::Less,
                None => false,
            });
        idx.min(self.pages.len() - 1)
    }

    /// Inserts `v`, returning the displaced version for an equal key.
    pub fn set(&mut self, v: Version) -> Option<Version> {
        if self.pages.is_empty() {
            self.pages.push(Vec::with_capacity(self.page_cap / 8));
        }
        let p = self.locate_page(&v.key);
        let cmp = self.cmp.clone();
        let page = &mut self.pages[p];
        match page.binary_search_by(|e| cmp.cmp(&e.key, &v.key)) {
            Ok(i) => Some(std::mem::replace(&mut page[i], v)),
            Err(i) => {
                page.insert(i, v);
                self.count += 1;
                if page.len() > self.page_cap {
                    let right = page.split_off(page.len() / 2);
                    self.pages.insert(p + 1, right);
                }
                None
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Version> {
        if self.pages.is_empty() {
            return None;
        }
        let page = &self.pages[self.locate_page(key)];
        page.binary_search_by(|e| self.cmp.cmp(&e.key, key))
            .ok()
            .map(|i| &page[i])
    }

    /// Drops every page together with the versions it owns.
    pub fn truncate(&mut self) {
        self.pages.clear();
        self.count = 0;
    }

    /// Drains the index in key order, handing every version to the caller
    /// and leaving the index empty.
    pub fn take_sorted(&mut self) -> Vec<Version> {
        self.count = 0;
        std::mem::take(&mut self.pages).into_iter().flatten().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Version> {
        self.pages.iter().flatten()
    }
}
