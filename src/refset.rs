/// Location of one byte run inside a [`RefSet`].
#[derive(Debug, Clone, Copy)]
pub struct RefSlot {
    page: usize,
    off: usize,
    len: usize,
}

/// Page-chunked byte arena a cursor materializes keys and values into.
///
/// Entries larger than the page size get a dedicated page; everything
/// else is packed. Slots address pages by index, so they stay valid for
/// the life of the refset.
pub struct RefSet {
    page_size: usize,
    pages: Vec<Vec<u8>>,
}

impl RefSet {
    pub fn new(page_size: usize) -> RefSet {
        RefSet {
            page_size: page_size.max(2),
            pages: Vec::new(),
        }
    }

    pub fn push(&mut self, data: &[u8]) -> RefSlot {
        if data.len() >= self.page_size {
            self.pages.push(data.to_vec());
            return RefSlot {
                page: self.pages.len() - 1,
                off: 0,
                len: data.len(),
            };
        }
        let fits = self
            .pages
            .last()
            .map(|p| p.len() + data.len() <= self.page_size)
            .unwrap_or(false);
        if !fits {
            self.pages.push(Vec::with_capacity(self.page_size));
        }
        let page = self.pages.last_mut().unwrap();
        let off = page.len();
        page.extend_from_slice(data);
        RefSlot {
            page: self.pages.len() - 1,
            off,
            len: data.len(),
        }
    }

    pub fn get(&self, slot: RefSlot) -> &[u8] {
        &self.pages[slot.page][slot.off..slot.off + slot.len]
    }

    #[cfg(test)]
    fn page_count(&self) -> usize {
        self.pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_small_entries_into_one_page() {
        let mut refs = RefSet::new(64);
        let a = refs.push(b"aaaa");
        let b = refs.push(b"bb");
        assert_eq!(refs.get(a), b"aaaa");
        assert_eq!(refs.get(b), b"bb");
        assert_eq!(refs.page_count(), 1);
    }

    #[test]
    fn oversized_entry_gets_a_dedicated_page() {
        let mut refs = RefSet::new(8);
        let small = refs.push(b"ab");
        let big = refs.push(&[9u8; 100]);
        let after = refs.push(b"cd");
        assert_eq!(refs.get(small), b"ab");
        assert_eq!(refs.get(big).len(), 100);
        assert_eq!(refs.get(after), b"cd");
        assert_eq!(refs.page_count(), 3);
    }

    #[test]
    fn spills_to_a_new_page_when_full() {
        let mut refs = RefSet::new(8);
        let slots: Vec<_> = (0..8).map(|n| refs.push(&[n as u8; 3])).collect();
        for (n, slot) in slots.iter().enumerate() {
            assert_eq!(refs.get(*slot), &[n as u8; 3]);
        }
        assert!(refs.page_count() > 1);
    }
}
