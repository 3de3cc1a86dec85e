//! Flat, single-level page tables.

use alloc::vec::Vec;

use physmem::PageNumber;

use crate::{PageTableEntry, Pid};

/// A page table with one entry per virtual page of the address space.
///
/// Virtual page `n` is described by entry `n`. The table only ever grows, by
/// appending entries past the current last page.
#[derive(Debug, Clone, Default)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    /// Creates a table of `num_pages` invalid entries owned by `owner`.
    pub fn new(num_pages: usize, owner: Pid) -> Self {
        let entries = (0..num_pages)
            .map(|page| PageTableEntry::new(PageNumber::new(page), owner))
            .collect();
        Self { entries }
    }

    pub(crate) fn from_entries(entries: Vec<PageTableEntry>) -> Self {
        Self { entries }
    }

    /// Returns the entry for the given page, if the table covers it.
    pub fn entry(&self, page: PageNumber) -> Option<&PageTableEntry> {
        self.entries.get(page.as_usize())
    }

    /// Returns a mutable reference to the entry for the given page.
    pub fn entry_mut(&mut self, page: PageNumber) -> Option<&mut PageTableEntry> {
        self.entries.get_mut(page.as_usize())
    }

    /// Returns the number of entries in this page table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over the entries in page order.
    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    /// Appends `additional` invalid entries, returning the first new page.
    pub(crate) fn grow(&mut self, additional: usize, owner: Pid) -> PageNumber {
        let first = PageNumber::new(self.entries.len());
        self.entries.extend(
            (0..additional).map(|offset| PageTableEntry::new(first + offset, owner)),
        );
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_indexed_by_page() {
        let table = PageTable::new(4, Pid::new(1));
        assert_eq!(table.len(), 4);
        for (index, entry) in table.iter().enumerate() {
            assert_eq!(entry.virtual_page(), PageNumber::new(index));
            assert!(!entry.is_valid());
        }
        assert!(table.entry(PageNumber::new(4)).is_none());
    }

    #[test]
    fn grow_appends_after_last_page() {
        let mut table = PageTable::new(3, Pid::new(1));
        let first = table.grow(2, Pid::new(1));

        assert_eq!(first, PageNumber::new(3));
        assert_eq!(table.len(), 5);
        assert_eq!(
            table.entry(PageNumber::new(4)).map(PageTableEntry::virtual_page),
            Some(PageNumber::new(4))
        );
    }
}
