//! Address space management.
//!
//! An address space is one process's view of memory: a flat page table plus
//! the executable its pages are demand-loaded from.

use alloc::sync::Arc;
use core::fmt;

use physmem::{FrameNumber, PageNumber, VirtualAddress};

use crate::{PageTable, PageTableEntry, ProgramImage};

/// Identifies a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Pid(u32);

impl Pid {
    pub const fn new(pid: u32) -> Self {
        Self(pid)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle naming a live address space inside [`VirtualMemory`](crate::VirtualMemory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(u32);

impl SpaceId {
    pub(crate) const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// A process's address space.
///
/// The page table owns its entries exclusively. Frames are referenced, not
/// owned: private frames are returned to the allocator when the space is
/// destroyed, shared frames only when their last sharer goes away.
#[derive(Debug)]
pub struct AddressSpace {
    id: SpaceId,
    pid: Pid,
    page_table: PageTable,
    image: Arc<ProgramImage>,
    shared_pages: usize,
    valid_pages: usize,
}

impl AddressSpace {
    pub(crate) fn new(id: SpaceId, pid: Pid, page_table: PageTable, image: Arc<ProgramImage>) -> Self {
        Self {
            id,
            pid,
            page_table,
            image,
            shared_pages: 0,
            valid_pages: 0,
        }
    }

    /// Returns this space's handle.
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Returns the process this space belongs to.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Returns the number of virtual pages.
    pub fn num_pages(&self) -> usize {
        self.page_table.len()
    }

    /// Returns the entry describing `page`, or None past the end of the table.
    pub fn entry_for(&self, page: PageNumber) -> Option<&PageTableEntry> {
        self.page_table.entry(page)
    }

    /// Returns the page table.
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Returns the executable this space is loaded from.
    pub fn image(&self) -> &Arc<ProgramImage> {
        &self.image
    }

    /// Returns how many pages belong to shared regions.
    pub fn shared_page_count(&self) -> usize {
        self.shared_pages
    }

    /// Returns how many pages are resident.
    pub fn valid_page_count(&self) -> usize {
        self.valid_pages
    }

    /// Returns the size of the space in bytes.
    pub fn size(&self, page_size: usize) -> usize {
        self.num_pages() * page_size
    }

    /// Returns the frame backing `addr`, if that page is resident.
    pub fn frame_for(&self, addr: VirtualAddress, page_size: usize) -> Option<FrameNumber> {
        self.entry_for(PageNumber::containing(addr, page_size))
            .and_then(PageTableEntry::frame)
    }

    pub(crate) fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }

    pub(crate) fn set_counts(&mut self, shared_pages: usize, valid_pages: usize) {
        self.shared_pages = shared_pages;
        self.valid_pages = valid_pages;
    }

    /// Appends one shared, resident page per frame after the current last
    /// page. Returns the first new page.
    pub(crate) fn append_shared(&mut self, frames: &[FrameNumber]) -> PageNumber {
        let first = self.page_table.grow(frames.len(), self.pid);
        for (page, &frame) in (0..frames.len()).map(|offset| first + offset).zip(frames) {
            if let Some(entry) = self.page_table.entry_mut(page) {
                entry.flags_mut().set_shared(true);
                entry.install(frame);
            }
        }
        self.shared_pages += frames.len();
        self.valid_pages += frames.len();
        first
    }

    /// Marks `page` resident in `frame`. Returns false if the table does not
    /// cover `page`.
    pub(crate) fn install(&mut self, page: PageNumber, frame: FrameNumber) -> bool {
        let Some(entry) = self.page_table.entry_mut(page) else {
            return false;
        };
        if !entry.is_valid() {
            self.valid_pages += 1;
        }
        entry.install(frame);
        true
    }
}
