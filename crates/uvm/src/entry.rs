//! Page table entries.

use physmem::{FrameNumber, PageNumber};

use crate::{PageFlags, Pid};

/// The mapping record for one virtual page.
///
/// The frame number is only meaningful while the entry is valid; entries
/// reference frames but never own them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableEntry {
    virtual_page: PageNumber,
    frame: FrameNumber,
    flags: PageFlags,
    owner: Pid,
}

impl PageTableEntry {
    /// Creates an invalid entry for `virtual_page` owned by `owner`.
    pub const fn new(virtual_page: PageNumber, owner: Pid) -> Self {
        Self {
            virtual_page,
            frame: FrameNumber::new(0),
            flags: PageFlags::empty(),
            owner,
        }
    }

    /// Returns the virtual page this entry maps.
    pub fn virtual_page(&self) -> PageNumber {
        self.virtual_page
    }

    /// Returns the frame backing this entry.
    ///
    /// Returns None if the entry is not valid.
    pub fn frame(&self) -> Option<FrameNumber> {
        if self.flags.is_valid() {
            Some(self.frame)
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Returns the flags for this entry for modification.
    pub fn flags_mut(&mut self) -> &mut PageFlags {
        &mut self.flags
    }

    /// Returns the process that owns this entry.
    pub fn owner(&self) -> Pid {
        self.owner
    }

    /// Returns whether this entry maps a resident frame.
    pub fn is_valid(&self) -> bool {
        self.flags.is_valid()
    }

    /// Returns whether this entry maps a shared frame.
    pub fn is_shared(&self) -> bool {
        self.flags.is_shared()
    }

    /// Points this entry at `frame` and marks it valid.
    pub(crate) fn install(&mut self, frame: FrameNumber) {
        self.frame = frame;
        self.flags.set_valid(true);
    }

    /// Builds the child's copy of this entry for a fork.
    ///
    /// Every flag is carried over except `cached`, which starts clear; the
    /// entry is owned by `child`. The caller decides which frame the copy
    /// points at.
    pub(crate) fn fork_for(&self, child: Pid) -> Self {
        let mut flags = self.flags;
        flags.set_cached(false);
        Self {
            virtual_page: self.virtual_page,
            frame: self.frame,
            flags,
            owner: child,
        }
    }
}
