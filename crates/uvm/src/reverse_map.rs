//! Frame to page-table-entry back references.

use alloc::{vec, vec::Vec};
use core::fmt;

use physmem::{FrameNumber, PageNumber};

use crate::SpaceId;

/// Names one page-table entry: the owning space and the virtual page.
///
/// A handle is resolved through [`VirtualMemory`](crate::VirtualMemory), so it
/// never dangles; a handle to a destroyed space simply fails to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PteHandle {
    pub space: SpaceId,
    pub page: PageNumber,
}

impl fmt::Display for PteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.space, self.page)
    }
}

/// For every frame of main memory, the entry currently occupying it.
///
/// A shared frame is mapped by several entries; the map records one of them,
/// and is re-pointed at a surviving sharer when the recorded space goes away.
#[derive(Debug, Clone)]
pub struct ReverseMap {
    slots: Vec<Option<PteHandle>>,
}

impl ReverseMap {
    pub fn new(num_frames: usize) -> Self {
        Self {
            slots: vec![None; num_frames],
        }
    }

    /// Returns the entry occupying `frame`.
    pub fn owner(&self, frame: FrameNumber) -> Option<PteHandle> {
        self.slots.get(frame.as_usize()).copied().flatten()
    }

    pub(crate) fn set(&mut self, frame: FrameNumber, handle: PteHandle) {
        self.slots[frame.as_usize()] = Some(handle);
    }

    pub(crate) fn clear(&mut self, frame: FrameNumber) {
        self.slots[frame.as_usize()] = None;
    }

    /// Returns true if the slot for `frame` points into `space`.
    pub(crate) fn is_owned_by(&self, frame: FrameNumber, space: SpaceId) -> bool {
        self.owner(frame).is_some_and(|handle| handle.space == space)
    }

    /// Returns the number of occupied slots.
    pub fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_slots() {
        let mut rmap = ReverseMap::new(4);
        let handle = PteHandle {
            space: SpaceId::new(1),
            page: PageNumber::new(2),
        };

        rmap.set(FrameNumber::new(3), handle);
        assert_eq!(rmap.owner(FrameNumber::new(3)), Some(handle));
        assert!(rmap.is_owned_by(FrameNumber::new(3), SpaceId::new(1)));
        assert!(!rmap.is_owned_by(FrameNumber::new(3), SpaceId::new(2)));
        assert_eq!(rmap.occupied(), 1);

        rmap.clear(FrameNumber::new(3));
        assert_eq!(rmap.owner(FrameNumber::new(3)), None);
        assert_eq!(rmap.owner(FrameNumber::new(99)), None);
    }
}
