//! Shared memory regions.

use alloc::vec::Vec;

use physmem::VirtualAddress;

use crate::{PteHandle, SpaceId, VirtualMemory, VmError};

impl VirtualMemory {
    /// Grows address space `id` by a shared region of at least `size` bytes.
    ///
    /// The region is `ceil(size / page_size)` freshly zeroed frames appended
    /// after the current last page, all resident and marked shared. Children
    /// forked afterwards alias these frames instead of copying them. Either
    /// every page is granted or the space is left untouched and
    /// [`VmError::ResourceExhausted`] is returned.
    ///
    /// Returns the virtual address of the region's first byte, which is the
    /// size of the space before the call.
    pub fn allocate_shared(&mut self, id: SpaceId, size: usize) -> Result<VirtualAddress, VmError> {
        let page_size = self.config.page_size;
        if !self.spaces.contains_key(&id) {
            return Err(VmError::NoSuchAddressSpace(id));
        }
        let pages = size.div_ceil(page_size);

        let frames: Vec<_> = self.frames.allocate_many(pages).inspect_err(|_| {
            log::warn!("{id}: cannot grant {pages} shared pages");
        })?;
        for &frame in &frames {
            self.memory.zero_frame(frame);
            self.frames.share(frame)?;
        }

        let space = self
            .spaces
            .get_mut(&id)
            .ok_or(VmError::NoSuchAddressSpace(id))?;
        let first = space.append_shared(&frames);
        for (offset, &frame) in frames.iter().enumerate() {
            self.rmap.set(
                frame,
                PteHandle {
                    space: id,
                    page: first + offset,
                },
            );
        }
        if pages > 0 {
            self.stats.shared_regions += 1;
        }

        let base = first.start(page_size);
        log::debug!("{id}: {pages} shared pages for {size} bytes at {base}");
        Ok(base)
    }
}
