//! Demand paging.
//!
//! A page is loaded the first time it is touched: a fresh frame is zeroed,
//! then every segment overlapping the page copies in exactly the bytes they
//! share. Pages past the loadable segments (uninitialized data and stack)
//! therefore start out as zeroes.

use alloc::sync::Arc;

use physmem::{PageNumber, VirtualAddress};

use crate::{HeaderError, ProgramImage, SpaceId, VirtualMemory, VmError};

impl VirtualMemory {
    /// Services a page fault at `addr` in address space `id`.
    ///
    /// On success the page is resident and the faulting instruction should be
    /// re-issued without advancing the program counter. A fault on an address
    /// past the end of the page table is an [`VmError::AddressingFault`] and
    /// allocates nothing. A fault on a page that is already resident is a
    /// no-op.
    pub fn handle_page_fault(&mut self, id: SpaceId, addr: VirtualAddress) -> Result<(), VmError> {
        let page_size = self.config.page_size;
        let space = self.space(id).ok_or(VmError::NoSuchAddressSpace(id))?;
        let page = PageNumber::containing(addr, page_size);

        let Some(entry) = space.entry_for(page) else {
            log::warn!(
                "{id}: fault at {addr} is past the last page ({} pages)",
                space.num_pages()
            );
            return Err(VmError::AddressingFault(addr));
        };
        if entry.is_valid() {
            log::debug!("{id}: page {page} is already resident");
            return Ok(());
        }
        let image = Arc::clone(space.image());

        let frame = self.frames.allocate().inspect_err(|_| {
            log::warn!("{id}: no frame left for page {page}");
        })?;

        let bytes = self.memory.frame_mut(frame);
        bytes.fill(0);
        if let Err(err) = load_page(&image, page, page_size, bytes) {
            log::error!("{id}: cannot load page {page}: {err}");
            self.frames.release(frame)?;
            return Err(err.into());
        }

        self.install_frame(id, page, frame)?;
        self.stats.page_faults += 1;
        log::debug!("{id}: page {page} loaded into frame {frame}");
        Ok(())
    }
}

/// Copies the segment bytes that back `page` into the zeroed `frame`.
///
/// Segments are applied in ascending virtual-address order and only their
/// overlap with the page is written, so adjacent segments sharing a page
/// never overwrite each other.
fn load_page(
    image: &ProgramImage,
    page: PageNumber,
    page_size: usize,
    frame: &mut [u8],
) -> Result<(), HeaderError> {
    let page_start = page.start(page_size).as_usize();

    for segment in image.header().loadable_segments() {
        let Some((start, end)) = segment.overlap(page_start, page_size) else {
            continue;
        };
        let file_offset = segment.file_offset + (start - segment.virtual_addr);
        let dest = start - page_start;
        let len = end - start + 1;

        log::debug!(
            "page {page}: {len} bytes from file offset {file_offset:#x} at page offset {dest:#x}"
        );
        image.read_exact_at(&mut frame[dest..dest + len], file_offset)?;
    }
    Ok(())
}
