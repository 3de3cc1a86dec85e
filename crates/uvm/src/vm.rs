//! The virtual-memory subsystem as a whole.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use physmem::{FrameAllocator, FrameNumber, MainMemory, PageNumber, PhysicalAddress, VirtualAddress};

use crate::{
    AddressSpace, ConfigError, Fault, HeaderError, Invariant, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG,
    PageTable, Pid, ProgramImage, PteHandle, RegisterFile, ReverseMap, STACK_REG, SpaceId,
    VmConfig, VmError,
};

/// Counters describing the subsystem's activity and occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VmStats {
    /// Page faults serviced by loading a page.
    pub page_faults: u64,
    /// Shared regions created.
    pub shared_regions: u64,
    /// Address spaces created by fork.
    pub forks: u64,
    pub frames_total: usize,
    pub frames_allocated: usize,
    pub frames_shared: usize,
    pub address_spaces: usize,
}

/// Owns physical memory and every live address space.
///
/// The kernel keeps a single instance behind one lock; holding that lock is
/// the critical section for frame allocation and release, and makes a fork
/// atomic with respect to faults in the parent.
pub struct VirtualMemory {
    pub(crate) config: VmConfig,
    pub(crate) frames: FrameAllocator,
    pub(crate) memory: MainMemory,
    pub(crate) rmap: ReverseMap,
    pub(crate) spaces: BTreeMap<SpaceId, AddressSpace>,
    pub(crate) next_space_id: u32,
    pub(crate) active: Option<SpaceId>,
    pub(crate) stats: VmStats,
}

impl VirtualMemory {
    /// Creates the subsystem with all of main memory free.
    pub fn new(config: VmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        log::info!(
            "main memory: {} frames of {} bytes",
            config.num_frames,
            config.page_size
        );
        Ok(Self {
            config,
            frames: FrameAllocator::new(config.num_frames),
            memory: MainMemory::new(config.num_frames, config.page_size),
            rmap: ReverseMap::new(config.num_frames),
            spaces: BTreeMap::new(),
            next_space_id: 0,
            active: None,
            stats: VmStats::default(),
        })
    }

    /// Returns the machine configuration.
    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Returns the page size in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Returns the address space named by `id`.
    pub fn space(&self, id: SpaceId) -> Option<&AddressSpace> {
        self.spaces.get(&id)
    }

    /// Iterates over all live address spaces.
    pub fn spaces(&self) -> impl Iterator<Item = &AddressSpace> {
        self.spaces.values()
    }

    /// Returns the frame allocator.
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Returns main memory.
    pub fn memory(&self) -> &MainMemory {
        &self.memory
    }

    /// Returns the reverse map.
    pub fn reverse_map(&self) -> &ReverseMap {
        &self.rmap
    }

    /// Returns a snapshot of the subsystem's counters.
    pub fn stats(&self) -> VmStats {
        VmStats {
            frames_total: self.frames.total_frames(),
            frames_allocated: self.frames.allocated_frames(),
            frames_shared: self.frames.shared_frames(),
            address_spaces: self.spaces.len(),
            ..self.stats
        }
    }

    /// Creates an empty, demand-paged address space for `pid`.
    ///
    /// The space is sized to hold every segment plus the user stack. No frame
    /// is reserved and no byte is loaded until the first fault on each page.
    pub fn create_address_space(
        &mut self,
        pid: Pid,
        image: Arc<ProgramImage>,
    ) -> Result<SpaceId, VmError> {
        let page_size = self.config.page_size;
        let header = image.header();
        let size = header
            .image_size()?
            .checked_add(self.config.user_stack_size)
            .ok_or(HeaderError::TooLarge)?;
        let num_pages = size.div_ceil(page_size);
        let space_size = num_pages * page_size;

        if space_size > i32::MAX as usize {
            return Err(HeaderError::TooLarge.into());
        }
        if header
            .loadable_segments()
            .any(|segment| segment.end() > space_size)
        {
            return Err(HeaderError::SegmentOutOfRange.into());
        }

        let id = self.next_id();
        let space = AddressSpace::new(id, pid, PageTable::new(num_pages, pid), image);
        self.spaces.insert(id, space);

        log::debug!("{id}: address space for pid {pid}, {num_pages} pages, {space_size} bytes");
        Ok(id)
    }

    /// Tears down an address space.
    ///
    /// Private frames go back to the allocator. Shared frames lose one sharer
    /// and are released only if this space was the last one mapping them.
    ///
    /// Every frame is handed back even if the allocator rejects one of them;
    /// the first rejection is returned once the space is gone.
    pub fn destroy(&mut self, id: SpaceId) -> Result<(), VmError> {
        let space = self
            .spaces
            .get(&id)
            .ok_or(VmError::NoSuchAddressSpace(id))?;

        let mut first_error = None;
        let mut orphaned = Vec::new();
        let mut released = 0;
        let mut still_shared = 0;
        for entry in space.page_table().iter() {
            let Some(frame) = entry.frame() else {
                continue;
            };

            let outcome = if entry.is_shared() {
                self.frames.unshare(frame)
            } else {
                self.frames.release(frame).map(|()| true)
            };
            match outcome {
                Ok(true) => {
                    self.rmap.clear(frame);
                    released += 1;
                }
                Ok(false) => {
                    still_shared += 1;
                    if self.rmap.is_owned_by(frame, id) {
                        orphaned.push(frame);
                    }
                }
                Err(err) => {
                    log::error!("{id}: cannot give back frame {frame}: {err}");
                    if self.rmap.is_owned_by(frame, id) {
                        self.rmap.clear(frame);
                    }
                    first_error.get_or_insert(VmError::from(err));
                }
            }
        }

        self.spaces.remove(&id);
        if self.active == Some(id) {
            self.active = None;
        }
        for frame in orphaned {
            self.repoint_shared(frame);
        }

        log::debug!(
            "{id}: destroyed, {released} frames released, {still_shared} shared frames kept"
        );
        first_error.map_or(Ok(()), Err)
    }

    /// Seeds a register file for a process about to start in `id`.
    pub fn init_registers<R>(&self, id: SpaceId, regs: &mut R) -> Result<(), VmError>
    where
        R: RegisterFile + ?Sized,
    {
        let space = self.space(id).ok_or(VmError::NoSuchAddressSpace(id))?;

        for index in 0..NUM_TOTAL_REGS {
            regs.write_register(index, 0);
        }
        regs.write_register(PC_REG, 0);
        regs.write_register(NEXT_PC_REG, self.config.instruction_width as i32);

        // Leave a little room so the first push cannot run off the end.
        let stack = space.size(self.config.page_size) - self.config.stack_slack;
        regs.write_register(STACK_REG, stack as i32);
        log::debug!("{id}: initializing stack register to {stack:#x}");
        Ok(())
    }

    /// Makes `id` the address space the CPU translates through.
    pub fn activate(&mut self, id: SpaceId) -> Result<(), VmError> {
        if !self.spaces.contains_key(&id) {
            return Err(VmError::NoSuchAddressSpace(id));
        }
        self.active = Some(id);
        Ok(())
    }

    /// Returns the address space the CPU translates through.
    pub fn active(&self) -> Option<SpaceId> {
        self.active
    }

    /// Translates a user address for an access of `size` bytes.
    ///
    /// Sets the page's use bit, and its dirty bit when `writing`. Returns
    /// [`VmError::Fault`] when the CPU would raise an exception instead.
    pub fn translate(
        &mut self,
        id: SpaceId,
        addr: VirtualAddress,
        size: usize,
        writing: bool,
    ) -> Result<PhysicalAddress, VmError> {
        let page_size = self.config.page_size;
        let space = self
            .spaces
            .get_mut(&id)
            .ok_or(VmError::NoSuchAddressSpace(id))?;

        if !matches!(size, 1 | 2 | 4) || !addr.is_aligned(size) {
            return Err(Fault::BusError(addr).into());
        }

        let page = PageNumber::containing(addr, page_size);
        let entry = space
            .page_table_mut()
            .entry_mut(page)
            .ok_or(Fault::AddressError(addr))?;
        let frame = entry.frame().ok_or(Fault::PageFault(addr))?;
        if writing && entry.flags().is_read_only() {
            return Err(Fault::ReadOnly(addr).into());
        }

        entry.flags_mut().set_used(true);
        if writing {
            entry.flags_mut().set_dirty(true);
        }
        Ok(frame.start(page_size) + addr.page_offset(page_size))
    }

    /// Reads a little-endian value of 1, 2 or 4 bytes from user memory.
    pub fn read_memory(
        &mut self,
        id: SpaceId,
        addr: VirtualAddress,
        size: usize,
    ) -> Result<u32, VmError> {
        let phys = self.translate(id, addr, size, false)?;
        let mut bytes = [0u8; 4];
        self.memory.read(phys, &mut bytes[..size]);
        Ok(u32::from_le_bytes(bytes))
    }

    /// Writes the low `size` bytes of `value` to user memory, little-endian.
    pub fn write_memory(
        &mut self,
        id: SpaceId,
        addr: VirtualAddress,
        size: usize,
        value: u32,
    ) -> Result<(), VmError> {
        let phys = self.translate(id, addr, size, true)?;
        self.memory.write(phys, &value.to_le_bytes()[..size]);
        Ok(())
    }

    /// Returns the physical address behind `addr` without touching any flag,
    /// or None if the page is not resident.
    pub fn physical_address(&self, id: SpaceId, addr: VirtualAddress) -> Option<PhysicalAddress> {
        let page_size = self.config.page_size;
        let frame = self.space(id)?.frame_for(addr, page_size)?;
        Some(frame.start(page_size) + addr.page_offset(page_size))
    }

    /// Checks frame bookkeeping against every live page table.
    ///
    /// No private frame may be mapped twice, every shared frame's sharer
    /// count must equal the number of spaces mapping it, and a frame is
    /// allocated iff something maps it.
    pub fn verify(&self) -> Result<(), VmError> {
        let mut private: BTreeMap<FrameNumber, PteHandle> = BTreeMap::new();
        let mut shared: BTreeMap<FrameNumber, u32> = BTreeMap::new();

        for space in self.spaces.values() {
            for entry in space.page_table().iter() {
                let Some(frame) = entry.frame() else {
                    continue;
                };
                if !self.frames.is_allocated(frame) {
                    return Err(VmError::InvariantViolation(Invariant::FrameOccupancy(frame)));
                }

                let handle = PteHandle {
                    space: space.id(),
                    page: entry.virtual_page(),
                };
                if entry.is_shared() {
                    *shared.entry(frame).or_default() += 1;
                } else if let Some(first) = private.insert(frame, handle) {
                    return Err(VmError::InvariantViolation(Invariant::FrameAliased {
                        frame,
                        first,
                        second: handle,
                    }));
                }
            }
        }

        for (&frame, &mapped) in &shared {
            let recorded = self.frames.frame(frame).map_or(0, |meta| meta.sharers());
            if private.contains_key(&frame) || recorded != mapped {
                return Err(VmError::InvariantViolation(Invariant::SharerCount {
                    frame,
                    recorded,
                    mapped,
                }));
            }
        }

        if private.len() + shared.len() != self.frames.allocated_frames() {
            let orphan = (0..self.frames.total_frames())
                .map(FrameNumber::new)
                .find(|frame| {
                    self.frames.is_allocated(*frame)
                        && !private.contains_key(frame)
                        && !shared.contains_key(frame)
                })
                .unwrap_or(FrameNumber::new(0));
            return Err(VmError::InvariantViolation(Invariant::FrameOccupancy(orphan)));
        }
        Ok(())
    }

    /// Marks `page` of `id` resident in `frame` and records the back
    /// reference. Used by the fault handler and by fork.
    pub(crate) fn install_frame(
        &mut self,
        id: SpaceId,
        page: PageNumber,
        frame: FrameNumber,
    ) -> Result<(), VmError> {
        let page_size = self.config.page_size;
        let space = self
            .spaces
            .get_mut(&id)
            .ok_or(VmError::NoSuchAddressSpace(id))?;
        if !space.install(page, frame) {
            return Err(VmError::AddressingFault(page.start(page_size)));
        }
        self.rmap.set(frame, PteHandle { space: id, page });
        Ok(())
    }

    pub(crate) fn next_id(&mut self) -> SpaceId {
        let id = SpaceId::new(self.next_space_id);
        self.next_space_id += 1;
        id
    }

    /// Points the reverse map for a shared frame at any surviving sharer.
    fn repoint_shared(&mut self, frame: FrameNumber) {
        let survivor = self.spaces.values().find_map(|space| {
            space
                .page_table()
                .iter()
                .find(|entry| entry.is_shared() && entry.frame() == Some(frame))
                .map(|entry| PteHandle {
                    space: space.id(),
                    page: entry.virtual_page(),
                })
        });

        match survivor {
            Some(handle) => self.rmap.set(frame, handle),
            None => self.rmap.clear(frame),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image, image_with, pattern, vm};
    use crate::{NoffHeader, Registers, Segment, HEADER_SIZE};

    #[test]
    fn spaces_are_sized_to_segments_plus_stack() {
        let mut vm = vm(128, 8);
        // 100 + 30 + 20 + 1024 bytes round up to 10 pages.
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[0; 30], 20))
            .unwrap();

        let space = vm.space(id).unwrap();
        assert_eq!(space.num_pages(), 10);
        assert_eq!(space.valid_page_count(), 0);
        assert!(space.page_table().iter().all(|entry| !entry.is_valid()));
        assert_eq!(vm.frames().allocated_frames(), 0);
    }

    #[test]
    fn empty_program_still_gets_a_stack() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[], &[], 0))
            .unwrap();
        assert_eq!(vm.space(id).unwrap().num_pages(), 8);
    }

    #[test]
    fn segment_past_the_space_is_rejected() {
        let mut vm = vm(128, 8);
        let header = NoffHeader {
            code: Segment {
                virtual_addr: 4096,
                file_offset: HEADER_SIZE,
                size: 16,
            },
            ..NoffHeader::default()
        };

        assert_eq!(
            vm.create_address_space(Pid::new(1), image_with(header, &[0; 16], &[])),
            Err(VmError::MalformedExecutable(HeaderError::SegmentOutOfRange))
        );
        assert_eq!(vm.spaces().count(), 0);
    }

    #[test]
    fn registers_start_at_zero_with_stack_near_the_top() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        let mut regs = Registers::new();
        regs.write_register(7, 99);

        vm.init_registers(id, &mut regs).unwrap();

        assert_eq!(regs.read_register(7), 0);
        assert_eq!(regs.read_register(PC_REG), 0);
        assert_eq!(regs.read_register(NEXT_PC_REG), 4);
        assert_eq!(regs.read_register(STACK_REG), 9 * 128 - 16);
    }

    #[test]
    fn translation_raises_the_right_fault() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        let end = VirtualAddress::new(9 * 128);

        assert_eq!(
            vm.read_memory(id, VirtualAddress::new(2), 4),
            Err(VmError::Fault(Fault::BusError(VirtualAddress::new(2))))
        );
        assert_eq!(
            vm.read_memory(id, VirtualAddress::new(0), 3),
            Err(VmError::Fault(Fault::BusError(VirtualAddress::new(0))))
        );
        assert_eq!(
            vm.read_memory(id, end, 4),
            Err(VmError::Fault(Fault::AddressError(end)))
        );
        assert_eq!(
            vm.read_memory(id, VirtualAddress::new(4), 4),
            Err(VmError::Fault(Fault::PageFault(VirtualAddress::new(4))))
        );

        vm.handle_page_fault(id, VirtualAddress::new(4)).unwrap();
        vm.spaces
            .get_mut(&id)
            .unwrap()
            .page_table_mut()
            .entry_mut(PageNumber::new(0))
            .unwrap()
            .flags_mut()
            .set_read_only(true);
        assert_eq!(
            vm.write_memory(id, VirtualAddress::new(4), 4, 1),
            Err(VmError::Fault(Fault::ReadOnly(VirtualAddress::new(4))))
        );
        assert_eq!(vm.read_memory(id, VirtualAddress::new(4), 4), Ok(0));
    }

    #[test]
    fn accesses_set_use_and_dirty() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&pattern(100, 1), &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        let flags = |vm: &VirtualMemory| {
            vm.space(id)
                .unwrap()
                .entry_for(PageNumber::new(0))
                .unwrap()
                .flags()
        };
        assert!(!flags(&vm).is_used());

        vm.read_memory(id, VirtualAddress::new(0), 1).unwrap();
        assert!(flags(&vm).is_used());
        assert!(!flags(&vm).is_dirty());

        vm.write_memory(id, VirtualAddress::new(6), 2, 0xbeef).unwrap();
        assert!(flags(&vm).is_dirty());
        assert_eq!(vm.read_memory(id, VirtualAddress::new(6), 2), Ok(0xbeef));
        assert_eq!(vm.read_memory(id, VirtualAddress::new(6), 1), Ok(0xef));
    }

    #[test]
    fn physical_address_follows_the_frame() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        assert_eq!(vm.physical_address(id, VirtualAddress::new(130)), None);

        vm.handle_page_fault(id, VirtualAddress::new(130)).unwrap();
        let frame = vm
            .space(id)
            .unwrap()
            .frame_for(VirtualAddress::new(130), 128)
            .unwrap();
        assert_eq!(
            vm.physical_address(id, VirtualAddress::new(130)),
            Some(frame.start(128) + 2)
        );
        assert!(
            !vm.space(id)
                .unwrap()
                .entry_for(PageNumber::new(1))
                .unwrap()
                .flags()
                .is_used()
        );
    }

    #[test]
    fn destroy_releases_frames_and_forgets_the_space() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        vm.allocate_shared(id, 256).unwrap();
        vm.activate(id).unwrap();
        assert_eq!(vm.frames().allocated_frames(), 3);

        vm.destroy(id).unwrap();

        assert_eq!(vm.frames().allocated_frames(), 0);
        assert_eq!(vm.frames().shared_frames(), 0);
        assert_eq!(vm.reverse_map().occupied(), 0);
        assert_eq!(vm.active(), None);
        assert_eq!(vm.destroy(id), Err(VmError::NoSuchAddressSpace(id)));
        assert_eq!(vm.activate(id), Err(VmError::NoSuchAddressSpace(id)));
    }

    #[test]
    fn handles_are_never_reused() {
        let mut vm = vm(128, 8);
        let first = vm
            .create_address_space(Pid::new(1), image(&[0; 10], &[], 0))
            .unwrap();
        vm.destroy(first).unwrap();
        let second = vm
            .create_address_space(Pid::new(1), image(&[0; 10], &[], 0))
            .unwrap();
        assert_ne!(first, second);
        assert!(vm.space(first).is_none());
    }

    #[test]
    fn verify_catches_aliased_private_frames() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        assert!(vm.verify().is_ok());

        let frame = vm.space(id).unwrap().frame_for(VirtualAddress::new(0), 128).unwrap();
        vm.spaces
            .get_mut(&id)
            .unwrap()
            .install(PageNumber::new(1), frame);

        assert!(matches!(
            vm.verify(),
            Err(VmError::InvariantViolation(Invariant::FrameAliased { .. }))
        ));
    }

    #[test]
    fn verify_catches_wrong_sharer_counts() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        let base = vm.allocate_shared(id, 8).unwrap();
        let frame = vm.space(id).unwrap().frame_for(base, 128).unwrap();
        assert!(vm.verify().is_ok());

        vm.frames.retain(frame).unwrap();

        assert_eq!(
            vm.verify(),
            Err(VmError::InvariantViolation(Invariant::SharerCount {
                frame,
                recorded: 2,
                mapped: 1,
            }))
        );
    }

    #[test]
    fn verify_catches_unmapped_frames() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();

        let leaked = vm.frames.allocate().unwrap();

        assert_eq!(
            vm.verify(),
            Err(VmError::InvariantViolation(Invariant::FrameOccupancy(leaked)))
        );
    }

    #[test]
    fn destroy_gives_back_every_frame_despite_errors() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 200], &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(128)).unwrap();
        let first = vm.space(id).unwrap().frame_for(VirtualAddress::new(0), 128).unwrap();
        vm.frames.release(first).unwrap();

        assert_eq!(
            vm.destroy(id),
            Err(VmError::InvariantViolation(Invariant::Frame(
                physmem::AllocError::DoubleFree(first)
            )))
        );
        assert!(vm.space(id).is_none());
        assert_eq!(vm.frames().allocated_frames(), 0);
        assert_eq!(vm.reverse_map().occupied(), 0);
        assert!(vm.verify().is_ok());
    }

    #[test]
    fn stats_reflect_occupancy() {
        let mut vm = vm(128, 8);
        let id = vm
            .create_address_space(Pid::new(1), image(&[0; 100], &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        vm.allocate_shared(id, 1).unwrap();

        let stats = vm.stats();
        assert_eq!(stats.page_faults, 1);
        assert_eq!(stats.shared_regions, 1);
        assert_eq!(stats.frames_total, 8);
        assert_eq!(stats.frames_allocated, 2);
        assert_eq!(stats.frames_shared, 1);
        assert_eq!(stats.address_spaces, 1);
    }
}
