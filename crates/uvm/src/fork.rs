//! Address space duplication for fork.

use alloc::sync::Arc;
use alloc::vec::Vec;

use physmem::FrameNumber;

use crate::{AddressSpace, PageTable, Pid, PteHandle, SpaceId, VirtualMemory, VmError};

impl VirtualMemory {
    /// Builds the address space of a child forked from `parent`.
    ///
    /// Page by page:
    /// - shared pages alias the parent's frame, which gains a sharer;
    /// - resident private pages are copied into a fresh frame;
    /// - pages not yet faulted in stay invalid and fault on their own later.
    ///
    /// Frames for the private copies are reserved up front, so exhaustion
    /// fails the fork before anything changes. The child's table is a
    /// snapshot: regions the parent adds afterwards are not visible to it.
    pub fn duplicate(&mut self, parent: SpaceId, child_pid: Pid) -> Result<SpaceId, VmError> {
        let source = self
            .spaces
            .get(&parent)
            .ok_or(VmError::NoSuchAddressSpace(parent))?;

        let private = source
            .page_table()
            .iter()
            .filter(|entry| entry.is_valid() && !entry.is_shared())
            .count();
        let fresh = self.frames.allocate_many(private).inspect_err(|_| {
            log::warn!("{parent}: fork needs {private} frames");
        })?;

        let mut targets = fresh.iter().copied();
        let mut retained = Vec::new();
        let mut entries = Vec::with_capacity(source.num_pages());
        let mut copied = 0;
        let mut failure = None;
        for entry in source.page_table().iter() {
            let mut copy = entry.fork_for(child_pid);
            match entry.frame() {
                Some(frame) if entry.is_shared() => match self.frames.retain(frame) {
                    Ok(_) => retained.push(frame),
                    Err(err) => {
                        failure = Some(VmError::from(err));
                        break;
                    }
                },
                Some(frame) => {
                    let Some(target) = targets.next() else {
                        failure = Some(VmError::ResourceExhausted);
                        break;
                    };
                    self.memory.copy_frame(frame, target);
                    copy.install(target);
                    copied += 1;
                }
                None => {}
            }
            entries.push(copy);
        }

        let num_pages = source.num_pages();
        let shared_pages = source.shared_page_count();
        let image = Arc::clone(source.image());

        if let Some(err) = failure {
            log::error!("{parent}: fork abandoned: {err}");
            self.abandon_fork(&fresh, &retained);
            return Err(err);
        }
        let aliased = retained.len();

        let id = self.next_id();
        let mut child = AddressSpace::new(id, child_pid, PageTable::from_entries(entries), image);
        child.set_counts(shared_pages, aliased + copied);

        for entry in child.page_table().iter() {
            if let (Some(frame), false) = (entry.frame(), entry.is_shared()) {
                self.rmap.set(
                    frame,
                    PteHandle {
                        space: id,
                        page: entry.virtual_page(),
                    },
                );
            }
        }
        self.spaces.insert(id, child);
        self.stats.forks += 1;

        log::debug!(
            "{parent}: forked {id} for pid {child_pid}: {aliased} shared, {copied} copied, {} left to fault",
            num_pages - aliased - copied
        );
        Ok(id)
    }

    /// Gives back what a failed fork took: the reserved copy frames and one
    /// sharer from every shared frame it had already aliased.
    fn abandon_fork(&mut self, fresh: &[FrameNumber], retained: &[FrameNumber]) {
        for &frame in retained {
            if let Err(err) = self.frames.unshare(frame) {
                log::error!("cannot drop fork sharer of frame {frame}: {err}");
            }
        }
        for &frame in fresh {
            if let Err(err) = self.frames.release(frame) {
                log::error!("cannot release fork frame {frame}: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{image, pattern, vm};
    use crate::{Fault, Invariant};
    use physmem::{AllocError, PageNumber, VirtualAddress};

    /// A parent with code resident on page 0, an untouched page 1, and a
    /// one-page shared region.
    fn parent(vm: &mut VirtualMemory) -> (SpaceId, VirtualAddress) {
        let id = vm
            .create_address_space(Pid::new(1), image(&pattern(200, 3), &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        let shared = vm.allocate_shared(id, 4).unwrap();
        (id, shared)
    }

    #[test]
    fn shared_pages_alias_and_private_pages_copy() {
        let mut vm = vm(128, 16);
        let (parent, shared) = parent(&mut vm);
        vm.write_memory(parent, VirtualAddress::new(8), 4, 0xdead).unwrap();

        let child = vm.duplicate(parent, Pid::new(2)).unwrap();

        let p = vm.space(parent).unwrap();
        let c = vm.space(child).unwrap();
        assert_eq!(c.num_pages(), p.num_pages());
        assert_eq!(c.pid(), Pid::new(2));
        assert_eq!(p.frame_for(shared, 128), c.frame_for(shared, 128));
        assert_ne!(
            p.frame_for(VirtualAddress::new(0), 128),
            c.frame_for(VirtualAddress::new(0), 128)
        );

        // Shared writes are visible both ways.
        vm.write_memory(child, shared, 4, 10).unwrap();
        assert_eq!(vm.read_memory(parent, shared, 4), Ok(10));
        vm.write_memory(parent, shared, 4, 11).unwrap();
        assert_eq!(vm.read_memory(child, shared, 4), Ok(11));

        // Private pages start equal and then diverge.
        assert_eq!(vm.read_memory(child, VirtualAddress::new(8), 4), Ok(0xdead));
        vm.write_memory(child, VirtualAddress::new(8), 4, 12178).unwrap();
        assert_eq!(vm.read_memory(parent, VirtualAddress::new(8), 4), Ok(0xdead));

        assert!(vm.verify().is_ok());
    }

    #[test]
    fn untouched_pages_fault_independently() {
        let mut vm = vm(128, 16);
        let (parent, _) = parent(&mut vm);
        let child = vm.duplicate(parent, Pid::new(2)).unwrap();

        let page_one = VirtualAddress::new(130);
        assert_eq!(
            vm.read_memory(child, page_one, 1),
            Err(VmError::Fault(Fault::PageFault(page_one)))
        );
        vm.handle_page_fault(child, page_one).unwrap();

        let code = pattern(200, 3);
        assert_eq!(vm.read_memory(child, page_one, 1), Ok(code[130] as u32));
        assert!(vm.space(parent).unwrap().frame_for(page_one, 128).is_none());
        assert!(vm.verify().is_ok());
    }

    #[test]
    fn flags_follow_the_parent_except_owner_and_cached() {
        let mut vm = vm(128, 16);
        let (parent, _) = parent(&mut vm);
        vm.write_memory(parent, VirtualAddress::new(0), 1, 1).unwrap();
        vm.spaces
            .get_mut(&parent)
            .unwrap()
            .page_table_mut()
            .entry_mut(PageNumber::new(0))
            .unwrap()
            .flags_mut()
            .set_cached(true);

        let child = vm.duplicate(parent, Pid::new(5)).unwrap();
        let before = vm.space(parent).unwrap().entry_for(PageNumber::new(0)).unwrap();
        let after = vm.space(child).unwrap().entry_for(PageNumber::new(0)).unwrap();

        assert!(after.flags().is_dirty());
        assert!(after.flags().is_used());
        assert_eq!(after.flags().is_read_only(), before.flags().is_read_only());
        assert!(!after.flags().is_cached());
        assert!(after.is_valid());
        assert!(owned_by(&vm, child, Pid::new(5)));
    }

    fn owned_by(vm: &VirtualMemory, id: SpaceId, pid: Pid) -> bool {
        vm.space(id)
            .unwrap()
            .page_table()
            .iter()
            .all(|entry| entry.owner() == pid)
    }

    #[test]
    fn counts_and_reverse_map_for_the_child() {
        let mut vm = vm(128, 16);
        let (parent, shared) = parent(&mut vm);
        let child = vm.duplicate(parent, Pid::new(2)).unwrap();

        let c = vm.space(child).unwrap();
        assert_eq!(c.shared_page_count(), 1);
        assert_eq!(c.valid_page_count(), 2);

        let copy = c.frame_for(VirtualAddress::new(0), 128).unwrap();
        assert_eq!(vm.reverse_map().owner(copy).map(|h| h.space), Some(child));
        let alias = c.frame_for(shared, 128).unwrap();
        assert_eq!(vm.frames().frame(alias).map(|f| f.sharers()), Some(2));
        assert_eq!(vm.stats().forks, 1);
    }

    #[test]
    fn later_parent_regions_stay_invisible_to_the_child() {
        let mut vm = vm(128, 16);
        let (parent, _) = parent(&mut vm);
        let child = vm.duplicate(parent, Pid::new(2)).unwrap();

        let late = vm.allocate_shared(parent, 4).unwrap();
        assert_eq!(
            vm.read_memory(child, late, 4),
            Err(VmError::Fault(Fault::AddressError(late)))
        );
        assert_eq!(
            vm.space(child).unwrap().num_pages() + 1,
            vm.space(parent).unwrap().num_pages()
        );
    }

    #[test]
    fn exhaustion_leaves_everything_unchanged() {
        let mut vm = vm(128, 3);
        let id = vm
            .create_address_space(Pid::new(1), image(&[1; 200], &[], 0))
            .unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(0)).unwrap();
        vm.handle_page_fault(id, VirtualAddress::new(128)).unwrap();

        assert_eq!(vm.duplicate(id, Pid::new(2)), Err(VmError::ResourceExhausted));
        assert_eq!(vm.frames().allocated_frames(), 2);
        assert_eq!(vm.spaces().count(), 1);
        assert!(vm.verify().is_ok());
    }

    #[test]
    fn shared_frames_outlive_the_parent() {
        let mut vm = vm(128, 16);
        let (parent, shared) = parent(&mut vm);
        vm.write_memory(parent, shared, 4, 77).unwrap();
        let child = vm.duplicate(parent, Pid::new(2)).unwrap();
        let frame = vm.space(child).unwrap().frame_for(shared, 128).unwrap();

        vm.destroy(parent).unwrap();
        assert!(vm.frames().is_allocated(frame));
        assert_eq!(vm.read_memory(child, shared, 4), Ok(77));
        assert_eq!(vm.reverse_map().owner(frame).map(|h| h.space), Some(child));
        assert!(vm.verify().is_ok());

        vm.destroy(child).unwrap();
        assert_eq!(vm.frames().allocated_frames(), 0);
        assert_eq!(vm.reverse_map().occupied(), 0);
    }

    #[test]
    fn failed_fork_gives_back_frames_and_sharers() {
        let mut vm = vm(128, 16);
        let (parent, first) = parent(&mut vm);
        let second = vm.allocate_shared(parent, 4).unwrap();
        let kept = vm.space(parent).unwrap().frame_for(first, 128).unwrap();
        let lost = vm.space(parent).unwrap().frame_for(second, 128).unwrap();

        // Drop the second region's frame behind the page table's back, so the
        // fork reserves it as a copy target and then fails to alias it.
        assert_eq!(vm.frames.unshare(lost), Ok(true));
        assert_eq!(vm.frames().allocated_frames(), 2);

        assert_eq!(
            vm.duplicate(parent, Pid::new(2)),
            Err(VmError::InvariantViolation(Invariant::Frame(
                AllocError::NotShared(lost)
            )))
        );
        assert_eq!(vm.frames().allocated_frames(), 2);
        assert!(!vm.frames().is_allocated(lost));
        assert_eq!(vm.frames().frame(kept).map(|f| f.sharers()), Some(1));
        assert_eq!(vm.spaces().count(), 1);
        assert_eq!(vm.stats().forks, 0);
    }
}
