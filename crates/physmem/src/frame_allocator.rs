//! Physical frame allocator.
//!
//! Every frame of main memory has a [`Frame`] record whose `Allocated` flag
//! forms the occupancy bitmap. Released frames are queued on a free list and
//! handed out again before any never-used frame, which keeps the set of
//! touched frames compact. When the free list is empty the bitmap is scanned
//! in increasing frame order.
//!
//! Frames backing shared regions carry a sharer count. They are created with
//! [`FrameAllocator::share`], gain a sharer per aliasing address space with
//! [`FrameAllocator::retain`], and go back to the allocator only when
//! [`FrameAllocator::unshare`] drops the last sharer.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};
use core::fmt;

use crate::{Frame, FrameFlag, FrameNumber};

/// Errors that can occur during frame allocation and release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free frame is available.
    OutOfFrames,
    /// The frame number is beyond the end of main memory.
    InvalidFrame(FrameNumber),
    /// The frame was released while already free.
    DoubleFree(FrameNumber),
    /// The frame must be allocated for this operation but is free.
    NotAllocated(FrameNumber),
    /// A shared-frame operation was applied to a private frame.
    NotShared(FrameNumber),
    /// A shared frame was released directly instead of through `unshare`.
    StillShared(FrameNumber),
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "no free physical frames"),
            Self::InvalidFrame(frame) => write!(f, "frame {frame} does not exist"),
            Self::DoubleFree(frame) => write!(f, "frame {frame} released twice"),
            Self::NotAllocated(frame) => write!(f, "frame {frame} is not allocated"),
            Self::NotShared(frame) => write!(f, "frame {frame} is not shared"),
            Self::StillShared(frame) => write!(f, "frame {frame} is still shared"),
        }
    }
}

impl core::error::Error for AllocError {}

/// Tracks which frames of main memory are in use.
pub struct FrameAllocator {
    frames: Box<[Frame]>,
    free_list: VecDeque<FrameNumber>,
    allocated: usize,
}

impl FrameAllocator {
    /// Creates an allocator managing `total_frames` frames, all initially free.
    pub fn new(total_frames: usize) -> Self {
        let frames = (0..total_frames).map(|_| Frame::default()).collect();
        Self {
            frames,
            free_list: VecDeque::new(),
            allocated: 0,
        }
    }

    /// Allocates a single frame.
    ///
    /// A previously released frame is preferred; otherwise the lowest-numbered
    /// free frame is returned. On failure the allocator is left unchanged.
    pub fn allocate(&mut self) -> Result<FrameNumber, AllocError> {
        let frame = match self.free_list.pop_front() {
            Some(frame) => frame,
            None => self.scan_free().ok_or(AllocError::OutOfFrames)?,
        };

        let meta = &mut self.frames[frame.as_usize()];
        debug_assert!(!meta.is_allocated(), "free list held an allocated frame");
        meta.flags.set(FrameFlag::Allocated);
        meta.set_sharers(0);
        self.allocated += 1;

        log::trace!("allocated frame {frame}");
        Ok(frame)
    }

    /// Allocates `count` frames, or none at all.
    pub fn allocate_many(&mut self, count: usize) -> Result<Vec<FrameNumber>, AllocError> {
        if count > self.free_frames() {
            log::warn!(
                "cannot allocate {count} frames, only {} free",
                self.free_frames()
            );
            return Err(AllocError::OutOfFrames);
        }

        (0..count).map(|_| self.allocate()).collect()
    }

    /// Returns a private frame to the allocator.
    pub fn release(&mut self, frame: FrameNumber) -> Result<(), AllocError> {
        let meta = self.frame_mut(frame)?;
        if !meta.is_allocated() {
            log::error!("double release of frame {frame}");
            return Err(AllocError::DoubleFree(frame));
        }
        if meta.is_shared() {
            return Err(AllocError::StillShared(frame));
        }

        meta.flags.clear(FrameFlag::Allocated);
        self.allocated -= 1;
        self.free_list.push_back(frame);

        log::trace!("released frame {frame}");
        Ok(())
    }

    /// Marks an allocated frame as shared, with a single sharer.
    pub fn share(&mut self, frame: FrameNumber) -> Result<(), AllocError> {
        let meta = self.frame_mut(frame)?;
        if !meta.is_allocated() {
            return Err(AllocError::NotAllocated(frame));
        }

        meta.flags.set(FrameFlag::Shared);
        meta.set_sharers(1);
        Ok(())
    }

    /// Adds a sharer to a shared frame, returning the new sharer count.
    pub fn retain(&mut self, frame: FrameNumber) -> Result<u32, AllocError> {
        let meta = self.frame_mut(frame)?;
        if !meta.is_allocated() {
            return Err(AllocError::NotAllocated(frame));
        }
        if !meta.is_shared() {
            return Err(AllocError::NotShared(frame));
        }

        let sharers = meta.sharers() + 1;
        meta.set_sharers(sharers);
        Ok(sharers)
    }

    /// Drops a sharer from a shared frame.
    ///
    /// When the last sharer goes away the frame is released. Returns true if
    /// that happened.
    pub fn unshare(&mut self, frame: FrameNumber) -> Result<bool, AllocError> {
        let meta = self.frame_mut(frame)?;
        if !meta.is_allocated() {
            log::error!("unshare of free frame {frame}");
            return Err(AllocError::DoubleFree(frame));
        }
        if !meta.is_shared() {
            return Err(AllocError::NotShared(frame));
        }

        let sharers = meta.sharers().saturating_sub(1);
        meta.set_sharers(sharers);
        if sharers > 0 {
            return Ok(false);
        }

        meta.flags.clear(FrameFlag::Shared);
        self.release(frame)?;
        Ok(true)
    }

    /// Returns the total number of frames managed by this allocator.
    pub fn total_frames(&self) -> usize {
        self.frames.len()
    }

    /// Returns the number of frames currently handed out.
    pub fn allocated_frames(&self) -> usize {
        self.allocated
    }

    /// Returns the number of frames available for allocation.
    pub fn free_frames(&self) -> usize {
        self.frames.len() - self.allocated
    }

    /// Returns the number of allocated frames that are shared.
    pub fn shared_frames(&self) -> usize {
        self.frames.iter().filter(|f| f.is_shared()).count()
    }

    /// Returns true if the frame is currently allocated.
    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.frame(frame).is_some_and(Frame::is_allocated)
    }

    /// Returns a reference to the metadata for the given frame number.
    pub fn frame(&self, frame: FrameNumber) -> Option<&Frame> {
        self.frames.get(frame.as_usize())
    }

    fn frame_mut(&mut self, frame: FrameNumber) -> Result<&mut Frame, AllocError> {
        self.frames
            .get_mut(frame.as_usize())
            .ok_or(AllocError::InvalidFrame(frame))
    }

    /// Finds the lowest-numbered frame that is neither allocated nor queued.
    fn scan_free(&self) -> Option<FrameNumber> {
        self.frames
            .iter()
            .position(|f| !f.is_allocated())
            .map(FrameNumber::new)
    }
}
