//! Simulated main memory.
//!
//! Main memory is one flat byte buffer divided into page-sized frames. Frame
//! `n` occupies bytes `n * page_size .. (n + 1) * page_size`.

use alloc::{vec, vec::Vec};

use crate::{FrameNumber, PhysicalAddress};

/// The simulated machine's physical memory.
pub struct MainMemory {
    /// The underlying memory buffer.
    bytes: Vec<u8>,
    page_size: usize,
}

impl MainMemory {
    /// Creates a zeroed main memory of `num_frames` frames.
    ///
    /// # Panics
    ///
    /// Panics if `page_size` is not a power of two.
    pub fn new(num_frames: usize, page_size: usize) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        Self {
            bytes: vec![0u8; num_frames * page_size],
            page_size,
        }
    }

    /// Returns the size of a frame in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Returns the size of main memory in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Returns the number of frames in main memory.
    pub fn num_frames(&self) -> usize {
        self.bytes.len() / self.page_size
    }

    /// Returns the bytes of a frame.
    ///
    /// # Panics
    ///
    /// Panics if the frame is beyond the end of main memory.
    pub fn frame(&self, frame: FrameNumber) -> &[u8] {
        let start = self.frame_start(frame);
        &self.bytes[start..start + self.page_size]
    }

    /// Returns the bytes of a frame for writing.
    ///
    /// # Panics
    ///
    /// Panics if the frame is beyond the end of main memory.
    pub fn frame_mut(&mut self, frame: FrameNumber) -> &mut [u8] {
        let start = self.frame_start(frame);
        &mut self.bytes[start..start + self.page_size]
    }

    /// Fills a frame with zeroes.
    pub fn zero_frame(&mut self, frame: FrameNumber) {
        self.frame_mut(frame).fill(0);
    }

    /// Copies the full contents of `src` into `dst`.
    pub fn copy_frame(&mut self, src: FrameNumber, dst: FrameNumber) {
        let from = self.frame_start(src);
        let to = self.frame_start(dst);
        self.bytes.copy_within(from..from + self.page_size, to);
    }

    /// Reads `buf.len()` bytes starting at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of main memory.
    pub fn read(&self, addr: PhysicalAddress, buf: &mut [u8]) {
        let start = addr.as_usize();
        buf.copy_from_slice(&self.bytes[start..start + buf.len()]);
    }

    /// Writes `data` starting at `addr`.
    ///
    /// # Panics
    ///
    /// Panics if the range extends past the end of main memory.
    pub fn write(&mut self, addr: PhysicalAddress, data: &[u8]) {
        let start = addr.as_usize();
        self.bytes[start..start + data.len()].copy_from_slice(data);
    }

    fn frame_start(&self, frame: FrameNumber) -> usize {
        let start = frame.start(self.page_size).as_usize();
        assert!(start < self.bytes.len(), "frame {frame} out of bounds");
        start
    }
}
