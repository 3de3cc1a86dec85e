//! Building NOFF executables in memory.

use std::sync::Arc;

use uvm::{HEADER_SIZE, NoffHeader, ProgramImage, Segment};

use crate::KernelError;

/// Lays out a NOFF executable: code at address 0, initialized data right
/// after it, then uninitialized data. File contents follow the header in the
/// same order.
#[derive(Debug, Clone, Default)]
pub struct ImageBuilder {
    code: Vec<u8>,
    data: Vec<u8>,
    bss: usize,
    big_endian: bool,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn code(mut self, code: impl Into<Vec<u8>>) -> Self {
        self.code = code.into();
        self
    }

    pub fn data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = data.into();
        self
    }

    pub fn bss(mut self, size: usize) -> Self {
        self.bss = size;
        self
    }

    /// Writes the header in big-endian byte order.
    pub fn big_endian(mut self, big_endian: bool) -> Self {
        self.big_endian = big_endian;
        self
    }

    /// Returns the virtual address of the initialized data.
    pub fn data_addr(&self) -> usize {
        self.code.len()
    }

    /// Returns the virtual address of the uninitialized data.
    pub fn bss_addr(&self) -> usize {
        self.code.len() + self.data.len()
    }

    pub fn header(&self) -> NoffHeader {
        NoffHeader {
            code: Segment {
                virtual_addr: 0,
                file_offset: HEADER_SIZE,
                size: self.code.len(),
            },
            init_data: Segment {
                virtual_addr: self.data_addr(),
                file_offset: HEADER_SIZE + self.code.len(),
                size: self.data.len(),
            },
            uninit_data: Segment {
                virtual_addr: self.bss_addr(),
                file_offset: 0,
                size: self.bss,
            },
        }
    }

    /// Serializes the executable.
    pub fn build(&self) -> Vec<u8> {
        let mut header = self.header().to_bytes();
        if self.big_endian {
            for word in header.chunks_exact_mut(4) {
                word.reverse();
            }
        }

        let mut file = Vec::with_capacity(HEADER_SIZE + self.code.len() + self.data.len());
        file.extend_from_slice(&header);
        file.extend_from_slice(&self.code);
        file.extend_from_slice(&self.data);
        file
    }

    /// Serializes the executable and loads it.
    pub fn load(&self) -> Result<Arc<ProgramImage>, KernelError> {
        Ok(Arc::new(ProgramImage::load(Box::new(self.build()))?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uvm::NOFF_MAGIC;

    #[test]
    fn segments_are_packed_after_the_header() {
        let builder = ImageBuilder::new().code([1u8; 100]).data([2u8; 8]).bss(64);
        let header = builder.header();

        assert_eq!(header.init_data.virtual_addr, 100);
        assert_eq!(header.init_data.file_offset, HEADER_SIZE + 100);
        assert_eq!(header.uninit_data.virtual_addr, 108);
        assert_eq!(builder.build().len(), HEADER_SIZE + 108);
    }

    #[test]
    fn both_byte_orders_load_to_the_same_header() {
        let builder = ImageBuilder::new().code([1u8; 12]).data([2u8; 4]).bss(4);
        let little = builder.load().unwrap();
        let big = builder.clone().big_endian(true).load().unwrap();

        assert_eq!(&builder.build()[..4], &NOFF_MAGIC.to_le_bytes());
        assert_eq!(little.header(), big.header());
    }
}
