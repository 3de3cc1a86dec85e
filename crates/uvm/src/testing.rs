//! Helpers for building small programs in tests.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{HEADER_SIZE, NoffHeader, ProgramImage, Segment, VirtualMemory, VmConfig};

/// Builds an executable with `code` at address 0, `data` right after it and
/// `bss` bytes of uninitialized data after that.
pub fn image(code: &[u8], data: &[u8], bss: usize) -> Arc<ProgramImage> {
    let header = NoffHeader {
        code: Segment {
            virtual_addr: 0,
            file_offset: HEADER_SIZE,
            size: code.len(),
        },
        init_data: Segment {
            virtual_addr: code.len(),
            file_offset: HEADER_SIZE + code.len(),
            size: data.len(),
        },
        uninit_data: Segment {
            virtual_addr: code.len() + data.len(),
            file_offset: 0,
            size: bss,
        },
    };
    image_with(header, code, data)
}

/// Builds an executable from an explicit header, storing `code` and `data`
/// at their header file offsets.
pub fn image_with(header: NoffHeader, code: &[u8], data: &[u8]) -> Arc<ProgramImage> {
    let mut file = Vec::from(header.to_bytes());
    for (segment, bytes) in [(header.code, code), (header.init_data, data)] {
        let end = segment.file_offset + bytes.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[segment.file_offset..end].copy_from_slice(bytes);
    }
    Arc::new(ProgramImage::load(Box::new(file)).expect("test image must parse"))
}

/// A byte pattern that never repeats within 251 bytes.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8 ^ seed).collect()
}

pub fn vm(page_size: usize, num_frames: usize) -> VirtualMemory {
    VirtualMemory::new(VmConfig {
        page_size,
        num_frames,
        ..VmConfig::default()
    })
    .expect("test config must be valid")
}
