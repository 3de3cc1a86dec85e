//! Executable images in NOFF format.
//!
//! A NOFF file starts with a fixed header of ten 32-bit words: the magic
//! number, then a `(virtual address, file offset, size)` triple for each of
//! the code, initialized-data and uninitialized-data segments. Words are
//! little-endian on disk; a header whose magic only matches after swapping
//! byte order is swapped as a whole.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;

/// Magic number identifying a NOFF executable.
pub const NOFF_MAGIC: u32 = 0x00ba_dfad;

/// Size in bytes of the NOFF header.
pub const HEADER_SIZE: usize = 40;

/// Random-access byte source an executable is read from.
pub trait Executable: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many
    /// bytes were read. Reading past the end yields a short count.
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;
}

impl Executable for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let Some(available) = self.get(offset..) else {
            return 0;
        };
        let count = buf.len().min(available.len());
        buf[..count].copy_from_slice(&available[..count]);
        count
    }
}

impl Executable for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        self.as_slice().read_at(buf, offset)
    }
}

/// Errors found while reading an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderError {
    /// The file is shorter than the header, or than a segment it describes.
    Truncated,
    /// The magic number is wrong in both byte orders.
    BadMagic(u32),
    /// A size, address or offset is negative.
    NegativeField,
    /// The segment sizes overflow the addressable range.
    TooLarge,
    /// A loadable segment ends past the end of the address space.
    SegmentOutOfRange,
}

impl fmt::Display for HeaderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "file is truncated"),
            Self::BadMagic(magic) => write!(f, "bad magic number {magic:#x}"),
            Self::NegativeField => write!(f, "header contains a negative field"),
            Self::TooLarge => write!(f, "segments are too large"),
            Self::SegmentOutOfRange => write!(f, "segment lies outside the address space"),
        }
    }
}

impl core::error::Error for HeaderError {}

/// One segment of an executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    /// Virtual address of the segment's first byte.
    pub virtual_addr: usize,
    /// Offset of the segment's first byte in the file.
    pub file_offset: usize,
    /// Size of the segment in bytes.
    pub size: usize,
}

impl Segment {
    /// Returns the virtual address one past the segment's last byte.
    pub fn end(&self) -> usize {
        self.virtual_addr + self.size
    }

    /// Returns the inclusive `[start, end]` range of virtual addresses this
    /// segment shares with `[page_start, page_start + page_size)`.
    pub fn overlap(&self, page_start: usize, page_size: usize) -> Option<(usize, usize)> {
        if self.size == 0 {
            return None;
        }
        let start = self.virtual_addr.max(page_start);
        let end = (self.end() - 1).min(page_start + page_size - 1);
        (start <= end).then_some((start, end))
    }
}

/// The parsed NOFF header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NoffHeader {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

impl NoffHeader {
    /// Parses a header from its on-disk bytes.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Result<Self, HeaderError> {
        let mut words = [0u32; HEADER_SIZE / 4];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }

        if words[0] != NOFF_MAGIC {
            if words[0].swap_bytes() != NOFF_MAGIC {
                return Err(HeaderError::BadMagic(words[0]));
            }
            log::debug!("executable header is byte-swapped");
            for word in &mut words {
                *word = word.swap_bytes();
            }
        }

        let segment = |at: usize| -> Result<Segment, HeaderError> {
            let field = |word: u32| {
                usize::try_from(word as i32).map_err(|_| HeaderError::NegativeField)
            };
            Ok(Segment {
                virtual_addr: field(words[at])?,
                file_offset: field(words[at + 1])?,
                size: field(words[at + 2])?,
            })
        };

        Ok(Self {
            code: segment(1)?,
            init_data: segment(4)?,
            uninit_data: segment(7)?,
        })
    }

    /// Reads and parses the header at the start of an executable.
    pub fn read_from(file: &dyn Executable) -> Result<Self, HeaderError> {
        let mut bytes = [0u8; HEADER_SIZE];
        if file.read_at(&mut bytes, 0) != HEADER_SIZE {
            return Err(HeaderError::Truncated);
        }
        Self::parse(&bytes)
    }

    /// Encodes the header in little-endian byte order.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let words = [
            NOFF_MAGIC,
            self.code.virtual_addr as u32,
            self.code.file_offset as u32,
            self.code.size as u32,
            self.init_data.virtual_addr as u32,
            self.init_data.file_offset as u32,
            self.init_data.size as u32,
            self.uninit_data.virtual_addr as u32,
            self.uninit_data.file_offset as u32,
            self.uninit_data.size as u32,
        ];
        let mut bytes = [0u8; HEADER_SIZE];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Returns the total bytes of all three segments.
    pub fn image_size(&self) -> Result<usize, HeaderError> {
        self.code
            .size
            .checked_add(self.init_data.size)
            .and_then(|size| size.checked_add(self.uninit_data.size))
            .ok_or(HeaderError::TooLarge)
    }

    /// Returns the segments whose bytes come from the file, in ascending
    /// order of virtual address. Empty segments are skipped.
    pub fn loadable_segments(&self) -> impl Iterator<Item = &Segment> {
        let (first, second) = if self.init_data.virtual_addr < self.code.virtual_addr {
            (&self.init_data, &self.code)
        } else {
            (&self.code, &self.init_data)
        };
        [first, second].into_iter().filter(|segment| segment.size > 0)
    }
}

/// An executable whose header has been validated, shared read-only between a
/// process and the children it forks.
pub struct ProgramImage {
    header: NoffHeader,
    file: Box<dyn Executable>,
}

impl ProgramImage {
    /// Reads the header of `file` and wraps it as a program image.
    pub fn load(file: Box<dyn Executable>) -> Result<Self, HeaderError> {
        let header = NoffHeader::read_from(file.as_ref())?;
        log::debug!(
            "loaded executable: code {} bytes at {:#x}, data {} bytes at {:#x}, bss {} bytes",
            header.code.size,
            header.code.virtual_addr,
            header.init_data.size,
            header.init_data.virtual_addr,
            header.uninit_data.size,
        );
        Ok(Self { header, file })
    }

    /// Returns the parsed header.
    pub fn header(&self) -> &NoffHeader {
        &self.header
    }

    /// Reads exactly `buf.len()` bytes at `offset`.
    pub fn read_exact_at(&self, buf: &mut [u8], offset: usize) -> Result<(), HeaderError> {
        if self.file.read_at(buf, offset) == buf.len() {
            Ok(())
        } else {
            Err(HeaderError::Truncated)
        }
    }
}

impl fmt::Debug for ProgramImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramImage")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}
