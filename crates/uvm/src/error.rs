//! Error taxonomy for the virtual-memory subsystem.

use core::fmt;

use physmem::{AllocError, FrameNumber, VirtualAddress};

use crate::{HeaderError, PteHandle, SpaceId};

/// Errors returned by [`VirtualMemory`](crate::VirtualMemory) operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The executable header is missing, has a bad magic number, or describes
    /// segments the address space cannot hold. The process cannot be created.
    MalformedExecutable(HeaderError),
    /// No physical frames are left. Fatal to the requesting operation.
    ResourceExhausted,
    /// Kernel bookkeeping is inconsistent.
    InvariantViolation(Invariant),
    /// The address has no page-table entry at all.
    AddressingFault(VirtualAddress),
    /// The handle does not name a live address space.
    NoSuchAddressSpace(SpaceId),
    /// A user memory access raised a CPU exception.
    Fault(Fault),
}

/// The broken invariant behind a [`VmError::InvariantViolation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Invariant {
    /// The frame allocator refused an operation the caller believed valid,
    /// such as releasing an already free frame.
    Frame(AllocError),
    /// Two private entries map the same frame.
    FrameAliased {
        frame: FrameNumber,
        first: PteHandle,
        second: PteHandle,
    },
    /// A shared frame's sharer count disagrees with the entries mapping it.
    SharerCount {
        frame: FrameNumber,
        recorded: u32,
        mapped: u32,
    },
    /// A frame is allocated but no entry maps it, or mapped but not allocated.
    FrameOccupancy(FrameNumber),
}

/// A CPU exception raised while translating a user address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The page exists but is not resident yet.
    PageFault(VirtualAddress),
    /// The address is beyond the end of the page table.
    AddressError(VirtualAddress),
    /// A write hit a read-only page.
    ReadOnly(VirtualAddress),
    /// The access is not aligned to its size.
    BusError(VirtualAddress),
}

impl Fault {
    /// Returns the virtual address that raised the exception.
    pub fn address(self) -> VirtualAddress {
        match self {
            Self::PageFault(addr)
            | Self::AddressError(addr)
            | Self::ReadOnly(addr)
            | Self::BusError(addr) => addr,
        }
    }
}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfFrames => Self::ResourceExhausted,
            other => Self::InvariantViolation(Invariant::Frame(other)),
        }
    }
}

impl From<HeaderError> for VmError {
    fn from(err: HeaderError) -> Self {
        Self::MalformedExecutable(err)
    }
}

impl From<Fault> for VmError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedExecutable(err) => write!(f, "malformed executable: {err}"),
            Self::ResourceExhausted => write!(f, "out of physical frames"),
            Self::InvariantViolation(invariant) => write!(f, "invariant violated: {invariant}"),
            Self::AddressingFault(addr) => write!(f, "address {addr} is outside the address space"),
            Self::NoSuchAddressSpace(id) => write!(f, "no address space {id}"),
            Self::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

impl fmt::Display for Invariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(err) => write!(f, "{err}"),
            Self::FrameAliased {
                frame,
                first,
                second,
            } => write!(f, "frame {frame} privately mapped by {first} and {second}"),
            Self::SharerCount {
                frame,
                recorded,
                mapped,
            } => write!(
                f,
                "shared frame {frame} records {recorded} sharers but {mapped} spaces map it"
            ),
            Self::FrameOccupancy(frame) => {
                write!(f, "frame {frame} occupancy disagrees with page tables")
            }
        }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageFault(addr) => write!(f, "page fault at {addr}"),
            Self::AddressError(addr) => write!(f, "address error at {addr}"),
            Self::ReadOnly(addr) => write!(f, "write to read-only page at {addr}"),
            Self::BusError(addr) => write!(f, "misaligned access at {addr}"),
        }
    }
}

impl core::error::Error for VmError {}
impl core::error::Error for Fault {}
