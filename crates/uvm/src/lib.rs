#![cfg_attr(not(test), no_std)]

//! # User virtual memory
//!
//! Per-process address spaces for the teaching kernel's simulated machine.
//! Each address space is a flat, single-level page table sized to the
//! process. Pages are demand-loaded from the executable on first touch,
//! processes may grow their space with regions shared with their relatives,
//! and fork duplicates a space by aliasing shared pages and deep-copying
//! private ones.
//!
//! All state lives in [`VirtualMemory`], which owns the frame allocator, main
//! memory, the reverse map and every live address space. The six entry points
//! the kernel calls are:
//!
//! - [`VirtualMemory::create_address_space`]
//! - [`VirtualMemory::handle_page_fault`]
//! - [`VirtualMemory::allocate_shared`]
//! - [`VirtualMemory::duplicate`]
//! - [`VirtualMemory::destroy`]
//! - [`VirtualMemory::init_registers`]

extern crate alloc;

mod address_space;
mod config;
mod entry;
mod error;
mod executable;
mod flags;
mod fork;
mod loader;
mod registers;
mod reverse_map;
mod shared;
mod table;
#[cfg(test)]
mod testing;
mod vm;

pub use address_space::{AddressSpace, Pid, SpaceId};
pub use config::{ConfigError, MAX_MEMORY_SIZE, VmConfig};
pub use entry::PageTableEntry;
pub use error::{Fault, Invariant, VmError};
pub use executable::{Executable, HEADER_SIZE, HeaderError, NOFF_MAGIC, NoffHeader, ProgramImage, Segment};
pub use flags::PageFlags;
pub use registers::{
    BAD_VADDR_REG, NEXT_PC_REG, NUM_TOTAL_REGS, PC_REG, PREV_PC_REG, RET_VAL_REG, RegisterFile,
    Registers, STACK_REG, arg_reg,
};
pub use reverse_map::{PteHandle, ReverseMap};
pub use table::PageTable;
pub use vm::{VirtualMemory, VmStats};

pub use physmem::{FrameNumber, PageNumber, PhysicalAddress, VirtualAddress};
