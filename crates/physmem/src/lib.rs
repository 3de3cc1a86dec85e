#![cfg_attr(not(test), no_std)]

//! # Physical memory for the teaching kernel
//!
//! This crate models the simulated machine's physical memory. It provides:
//!
//! - Frame and page number newtypes, and physical/virtual address newtypes.
//! - Per-frame metadata, including the sharer count of frames aliased across
//!   address spaces.
//! - The [`FrameAllocator`], which hands out and reclaims frames.
//! - [`MainMemory`], the flat byte array every frame lives in.

extern crate alloc;

mod address;
mod frame;
mod frame_allocator;
mod main_memory;
mod numbers;

pub use address::{PhysicalAddress, VirtualAddress};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use frame_allocator::{AllocError, FrameAllocator};
pub use main_memory::MainMemory;
pub use numbers::{FrameNumber, PageNumber};
