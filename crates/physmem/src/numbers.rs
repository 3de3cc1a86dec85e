//! Page and frame number types for memory management.
//!
//! The simulated machine's page size is a run-time property, so conversions
//! between numbers and addresses take the page size as an argument.

use crate::address::{PhysicalAddress, VirtualAddress};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frames are zero-indexed blocks of main memory, each one page long."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self, page_size: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * page_size)
    }

    /// Returns the frame containing the given physical address.
    #[inline]
    pub const fn containing(addr: PhysicalAddress, page_size: usize) -> Self {
        Self(addr.as_usize() / page_size)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Page numbers index a process's page table directly."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self, page_size: usize) -> VirtualAddress {
        VirtualAddress::new(self.0 * page_size)
    }

    /// Returns the virtual address at the end of this page (start of next page).
    #[inline]
    pub const fn end(self, page_size: usize) -> VirtualAddress {
        VirtualAddress::new((self.0 + 1) * page_size)
    }

    /// Returns the page containing the given virtual address.
    #[inline]
    pub const fn containing(addr: VirtualAddress, page_size: usize) -> Self {
        Self(addr.as_usize() / page_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_containing_rounds_down() {
        let page = PageNumber::containing(VirtualAddress::new(0x1ff), 128);
        assert_eq!(page, PageNumber::new(3));
        assert_eq!(page.start(128), VirtualAddress::new(0x180));
        assert_eq!(page.end(128), VirtualAddress::new(0x200));
    }

    #[test]
    fn frame_start_scales_by_page_size() {
        assert_eq!(FrameNumber::new(5).start(4096), PhysicalAddress::new(5 * 4096));
        assert_eq!(
            FrameNumber::containing(PhysicalAddress::new(4097), 4096),
            FrameNumber::new(1)
        );
    }

    #[test]
    fn debug_names_the_kind() {
        assert_eq!(format!("{:?}", FrameNumber::new(7)), "FrameNumber(7)");
        assert_eq!(format!("{}", PageNumber::new(7)), "7");
    }
}
