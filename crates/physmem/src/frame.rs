/// Holds metadata for a physical memory frame.
///
/// A frame is either free, privately allocated to exactly one page-table
/// entry, or shared: allocated once and aliased by `sharers` address spaces.
#[derive(Debug, Default)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    /// Number of address spaces mapping this frame. Only meaningful when the
    /// `Shared` flag is set.
    sharers: u32,
}

impl Frame {
    /// Gets the number of address spaces sharing this frame.
    pub fn sharers(&self) -> u32 {
        self.sharers
    }

    /// Sets the number of address spaces sharing this frame.
    pub fn set_sharers(&mut self, sharers: u32) {
        self.sharers = sharers;
    }

    /// Returns true if the frame is currently handed out.
    pub fn is_allocated(&self) -> bool {
        self.flags.test(FrameFlag::Allocated)
    }

    /// Returns true if the frame is aliased across address spaces.
    pub fn is_shared(&self) -> bool {
        self.flags.test(FrameFlag::Shared)
    }
}

#[derive(Debug, Clone, Copy)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame belongs to a shared region and is reference counted.
    Shared = 1 << 1,
}

/// Flags for a physical memory frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Sets the given flag.
    pub fn set(&mut self, flag: FrameFlag) {
        self.0 |= flag as u8;
    }

    /// Clears the given flag.
    pub fn clear(&mut self, flag: FrameFlag) {
        self.0 &= !(flag as u8);
    }

    /// Tests if the given flag is set.
    pub fn test(&self, flag: FrameFlag) -> bool {
        (self.0 & flag as u8) != 0
    }

    /// Tests the given flag and sets it, returning the previous value.
    pub fn test_and_set(&mut self, flag: FrameFlag) -> bool {
        let old = self.test(flag);
        self.set(flag);
        old
    }
}
