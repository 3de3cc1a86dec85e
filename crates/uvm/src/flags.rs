//! Page table entry flags.

/// Permission and status flags of a page table entry.
///
/// Flags are stored as a raw bit set with specific bits representing
/// different states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageFlags(u8);

impl PageFlags {
    /// Valid bit (bit 0): a frame is allocated and holds the page's data.
    const VALID: u8 = 1 << 0;

    /// Read-only bit (bit 1).
    const READ_ONLY: u8 = 1 << 1;

    /// Use bit (bit 2): set by the MMU on every access.
    const USE: u8 = 1 << 2;

    /// Dirty bit (bit 3): set by the MMU on every write.
    const DIRTY: u8 = 1 << 3;

    /// Shared bit (bit 4): the frame is aliased across address spaces.
    const SHARED: u8 = 1 << 4;

    /// Cached bit (bit 5): reserved for eviction bookkeeping.
    const CACHED: u8 = 1 << 5;

    /// Creates empty page flags (page not valid).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates page flags from a raw value.
    pub const fn from_raw(raw: u8) -> Self {
        Self(raw)
    }

    /// Returns the raw value of these flags.
    pub const fn to_raw(self) -> u8 {
        self.0
    }

    /// Returns whether the valid bit is set.
    pub fn is_valid(self) -> bool {
        (self.0 & Self::VALID) != 0
    }

    /// Sets or clears the valid bit.
    pub fn set_valid(&mut self, valid: bool) {
        self.assign(Self::VALID, valid);
    }

    /// Returns whether the read-only bit is set.
    pub fn is_read_only(self) -> bool {
        (self.0 & Self::READ_ONLY) != 0
    }

    /// Sets or clears the read-only bit.
    pub fn set_read_only(&mut self, read_only: bool) {
        self.assign(Self::READ_ONLY, read_only);
    }

    /// Returns whether the use bit is set.
    pub fn is_used(self) -> bool {
        (self.0 & Self::USE) != 0
    }

    /// Sets or clears the use bit.
    pub fn set_used(&mut self, used: bool) {
        self.assign(Self::USE, used);
    }

    /// Returns whether the dirty bit is set.
    pub fn is_dirty(self) -> bool {
        (self.0 & Self::DIRTY) != 0
    }

    /// Sets or clears the dirty bit.
    pub fn set_dirty(&mut self, dirty: bool) {
        self.assign(Self::DIRTY, dirty);
    }

    /// Returns whether the shared bit is set.
    pub fn is_shared(self) -> bool {
        (self.0 & Self::SHARED) != 0
    }

    /// Sets or clears the shared bit.
    pub fn set_shared(&mut self, shared: bool) {
        self.assign(Self::SHARED, shared);
    }

    /// Returns whether the cached bit is set.
    pub fn is_cached(self) -> bool {
        (self.0 & Self::CACHED) != 0
    }

    /// Sets or clears the cached bit.
    pub fn set_cached(&mut self, cached: bool) {
        self.assign(Self::CACHED, cached);
    }

    fn assign(&mut self, bit: u8, on: bool) {
        if on {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}
