use core::fmt;

/// Largest main memory the machine can address. Physical addresses are
/// handed to user programs in 32-bit registers.
pub const MAX_MEMORY_SIZE: usize = 1 << 31;

/// Tunables of the simulated machine and its user address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Bytes per page and per frame. Must be a power of two.
    pub page_size: usize,
    /// Number of frames of main memory.
    pub num_frames: usize,
    /// Bytes reserved at the top of every address space for the user stack.
    pub user_stack_size: usize,
    /// Gap left between the initial stack pointer and the end of the space.
    pub stack_slack: usize,
    /// Width of one instruction, used to seed the next-PC register.
    pub instruction_width: usize,
}

impl VmConfig {
    /// Checks that the configuration describes a usable machine.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() {
            return Err(ConfigError::PageSizeNotPowerOfTwo(self.page_size));
        }
        if self.num_frames == 0 {
            return Err(ConfigError::NoFrames);
        }
        if self.stack_slack >= self.user_stack_size {
            return Err(ConfigError::SlackExceedsStack);
        }
        match self.page_size.checked_mul(self.num_frames) {
            Some(size) if size <= MAX_MEMORY_SIZE => Ok(()),
            _ => Err(ConfigError::TooLarge),
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            page_size: 128,
            num_frames: 32,
            user_stack_size: 1024,
            stack_slack: 16,
            instruction_width: 4,
        }
    }
}

/// Errors reported by [`VmConfig::validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    PageSizeNotPowerOfTwo(usize),
    NoFrames,
    SlackExceedsStack,
    /// Main memory would not fit the machine's physical address range.
    TooLarge,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PageSizeNotPowerOfTwo(size) => {
                write!(f, "page size {size} is not a power of two")
            }
            Self::NoFrames => write!(f, "main memory must have at least one frame"),
            Self::SlackExceedsStack => write!(f, "stack slack must be smaller than the stack"),
            Self::TooLarge => write!(
                f,
                "main memory may be at most {MAX_MEMORY_SIZE:#x} bytes"
            ),
        }
    }
}

impl core::error::Error for ConfigError {}
