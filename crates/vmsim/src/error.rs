use core::fmt;

use uvm::{ConfigError, HeaderError, Pid, VmError};

/// Errors reported by the kernel harness and the script driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelError {
    /// The machine configuration is unusable.
    Config(ConfigError),
    /// The executable could not be read.
    Executable(HeaderError),
    /// The virtual-memory subsystem reported a kernel bug.
    Vm(VmError),
    /// No live process has this pid.
    NoSuchProcess(Pid),
    /// The machine has been halted.
    Halted,
    /// A script line could not be parsed.
    Parse { line: usize, message: String },
    /// A script step failed.
    Script { line: usize, message: String },
    /// An `expect` line read a different value.
    Mismatch {
        line: usize,
        expected: u32,
        actual: u32,
    },
}

impl From<ConfigError> for KernelError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<HeaderError> for KernelError {
    fn from(err: HeaderError) -> Self {
        Self::Executable(err)
    }
}

impl From<VmError> for KernelError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::MalformedExecutable(header) => Self::Executable(header),
            other => Self::Vm(other),
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "bad machine configuration: {err}"),
            Self::Executable(err) => write!(f, "bad executable: {err}"),
            Self::Vm(err) => write!(f, "virtual memory: {err}"),
            Self::NoSuchProcess(pid) => write!(f, "no process with pid {pid}"),
            Self::Halted => write!(f, "machine is halted"),
            Self::Parse { line, message } => write!(f, "line {line}: {message}"),
            Self::Script { line, message } => write!(f, "line {line}: {message}"),
            Self::Mismatch {
                line,
                expected,
                actual,
            } => write!(f, "line {line}: expected {expected:#x}, read {actual:#x}"),
        }
    }
}

impl std::error::Error for KernelError {}
