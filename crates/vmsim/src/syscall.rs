//! Exceptions raised by user code and the system calls the kernel serves.

/// Why the CPU trapped into the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    /// An access hit a page that is not resident. The faulting address is in
    /// the bad-address register.
    PageFault,
    /// The program asked for a service. The call number is in the return
    /// value register and its arguments in the argument registers.
    Syscall,
}

macro_rules! syscalls {
    ($($(#[$meta:meta])* $name:ident = $value:literal,)*) => {
        /// System call numbers understood by the kernel.
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(i32)]
        pub enum Syscall {
            $($(#[$meta])* $name = $value,)*
        }

        impl Syscall {
            /// Decodes a call number, or None if the kernel does not know it.
            pub const fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($value => Some(Self::$name),)*
                    _ => None,
                }
            }

            pub const fn code(self) -> i32 {
                self as i32
            }
        }
    };
}

syscalls! {
    /// Stops the whole machine.
    Halt = 0,
    /// Ends the calling process with the exit code in the first argument.
    Exit = 1,
    /// Replaces the caller's program with the installed file named by the
    /// NUL-terminated string the first argument points at. Returns -1 if
    /// there is no such file or it does not fit.
    Exec = 2,
    /// Duplicates the calling process. Returns the child's pid to the parent
    /// and 0 to the child.
    Fork = 9,
    /// Gives up the CPU.
    Yield = 10,
    /// Returns the value of the register named by the first argument.
    GetReg = 14,
    /// Returns the physical address behind the first argument, or -1.
    GetPA = 15,
    /// Returns the caller's pid.
    GetPid = 16,
    /// Returns the pid of the caller's parent, or 0 for a process spawned
    /// by the kernel.
    GetPpid = 17,
    /// Grows the caller's space by a shared region of at least the first
    /// argument's bytes. Returns its base address.
    ShmAllocate = 22,
}
