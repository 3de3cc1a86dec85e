//! # vmsim
//!
//! A host-side stand-in for the simulated machine's CPU and exception layer.
//! It spawns processes from NOFF executables, performs user loads and stores
//! through address translation, and routes the resulting page faults and
//! system calls into [`uvm::VirtualMemory`].

mod console;
mod demo;
mod error;
mod image;
mod kernel;
mod process;
mod script;
mod syscall;

pub use console::Console;
pub use demo::{DEMO_SCRIPT, demo_image, run_demo, run_script};
pub use error::KernelError;
pub use image::ImageBuilder;
pub use kernel::{Kernel, MAX_FILE_NAME, Outcome};
pub use process::{Process, ProcessState};
pub use script::{Command, Driver, Operand, Script, Step};
pub use syscall::{Exception, Syscall};
