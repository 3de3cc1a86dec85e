use uvm::{Pid, Registers, SpaceId};

/// Lifecycle of a user process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Runnable; owns a live address space.
    Ready,
    /// Called exit with this code.
    Exited(i32),
    /// Terminated by the kernel after a fatal exception.
    Killed,
}

/// A user process: saved registers plus the address space they run in.
#[derive(Debug, Clone)]
pub struct Process {
    pid: Pid,
    parent: Option<Pid>,
    space: Option<SpaceId>,
    pub(crate) regs: Registers,
    state: ProcessState,
}

impl Process {
    pub(crate) fn new(pid: Pid, parent: Option<Pid>, space: SpaceId, regs: Registers) -> Self {
        Self {
            pid,
            parent,
            space: Some(space),
            regs,
            state: ProcessState::Ready,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    /// Returns the address space, or None once the process has ended.
    pub fn space(&self) -> Option<SpaceId> {
        self.space
    }

    pub fn registers(&self) -> &Registers {
        &self.regs
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ProcessState::Ready
    }

    /// Moves the process into a new address space with fresh registers.
    pub(crate) fn restart(&mut self, space: SpaceId, regs: Registers) {
        self.space = Some(space);
        self.regs = regs;
    }

    /// Marks the process ended and hands back its address space for
    /// teardown.
    pub(crate) fn end(&mut self, state: ProcessState) -> Option<SpaceId> {
        self.state = state;
        self.space.take()
    }
}
