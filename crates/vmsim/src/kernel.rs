//! The kernel side of the simulated machine: a process table and the
//! exception handler that routes page faults and system calls into the
//! virtual-memory subsystem.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::{Mutex, MutexGuard};
use uvm::{
    BAD_VADDR_REG, Fault, NUM_TOTAL_REGS, Pid, ProgramImage, RET_VAL_REG, RegisterFile,
    Registers, SpaceId, VirtualAddress, VirtualMemory, VmConfig, VmError, arg_reg,
};

use crate::{Exception, KernelError, Process, ProcessState, Syscall};

/// What the interrupted process should do once the kernel returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Continue at the next instruction.
    Resume,
    /// Re-issue the faulting instruction; the page is now resident.
    Retry,
    /// The process forked this child and continues.
    Forked(Pid),
    /// The process asked to give up the CPU.
    Yielded,
    /// The process exited with this code.
    Exited(i32),
    /// The process now runs a new program from its first instruction.
    Restarted,
    /// The kernel terminated the process.
    Killed,
    /// The machine is stopped.
    Halted,
}

/// Longest program name the exec call reads from user memory.
pub const MAX_FILE_NAME: usize = 256;

pub struct Kernel {
    vm: Mutex<VirtualMemory>,
    processes: BTreeMap<Pid, Process>,
    files: BTreeMap<String, Arc<ProgramImage>>,
    next_pid: u32,
    current: Option<Pid>,
    halted: bool,
}

impl Kernel {
    pub fn new(config: VmConfig) -> Result<Self, KernelError> {
        Ok(Self {
            vm: Mutex::new(VirtualMemory::new(config)?),
            processes: BTreeMap::new(),
            files: BTreeMap::new(),
            next_pid: 1,
            current: None,
            halted: false,
        })
    }

    /// Locks the virtual-memory subsystem.
    ///
    /// Each call into the subsystem runs under this lock, so a frame
    /// allocation, a release or a whole fork duplication is atomic. The
    /// kernel's own bookkeeping around those calls needs `&mut self` and is
    /// serialized by that instead.
    pub fn vm(&self) -> MutexGuard<'_, VirtualMemory> {
        self.vm.lock()
    }

    pub fn process(&self, pid: Pid) -> Option<&Process> {
        self.processes.get(&pid)
    }

    pub fn processes(&self) -> impl Iterator<Item = &Process> {
        self.processes.values()
    }

    /// Returns the process on the CPU.
    pub fn current(&self) -> Option<Pid> {
        self.current
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Creates a process running `image` from its first instruction.
    ///
    /// The first process spawned is put on the CPU.
    pub fn spawn(&mut self, image: Arc<ProgramImage>) -> Result<Pid, KernelError> {
        self.check_running()?;
        let pid = self.allocate_pid();

        let mut vm = self.vm.lock();
        let space = vm.create_address_space(pid, image)?;
        let mut regs = Registers::new();
        vm.init_registers(space, &mut regs)?;
        drop(vm);

        self.processes
            .insert(pid, Process::new(pid, None, space, regs));
        log::info!("spawned pid {pid} in {space}");

        if self.current.is_none() {
            self.switch_to(pid)?;
        }
        Ok(pid)
    }

    /// Makes `image` available to the exec system call under `name`.
    pub fn install_file(&mut self, name: impl Into<String>, image: Arc<ProgramImage>) {
        self.files.insert(name.into(), image);
    }

    pub fn file(&self, name: &str) -> Option<Arc<ProgramImage>> {
        self.files.get(name).cloned()
    }

    /// Replaces the program `pid` runs with `image`.
    ///
    /// The new address space is built before the old one is torn down, so a
    /// program that does not fit leaves the caller as it was. The old
    /// space's shared frames lose this process as a sharer. Registers start
    /// over as for a fresh process; the program counters are not advanced.
    pub fn exec(&mut self, pid: Pid, image: Arc<ProgramImage>) -> Result<Outcome, KernelError> {
        self.check_running()?;
        let old = self.live_space(pid)?;

        let mut vm = self.vm.lock();
        let space = vm.create_address_space(pid, image)?;
        vm.destroy(old)?;
        let mut regs = Registers::new();
        vm.init_registers(space, &mut regs)?;
        if self.current == Some(pid) {
            vm.activate(space)?;
        }
        drop(vm);

        self.processes
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess(pid))?
            .restart(space, regs);
        log::info!("pid {pid}: exec into {space}");
        Ok(Outcome::Restarted)
    }

    /// Puts `pid` on the CPU.
    pub fn switch_to(&mut self, pid: Pid) -> Result<(), KernelError> {
        let space = self.live_space(pid)?;
        self.vm.lock().activate(space)?;
        self.current = Some(pid);
        log::debug!("switched to pid {pid}");
        Ok(())
    }

    /// Puts the next ready process after the current one on the CPU,
    /// round-robin by pid. Returns None if nothing is runnable.
    pub fn schedule(&mut self) -> Result<Option<Pid>, KernelError> {
        let after = self.current.map_or(0, Pid::as_u32);
        let next = self
            .processes
            .values()
            .filter(|process| process.is_alive())
            .map(Process::pid)
            .find(|pid| pid.as_u32() > after)
            .or_else(|| {
                self.processes
                    .values()
                    .find(|process| process.is_alive())
                    .map(Process::pid)
            });

        match next {
            Some(pid) => {
                self.switch_to(pid)?;
                Ok(Some(pid))
            }
            None => {
                self.current = None;
                Ok(None)
            }
        }
    }

    pub fn registers(&self, pid: Pid) -> Result<&Registers, KernelError> {
        self.processes
            .get(&pid)
            .map(Process::registers)
            .ok_or(KernelError::NoSuchProcess(pid))
    }

    pub fn registers_mut(&mut self, pid: Pid) -> Result<&mut Registers, KernelError> {
        self.processes
            .get_mut(&pid)
            .map(|process| &mut process.regs)
            .ok_or(KernelError::NoSuchProcess(pid))
    }

    /// Handles an exception raised by `pid`.
    ///
    /// A serviced page fault leaves the program counters alone so the
    /// instruction is retried; every system call except halt, exit and a
    /// successful exec moves them past the trapping instruction. Exhausted memory and addresses
    /// outside the space terminate the process. Any other failure is a
    /// kernel bug and is returned as an error.
    pub fn raise(&mut self, pid: Pid, exception: Exception) -> Result<Outcome, KernelError> {
        self.check_running()?;
        let space = self.live_space(pid)?;

        match exception {
            Exception::PageFault => self.page_fault(pid, space),
            Exception::Syscall => self.syscall(pid, space),
        }
    }

    /// Performs a user load of `size` bytes through address translation,
    /// servicing page faults along the way. Returns None if the access
    /// cost the process its life.
    pub fn load(
        &mut self,
        pid: Pid,
        addr: VirtualAddress,
        size: usize,
    ) -> Result<Option<u32>, KernelError> {
        self.access(pid, addr, size, None)
    }

    /// Performs a user store; see [`Kernel::load`].
    pub fn store(
        &mut self,
        pid: Pid,
        addr: VirtualAddress,
        size: usize,
        value: u32,
    ) -> Result<Option<()>, KernelError> {
        Ok(self.access(pid, addr, size, Some(value))?.map(|_| ()))
    }

    /// Traps into the kernel with system call `call` and `args`, as a user
    /// program would. Returns the outcome and the value left in the return
    /// register.
    pub fn invoke(
        &mut self,
        pid: Pid,
        call: Syscall,
        args: &[i32],
    ) -> Result<(Outcome, i32), KernelError> {
        let regs = self.registers_mut(pid)?;
        regs.write_register(RET_VAL_REG, call.code());
        for (n, &arg) in args.iter().enumerate().take(4) {
            regs.write_register(arg_reg(n + 1), arg);
        }

        let outcome = self.raise(pid, Exception::Syscall)?;
        let ret = self.registers(pid)?.read_register(RET_VAL_REG);
        Ok((outcome, ret))
    }

    fn access(
        &mut self,
        pid: Pid,
        addr: VirtualAddress,
        size: usize,
        store: Option<u32>,
    ) -> Result<Option<u32>, KernelError> {
        loop {
            self.check_running()?;
            let space = self.live_space(pid)?;
            let result = match store {
                Some(value) => self
                    .vm
                    .lock()
                    .write_memory(space, addr, size, value)
                    .map(|()| value),
                None => self.vm.lock().read_memory(space, addr, size),
            };

            match result {
                Ok(value) => return Ok(Some(value)),
                Err(VmError::Fault(Fault::PageFault(bad))) => {
                    self.registers_mut(pid)?
                        .write_register(BAD_VADDR_REG, bad.as_usize() as i32);
                    if self.raise(pid, Exception::PageFault)? != Outcome::Retry {
                        return Ok(None);
                    }
                }
                Err(VmError::Fault(fault)) => {
                    log::warn!("pid {pid}: {fault}");
                    self.terminate(pid, ProcessState::Killed)?;
                    return Ok(None);
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn page_fault(&mut self, pid: Pid, space: SpaceId) -> Result<Outcome, KernelError> {
        let bad = self.registers(pid)?.read_register(BAD_VADDR_REG);
        let addr = VirtualAddress::new(bad as u32 as usize);
        let result = self.vm.lock().handle_page_fault(space, addr);

        match result {
            Ok(()) => Ok(Outcome::Retry),
            Err(err @ (VmError::AddressingFault(_) | VmError::ResourceExhausted)) => {
                log::warn!("pid {pid}: page fault at {addr}: {err}");
                self.terminate(pid, ProcessState::Killed)?;
                Ok(Outcome::Killed)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn syscall(&mut self, pid: Pid, space: SpaceId) -> Result<Outcome, KernelError> {
        let regs = *self.registers(pid)?;
        let code = regs.read_register(RET_VAL_REG);
        let arg = regs.read_register(arg_reg(1));

        let Some(call) = Syscall::from_code(code) else {
            log::warn!("pid {pid}: unknown system call {code}");
            self.terminate(pid, ProcessState::Killed)?;
            return Ok(Outcome::Killed);
        };
        log::trace!("pid {pid}: {call:?}({arg})");

        let (outcome, ret) = match call {
            Syscall::Halt => {
                log::info!("pid {pid}: machine halted");
                self.halted = true;
                return Ok(Outcome::Halted);
            }
            Syscall::Exit => {
                log::info!("pid {pid}: exit({arg})");
                self.terminate(pid, ProcessState::Exited(arg))?;
                return Ok(Outcome::Exited(arg));
            }
            Syscall::Exec => return self.exec_named(pid, arg),
            Syscall::Fork => return self.fork(pid, space),
            Syscall::Yield => (Outcome::Yielded, None),
            Syscall::GetReg => {
                let index = usize::try_from(arg).ok().filter(|&i| i < NUM_TOTAL_REGS);
                (Outcome::Resume, Some(index.map_or(-1, |i| regs.read_register(i))))
            }
            Syscall::GetPA => {
                let phys = usize::try_from(arg)
                    .ok()
                    .and_then(|addr| {
                        self.vm
                            .lock()
                            .physical_address(space, VirtualAddress::new(addr))
                    })
                    .map_or(-1, |phys| phys.as_usize() as i32);
                (Outcome::Resume, Some(phys))
            }
            Syscall::GetPid => (Outcome::Resume, Some(pid.as_u32() as i32)),
            Syscall::GetPpid => {
                let parent = self.processes.get(&pid).and_then(Process::parent);
                (Outcome::Resume, Some(parent.map_or(0, |p| p.as_u32() as i32)))
            }
            Syscall::ShmAllocate => {
                let Ok(size) = usize::try_from(arg) else {
                    log::warn!("pid {pid}: negative shared region size {arg}");
                    self.terminate(pid, ProcessState::Killed)?;
                    return Ok(Outcome::Killed);
                };
                let result = self.vm.lock().allocate_shared(space, size);
                match result {
                    Ok(base) => (Outcome::Resume, Some(base.as_usize() as i32)),
                    Err(VmError::ResourceExhausted) => {
                        log::warn!("pid {pid}: out of frames for a {size} byte shared region");
                        self.terminate(pid, ProcessState::Killed)?;
                        return Ok(Outcome::Killed);
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        };

        self.complete(pid, outcome, ret)
    }

    /// Finishes a system call: stores its result and moves past the trap.
    fn complete(
        &mut self,
        pid: Pid,
        outcome: Outcome,
        ret: Option<i32>,
    ) -> Result<Outcome, KernelError> {
        let width = self.vm.lock().config().instruction_width as i32;
        let regs = self.registers_mut(pid)?;
        if let Some(ret) = ret {
            regs.write_register(RET_VAL_REG, ret);
        }
        regs.advance_pc(width);
        Ok(outcome)
    }

    /// Execs the installed file whose name is the NUL-terminated string at
    /// `addr`. An unknown name or a program that does not fit returns -1 to
    /// the caller.
    fn exec_named(&mut self, pid: Pid, addr: i32) -> Result<Outcome, KernelError> {
        let Some(name) = self.read_string(pid, VirtualAddress::new(addr as u32 as usize))? else {
            return Ok(Outcome::Killed);
        };
        let Some(image) = self.file(&name) else {
            log::warn!("pid {pid}: exec of unknown file {name:?}");
            return self.complete(pid, Outcome::Resume, Some(-1));
        };

        match self.exec(pid, image) {
            Err(KernelError::Executable(err)) => {
                log::warn!("pid {pid}: cannot exec {name:?}: {err}");
                self.complete(pid, Outcome::Resume, Some(-1))
            }
            result => result,
        }
    }

    /// Reads a NUL-terminated string out of user memory. Returns None if
    /// reading it cost the process its life.
    fn read_string(
        &mut self,
        pid: Pid,
        addr: VirtualAddress,
    ) -> Result<Option<String>, KernelError> {
        let mut bytes = Vec::new();
        loop {
            let Some(byte) = self.access(pid, addr + bytes.len(), 1, None)? else {
                return Ok(None);
            };
            if byte == 0 {
                return Ok(Some(String::from_utf8_lossy(&bytes).into_owned()));
            }
            if bytes.len() == MAX_FILE_NAME {
                log::warn!("pid {pid}: unterminated string at {addr}");
                self.terminate(pid, ProcessState::Killed)?;
                return Ok(None);
            }
            bytes.push(byte as u8);
        }
    }

    /// Duplicates `parent`. The child resumes after the fork with 0 in the
    /// return register; the parent gets the child's pid.
    fn fork(&mut self, parent: Pid, space: SpaceId) -> Result<Outcome, KernelError> {
        let child = self.allocate_pid();
        let mut vm = self.vm.lock();
        let width = vm.config().instruction_width as i32;

        let child_space = match vm.duplicate(space, child) {
            Ok(id) => id,
            Err(VmError::ResourceExhausted) => {
                drop(vm);
                log::warn!("pid {parent}: out of frames for fork");
                self.terminate(parent, ProcessState::Killed)?;
                return Ok(Outcome::Killed);
            }
            Err(err) => return Err(err.into()),
        };
        drop(vm);

        let regs = self.registers_mut(parent)?;
        regs.advance_pc(width);
        let mut child_regs = *regs;
        regs.write_register(RET_VAL_REG, child.as_u32() as i32);
        child_regs.write_register(RET_VAL_REG, 0);

        self.processes.insert(
            child,
            Process::new(child, Some(parent), child_space, child_regs),
        );
        log::info!("pid {parent}: forked pid {child} in {child_space}");
        Ok(Outcome::Forked(child))
    }

    /// Ends `pid` and tears down its address space.
    fn terminate(&mut self, pid: Pid, state: ProcessState) -> Result<(), KernelError> {
        let process = self
            .processes
            .get_mut(&pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        if let Some(space) = process.end(state) {
            self.vm.lock().destroy(space)?;
        }
        if self.current == Some(pid) {
            self.current = None;
        }
        if state == ProcessState::Killed {
            log::warn!("pid {pid} killed");
        }
        Ok(())
    }

    fn live_space(&self, pid: Pid) -> Result<SpaceId, KernelError> {
        self.processes
            .get(&pid)
            .and_then(Process::space)
            .ok_or(KernelError::NoSuchProcess(pid))
    }

    fn check_running(&self) -> Result<(), KernelError> {
        if self.halted {
            return Err(KernelError::Halted);
        }
        Ok(())
    }

    fn allocate_pid(&mut self) -> Pid {
        let pid = Pid::new(self.next_pid);
        self.next_pid += 1;
        pid
    }
}
