//! Line-oriented scripts that drive user processes through the kernel.
//!
//! Each non-blank line is one command, `#` starts a comment:
//!
//! ```text
//! load <addr> [size]            read user memory
//! store <addr> <value> [size]   write user memory
//! expect <addr> <value> [size]  read user memory and check the value
//! shm <name> <bytes>            allocate a shared region, bind its base
//! fork [name]                   fork the current process, bind the child
//! exec <file>                   run an installed file in the current process
//! switch <pid>                  put another process on the CPU
//! getpa <addr>                  ask for a physical address
//! yield                         give the CPU to the next ready process
//! exit [code]                   end the current process
//! halt                          stop the machine
//! ```
//!
//! Numbers are decimal or `0x` hex. Addresses and values may also name a
//! binding, optionally plus an offset (`buf+4`). Sizes are 1, 2 or 4 bytes
//! and default to 4.

use std::collections::BTreeMap;

use uvm::{Pid, VirtualAddress};

use crate::{Kernel, KernelError, Outcome, Syscall};

/// A number, or a named binding plus an offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Number(u32),
    Name(String, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Load { addr: Operand, size: usize },
    Store { addr: Operand, value: Operand, size: usize },
    Expect { addr: Operand, value: Operand, size: usize },
    Shm { name: String, bytes: Operand },
    Fork { name: Option<String> },
    Exec { file: String },
    Switch { pid: Operand },
    GetPa { addr: Operand },
    Yield,
    Exit { code: Operand },
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub line: usize,
    pub command: Command,
}

/// A parsed script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    steps: Vec<Step>,
}

impl Script {
    pub fn parse(source: &str) -> Result<Self, KernelError> {
        let mut steps = Vec::new();
        for (index, raw) in source.lines().enumerate() {
            let line = index + 1;
            let text = raw.split('#').next().unwrap_or_default();
            let tokens: Vec<&str> = text.split_whitespace().collect();
            let Some((&verb, args)) = tokens.split_first() else {
                continue;
            };

            let command = parse_command(verb, args).map_err(|message| KernelError::Parse {
                line,
                message,
            })?;
            steps.push(Step { line, command });
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }
}

fn parse_command(verb: &str, args: &[&str]) -> Result<Command, String> {
    let arity = |min: usize, max: usize| {
        if args.len() < min || args.len() > max {
            Err(format!("`{verb}` takes {min} to {max} arguments, got {}", args.len()))
        } else {
            Ok(())
        }
    };
    let size_at = |at: usize| args.get(at).map_or(Ok(4), |token| parse_size(token));

    match verb {
        "load" => {
            arity(1, 2)?;
            Ok(Command::Load {
                addr: parse_operand(args[0])?,
                size: size_at(1)?,
            })
        }
        "store" | "expect" => {
            arity(2, 3)?;
            let addr = parse_operand(args[0])?;
            let value = parse_operand(args[1])?;
            let size = size_at(2)?;
            if verb == "store" {
                Ok(Command::Store { addr, value, size })
            } else {
                Ok(Command::Expect { addr, value, size })
            }
        }
        "shm" => {
            arity(2, 2)?;
            Ok(Command::Shm {
                name: parse_name(args[0])?,
                bytes: parse_operand(args[1])?,
            })
        }
        "fork" => {
            arity(0, 1)?;
            Ok(Command::Fork {
                name: args.first().map(|name| parse_name(name)).transpose()?,
            })
        }
        "exec" => {
            arity(1, 1)?;
            Ok(Command::Exec {
                file: parse_name(args[0])?,
            })
        }
        "switch" => {
            arity(1, 1)?;
            Ok(Command::Switch {
                pid: parse_operand(args[0])?,
            })
        }
        "getpa" => {
            arity(1, 1)?;
            Ok(Command::GetPa {
                addr: parse_operand(args[0])?,
            })
        }
        "yield" => {
            arity(0, 0)?;
            Ok(Command::Yield)
        }
        "exit" => {
            arity(0, 1)?;
            Ok(Command::Exit {
                code: args
                    .first()
                    .map_or(Ok(Operand::Number(0)), |token| parse_operand(token))?,
            })
        }
        "halt" => {
            arity(0, 0)?;
            Ok(Command::Halt)
        }
        _ => Err(format!("unknown command `{verb}`")),
    }
}

fn parse_size(token: &str) -> Result<usize, String> {
    match token {
        "1" => Ok(1),
        "2" => Ok(2),
        "4" => Ok(4),
        _ => Err(format!("access size must be 1, 2 or 4, not `{token}`")),
    }
}

fn parse_number(token: &str) -> Result<u32, String> {
    let parsed = match token.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => token.parse::<i64>(),
    };
    match parsed {
        Ok(value) if (i32::MIN as i64..=u32::MAX as i64).contains(&value) => Ok(value as u32),
        _ => Err(format!("`{token}` is not a 32-bit number")),
    }
}

fn parse_name(token: &str) -> Result<String, String> {
    let mut chars = token.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(token.to_string())
    } else {
        Err(format!("`{token}` is not a valid name"))
    }
}

fn parse_operand(token: &str) -> Result<Operand, String> {
    if token.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        return parse_number(token).map(Operand::Number);
    }
    match token.split_once('+') {
        Some((name, offset)) => Ok(Operand::Name(parse_name(name)?, parse_number(offset)?)),
        None => Ok(Operand::Name(parse_name(token)?, 0)),
    }
}

/// Runs scripts against a kernel, keeping named bindings across steps and a
/// transcript of what happened.
pub struct Driver<'k> {
    kernel: &'k mut Kernel,
    bindings: BTreeMap<String, u32>,
    transcript: Vec<String>,
}

impl<'k> Driver<'k> {
    pub fn new(kernel: &'k mut Kernel) -> Self {
        Self {
            kernel,
            bindings: BTreeMap::new(),
            transcript: Vec::new(),
        }
    }

    pub fn bind(&mut self, name: &str, value: u32) {
        self.bindings.insert(name.to_string(), value);
    }

    pub fn binding(&self, name: &str) -> Option<u32> {
        self.bindings.get(name).copied()
    }

    pub fn kernel(&self) -> &Kernel {
        &*self.kernel
    }

    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    pub fn into_transcript(self) -> Vec<String> {
        self.transcript
    }

    /// Executes every step in order, stopping early if the machine halts.
    pub fn run(&mut self, script: &Script) -> Result<(), KernelError> {
        for step in script.steps() {
            log::trace!("line {}: {:?}", step.line, step.command);
            self.step(step)?;
            if self.kernel.is_halted() {
                break;
            }
        }
        Ok(())
    }

    fn step(&mut self, step: &Step) -> Result<(), KernelError> {
        let line = step.line;

        if let Command::Switch { pid } = &step.command {
            let pid = Pid::new(self.resolve(line, pid)?);
            self.kernel
                .switch_to(pid)
                .map_err(|err| script_error(line, err))?;
            self.record(format!("switch to pid {pid}"));
            return Ok(());
        }

        let pid = self.kernel.current().ok_or_else(|| KernelError::Script {
            line,
            message: "no process is on the CPU".to_string(),
        })?;

        match &step.command {
            Command::Load { addr, size } => {
                let addr = self.resolve(line, addr)?;
                match self.kernel.load(pid, VirtualAddress::new(addr as usize), *size)? {
                    Some(value) => self.record(format!("[pid {pid}] load {addr:#x} -> {value}")),
                    None => self.killed(pid),
                }
            }
            Command::Store { addr, value, size } => {
                let addr = self.resolve(line, addr)?;
                let value = self.resolve(line, value)?;
                match self
                    .kernel
                    .store(pid, VirtualAddress::new(addr as usize), *size, value)?
                {
                    Some(()) => self.record(format!("[pid {pid}] store {addr:#x} <- {value}")),
                    None => self.killed(pid),
                }
            }
            Command::Expect { addr, value, size } => {
                let addr = self.resolve(line, addr)?;
                let expected = self.resolve(line, value)? & size_mask(*size);
                let Some(actual) = self.kernel.load(pid, VirtualAddress::new(addr as usize), *size)?
                else {
                    self.killed(pid);
                    return Err(KernelError::Script {
                        line,
                        message: format!("pid {pid} was killed reading {addr:#x}"),
                    });
                };
                if actual != expected {
                    return Err(KernelError::Mismatch {
                        line,
                        expected,
                        actual,
                    });
                }
                self.record(format!("[pid {pid}] expect {addr:#x} == {actual}"));
            }
            Command::Shm { name, bytes } => {
                let bytes = self.resolve(line, bytes)?;
                let (outcome, base) = self.kernel.invoke(pid, Syscall::ShmAllocate, &[bytes as i32])?;
                if outcome == Outcome::Killed {
                    self.killed(pid);
                    return Ok(());
                }
                self.bind(name, base as u32);
                self.record(format!("[pid {pid}] shm {name} = {base:#x} ({bytes} bytes)"));
            }
            Command::Fork { name } => match self.kernel.invoke(pid, Syscall::Fork, &[])? {
                (Outcome::Forked(child), _) => {
                    if let Some(name) = name {
                        self.bind(name, child.as_u32());
                    }
                    self.record(format!("[pid {pid}] fork -> pid {child}"));
                }
                _ => self.killed(pid),
            },
            Command::Exec { file } => {
                let image = self.kernel.file(file).ok_or_else(|| KernelError::Script {
                    line,
                    message: format!("no file named `{file}`"),
                })?;
                self.kernel
                    .exec(pid, image)
                    .map_err(|err| script_error(line, err))?;
                self.record(format!("[pid {pid}] exec {file}"));
            }
            Command::GetPa { addr } => {
                let addr = self.resolve(line, addr)?;
                let (_, phys) = self.kernel.invoke(pid, Syscall::GetPA, &[addr as i32])?;
                self.record(format!("[pid {pid}] getpa {addr:#x} -> {phys}"));
            }
            Command::Yield => {
                self.kernel.invoke(pid, Syscall::Yield, &[])?;
                let next = self.kernel.schedule()?;
                self.record(match next {
                    Some(next) => format!("[pid {pid}] yield -> pid {next}"),
                    None => format!("[pid {pid}] yield"),
                });
            }
            Command::Exit { code } => {
                let code = self.resolve(line, code)? as i32;
                self.kernel.invoke(pid, Syscall::Exit, &[code])?;
                self.record(format!("[pid {pid}] exit({code})"));
            }
            Command::Halt => {
                self.kernel.invoke(pid, Syscall::Halt, &[])?;
                self.record(format!("[pid {pid}] halt"));
            }
            Command::Switch { .. } => {}
        }
        Ok(())
    }

    fn resolve(&self, line: usize, operand: &Operand) -> Result<u32, KernelError> {
        match operand {
            Operand::Number(value) => Ok(*value),
            Operand::Name(name, offset) => self
                .binding(name)
                .map(|base| base.wrapping_add(*offset))
                .ok_or_else(|| KernelError::Script {
                    line,
                    message: format!("`{name}` is not bound"),
                }),
        }
    }

    fn killed(&mut self, pid: Pid) {
        self.record(format!("[pid {pid}] killed"));
    }

    fn record(&mut self, entry: String) {
        log::info!("{entry}");
        self.transcript.push(entry);
    }
}

fn size_mask(size: usize) -> u32 {
    match size {
        1 => 0xff,
        2 => 0xffff,
        _ => u32::MAX,
    }
}

fn script_error(line: usize, err: KernelError) -> KernelError {
    KernelError::Script {
        line,
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ImageBuilder;
    use std::sync::Arc;
    use uvm::{ProgramImage, VmConfig};

    fn init_image() -> Arc<ProgramImage> {
        ImageBuilder::new()
            .code(vec![0u8; 64])
            .data(7u32.to_le_bytes())
            .load()
            .unwrap()
    }

    fn kernel_with_init() -> (Kernel, Pid) {
        let mut kernel = Kernel::new(VmConfig::default()).unwrap();
        let pid = kernel.spawn(init_image()).unwrap();
        (kernel, pid)
    }

    #[test]
    fn parses_commands_operands_and_comments() {
        let script = Script::parse(
            "# setup\n\
             \n\
             shm buf 0x10   # one region\n\
             store buf+4 -1 2\n\
             fork kid\n\
             exit\n",
        )
        .unwrap();

        let lines: Vec<usize> = script.steps().iter().map(|step| step.line).collect();
        assert_eq!(lines, [3, 4, 5, 6]);
        assert_eq!(
            script.steps()[0].command,
            Command::Shm {
                name: "buf".to_string(),
                bytes: Operand::Number(16),
            }
        );
        assert_eq!(
            script.steps()[1].command,
            Command::Store {
                addr: Operand::Name("buf".to_string(), 4),
                value: Operand::Number(u32::MAX),
                size: 2,
            }
        );
        assert_eq!(
            script.steps()[3].command,
            Command::Exit {
                code: Operand::Number(0)
            }
        );
    }

    #[test]
    fn parse_errors_name_the_line() {
        for (source, line) in [
            ("load 0\nfrobnicate\n", 2),
            ("load 0 3\n", 1),
            ("\n\nstore 4\n", 3),
            ("shm 9lives 4\n", 1),
            ("load 0x1_0000_0000\n", 1),
        ] {
            match Script::parse(source) {
                Err(KernelError::Parse { line: at, .. }) => assert_eq!(at, line, "{source:?}"),
                other => panic!("{source:?} parsed as {other:?}"),
            }
        }
    }

    #[test]
    fn driver_records_each_step() {
        let (mut kernel, init) = kernel_with_init();
        let script = Script::parse(
            "load 64\n\
             shm s 4\n\
             store s 5\n\
             fork kid\n\
             switch kid\n\
             expect s 5\n\
             getpa 1000000\n\
             exit 2\n",
        )
        .unwrap();

        let mut driver = Driver::new(&mut kernel);
        driver.run(&script).unwrap();
        assert_eq!(driver.binding("kid"), Some(init.as_u32() + 1));

        let transcript = driver.into_transcript();
        assert_eq!(transcript[0], "[pid 1] load 0x40 -> 7");
        assert_eq!(transcript[1], "[pid 1] shm s = 0x480 (4 bytes)");
        assert_eq!(transcript[3], "[pid 1] fork -> pid 2");
        assert_eq!(transcript[4], "switch to pid 2");
        assert_eq!(transcript[6], "[pid 2] getpa 0xf4240 -> -1");
        assert_eq!(transcript[7], "[pid 2] exit(2)");
        assert_eq!(kernel.current(), None);
    }

    #[test]
    fn mismatch_stops_the_run() {
        let (mut kernel, _) = kernel_with_init();
        let script = Script::parse("store 8 0x1234\nexpect 8 0x34 1\nexpect 8 0x35 1\n").unwrap();

        let mut driver = Driver::new(&mut kernel);
        assert_eq!(
            driver.run(&script),
            Err(KernelError::Mismatch {
                line: 3,
                expected: 0x35,
                actual: 0x34,
            })
        );
        assert_eq!(driver.transcript().len(), 2);
    }

    #[test]
    fn killed_process_leaves_the_cpu_empty() {
        let (mut kernel, _) = kernel_with_init();
        let script = Script::parse("store 0x100000 1\nload 0\n").unwrap();

        let mut driver = Driver::new(&mut kernel);
        assert!(matches!(
            driver.run(&script),
            Err(KernelError::Script { line: 2, .. })
        ));
        assert_eq!(driver.transcript(), ["[pid 1] killed"]);
    }

    #[test]
    fn unbound_names_are_reported() {
        let (mut kernel, _) = kernel_with_init();
        let script = Script::parse("load nowhere\n").unwrap();

        let mut driver = Driver::new(&mut kernel);
        assert!(matches!(
            driver.run(&script),
            Err(KernelError::Script { line: 1, .. })
        ));
    }

    #[test]
    fn halt_ends_the_run() {
        let (mut kernel, _) = kernel_with_init();
        let script = Script::parse("halt\nload 0\n").unwrap();

        let mut driver = Driver::new(&mut kernel);
        driver.run(&script).unwrap();
        assert_eq!(driver.transcript(), ["[pid 1] halt"]);
        assert!(kernel.is_halted());
    }

    #[test]
    fn exec_restarts_the_program_and_spares_the_child() {
        let (mut kernel, _) = kernel_with_init();
        kernel.install_file("again", init_image());
        let script = Script::parse(
            "store 64 99\n\
             shm s 4\n\
             store s 5\n\
             fork kid\n\
             exec again\n\
             load 64\n\
             switch kid\n\
             expect s 5\n\
             expect 64 99\n",
        )
        .unwrap();

        let mut driver = Driver::new(&mut kernel);
        driver.run(&script).unwrap();
        let transcript = driver.into_transcript();
        assert_eq!(transcript[4], "[pid 1] exec again");
        assert_eq!(transcript[5], "[pid 1] load 0x40 -> 7");
        assert_eq!(transcript[8], "[pid 2] expect 0x40 == 99");
    }

    #[test]
    fn exec_of_a_missing_file_is_a_script_error() {
        let (mut kernel, _) = kernel_with_init();
        let script = Script::parse("exec nothing\n").unwrap();

        let mut driver = Driver::new(&mut kernel);
        assert!(matches!(
            driver.run(&script),
            Err(KernelError::Script { line: 1, .. })
        ));
    }
}
