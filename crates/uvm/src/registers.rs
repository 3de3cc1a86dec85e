//! The user-visible register file of the simulated CPU.

/// Register holding a syscall's number and its return value.
pub const RET_VAL_REG: usize = 2;
/// Stack pointer.
pub const STACK_REG: usize = 29;
/// Current program counter.
pub const PC_REG: usize = 34;
/// Next program counter, for branch delay.
pub const NEXT_PC_REG: usize = 35;
/// Previous program counter, for debugging.
pub const PREV_PC_REG: usize = 36;
/// The failing virtual address on an exception.
pub const BAD_VADDR_REG: usize = 39;
/// Number of registers, general purpose and special.
pub const NUM_TOTAL_REGS: usize = 40;

/// Returns the register holding syscall argument `n` (1 to 4).
pub const fn arg_reg(n: usize) -> usize {
    3 + n
}

/// Numbered registers the kernel can read and write.
pub trait RegisterFile {
    fn read_register(&self, index: usize) -> i32;
    fn write_register(&mut self, index: usize, value: i32);

    /// Moves the program counters past the current instruction.
    fn advance_pc(&mut self, instruction_width: i32) {
        let pc = self.read_register(PC_REG);
        let next = self.read_register(NEXT_PC_REG);
        self.write_register(PREV_PC_REG, pc);
        self.write_register(PC_REG, next);
        self.write_register(NEXT_PC_REG, next.wrapping_add(instruction_width));
    }
}

/// A saved set of user registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers([i32; NUM_TOTAL_REGS]);

impl Registers {
    pub const fn new() -> Self {
        Self([0; NUM_TOTAL_REGS])
    }
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile for Registers {
    fn read_register(&self, index: usize) -> i32 {
        self.0[index]
    }

    fn write_register(&mut self, index: usize, value: i32) {
        self.0[index] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_shifts_program_counters() {
        let mut regs = Registers::new();
        regs.write_register(PC_REG, 8);
        regs.write_register(NEXT_PC_REG, 12);
        regs.advance_pc(4);

        assert_eq!(regs.read_register(PREV_PC_REG), 8);
        assert_eq!(regs.read_register(PC_REG), 12);
        assert_eq!(regs.read_register(NEXT_PC_REG), 16);
    }

    #[test]
    fn argument_registers_start_at_four() {
        assert_eq!(arg_reg(1), 4);
        assert_eq!(arg_reg(4), 7);
    }
}
