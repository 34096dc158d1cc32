use aarch64_cpu::registers::SPSR_EL1;
use core::fmt::Formatter;

/// Index of the zero register in a transfer register field.
const XZR: usize = 31;

/// The guest's general purpose register file as exchanged with the host's
/// vCPU control object.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ContextFrame {
    pub gpr: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub spsr: u64,
}

impl core::fmt::Display for ContextFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), core::fmt::Error> {
        for i in 0..31 {
            write!(f, "x{:02}: {:016x}   ", i, self.gpr[i])?;
            if (i + 1) % 2 == 0 {
                writeln!(f)?;
            }
        }
        writeln!(f, "spsr:{:016x}", self.spsr)?;
        write!(f, "pc:  {:016x}", self.pc)?;
        writeln!(f, "   sp:  {:016x}", self.sp)?;
        Ok(())
    }
}

impl Default for ContextFrame {
    fn default() -> Self {
        Self {
            gpr: [0; 31],
            spsr: (SPSR_EL1::M::EL1h
                + SPSR_EL1::I::Masked
                + SPSR_EL1::F::Masked
                + SPSR_EL1::A::Masked
                + SPSR_EL1::D::Masked)
                .value,
            pc: 0,
            sp: 0,
        }
    }
}

impl ContextFrame {
    /// A boot context entering at `pc` with `arg` in x0.
    pub fn new(pc: usize, arg: usize) -> Self {
        let mut r = Self::default();
        r.pc = pc as u64;
        r.set_argument(arg);
        r
    }

    pub fn exception_pc(&self) -> usize {
        self.pc as usize
    }

    pub fn set_exception_pc(&mut self, pc: usize) {
        self.pc = pc as u64;
    }

    pub fn set_argument(&mut self, arg: usize) {
        self.gpr[0] = arg as u64;
    }

    /// Reads a transfer register, the zero register reads as 0.
    pub fn gpr(&self, index: usize) -> u64 {
        if index >= XZR {
            0
        } else {
            self.gpr[index]
        }
    }

    /// Writes a transfer register, writes to the zero register are dropped.
    pub fn set_gpr(&mut self, index: usize, val: u64) {
        if index < XZR {
            self.gpr[index] = val;
        }
    }
}
