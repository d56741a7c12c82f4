// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The seam between the validator and whatever controls the debuggee.
//!
//! Everything the validator wants from a live process goes through the
//! [`Tracer`] trait: register reads, memory reads, disassembly of the
//! current instruction, single-stepping. A debugger backend implements it
//! against a real process; tests use the scripted replay in
//! [`crate::testing`].

use std::fmt;

/// Things a trace backend can fail at.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// The backend has no register by this name.
    #[error("tracee has no register named {0}")]
    UnknownRegister(String),
    /// A read touched memory the backend could not supply.
    #[error("failed to read tracee memory at {0:#x}")]
    UnreadableMemory(u64),
    /// The bytes at the current program counter did not disassemble.
    #[error("failed to disassemble at {0:#x}")]
    UndecodableInstruction(u64),
    /// The backend itself fell over.
    #[error("trace backend failure: {0}")]
    Backend(String),
}

/// What happened to the debuggee on a single step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    /// Stopped at the next instruction.
    Running,
    /// The process is gone; there is nothing left to validate.
    Exited,
}

/// One loaded image in the debuggee's address space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// First mapped address of the module's text.
    pub start: u64,
    /// One past the last mapped address.
    pub end: u64,
    /// Path the module was loaded from.
    pub path: String,
}

/// A disassembled instruction, split the way the oracles consume it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Instruction {
    /// The operation name: `callq`, `ret`, `stw`, ...
    pub mnemonic: String,
    /// Everything after the mnemonic, untouched: `0x8(%rip)`, `r0,8(r1)`.
    pub operands: String,
}

impl Instruction {
    /// Normalise one line of disassembler output.
    ///
    /// Splits the mnemonic from the operand text and drops a leading
    /// `rep`/`repz` prefix so that `repz ret` classifies as a return.
    pub fn from_line(line: &str) -> Instruction {
        let mut rest = line.trim();
        loop {
            let mut words = rest.splitn(2, char::is_whitespace);
            let head = words.next().unwrap_or("");
            let tail = words.next().unwrap_or("").trim_start();
            match head {
                "rep" | "repz" | "repnz" if !tail.is_empty() => rest = tail,
                _ => {
                    return Instruction {
                        mnemonic: head.to_string(),
                        operands: tail.to_string(),
                    }
                }
            }
        }
    }

    /// The operand's base register, for memory operands written
    /// `offset(%reg)`. The leading `%` AT&T sigil is stripped.
    pub fn base_register(&self) -> Option<&str> {
        let open = self.operands.find('(')?;
        let close = self.operands[open..].find(')')? + open;
        Some(self.operands[open + 1..close].trim_start_matches('%'))
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operands.is_empty() {
            f.write_str(&self.mnemonic)
        } else {
            write!(f, "{} {}", self.mnemonic, self.operands)
        }
    }
}

/// Process control as the validator sees it.
///
/// Methods take `&mut self` because a backend talking to a live process
/// caches and invalidates state behind every call.
pub trait Tracer {
    /// The current program counter.
    fn instruction_pointer(&mut self) -> Result<u64, TraceError>;

    /// The current stack pointer.
    fn stack_pointer(&mut self) -> Result<u64, TraceError>;

    /// Read a register by its disassembler name (`rsp`, `r1`, ...).
    fn read_register(&mut self, name: &str) -> Result<u64, TraceError>;

    /// Read one pointer-width word of tracee memory.
    fn read_word(&mut self, addr: u64) -> Result<u64, TraceError>;

    /// Disassemble the instruction at the current program counter.
    fn disassemble(&mut self) -> Result<Instruction, TraceError>;

    /// Execute exactly one instruction.
    fn step(&mut self) -> Result<StepOutcome, TraceError>;

    /// Run the debuggee to its entry point; validation starts there.
    fn run_to_entry(&mut self) -> Result<(), TraceError>;

    /// Every image currently mapped into the debuggee.
    fn loaded_modules(&mut self) -> Result<Vec<Module>, TraceError>;
}
