// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Ground truth for where the return address really is.
//!
//! An oracle watches the instruction stream and maintains, independently
//! of any unwind table, the location of the innermost frame's return
//! address. The validator diffs its answer against what the table claims.
//! Each machine gets its own state shape; only the trait is shared.

mod ppc;
mod x86;

#[cfg(test)]
mod ppc_unittest;
#[cfg(test)]
mod x86_unittest;

pub use self::ppc::PpcOracle;
pub use self::x86::X86Oracle;

use crate::tracer::{Instruction, Tracer};
use crate::CheckError;
use ehframe_common::{Arch, RaLocation};

/// What the oracle concluded from one instruction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OracleStep {
    /// Keep stepping.
    Continue,
    /// The frame the run started in returned; there is nothing left to
    /// track and the run is complete.
    ReturnedFromTop,
}

/// Machine-specific return-address tracking.
pub trait ReturnAddressOracle {
    /// Where the innermost frame's return address lives right now.
    fn location(&self) -> RaLocation;

    /// Account for the instruction about to execute at the current stop.
    /// Called after the table comparison, before the step.
    fn observe(
        &mut self,
        insn: &Instruction,
        tracer: &mut dyn Tracer,
    ) -> Result<OracleStep, CheckError>;
}

/// Build the oracle for `arch`, reading whatever entry state it needs
/// from the stopped tracee.
pub fn for_arch(
    arch: Arch,
    tracer: &mut dyn Tracer,
) -> Result<Box<dyn ReturnAddressOracle>, CheckError> {
    match arch {
        Arch::X86 | Arch::Amd64 => {
            let entry_sp = tracer.stack_pointer()?;
            Ok(Box::new(X86Oracle::new(arch, entry_sp)))
        }
        Arch::Ppc => Ok(Box::new(PpcOracle::new())),
    }
}
