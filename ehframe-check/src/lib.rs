// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Checks compiled unwind tables against the program they describe.
//!
//! A [`Validator`] single-steps a debuggee behind a [`Tracer`], and at
//! every stop asks two parties where the innermost return address lives:
//! the binary's own unwind table (via [`ehframe::UnwindTable`] and the
//! [`evaluator`]) and an architecture-specific [`oracle`] that watches
//! the instruction stream. Agreement at every covered stop of a complete
//! run is the correctness property; the first disagreement aborts the run
//! with a [`Divergence`].
//!
//! [`compare_tables`] is the static side of the same idea: two builds of
//! one program diffed row by row, no execution involved.

pub mod oracle;
pub mod testing;

mod compare;
mod evaluator;
mod symbolizer;
mod tracer;
mod validator;

pub use crate::compare::{compare_tables, CompareOptions, Mismatch};
pub use crate::evaluator::{eval_cfa, eval_ra_rule, evaluate, ExprValue};
pub use crate::symbolizer::{
    FileSymbolSupplier, MapSymbolSupplier, SymbolError, SymbolSupplier, Symbolizer,
};
pub use crate::tracer::{Instruction, Module, StepOutcome, TraceError, Tracer};
pub use crate::validator::{Divergence, ValidationStats, Validator, Verdict};

use ehframe::{ExprError, TableError};
use ehframe_common::Arch;

/// Things that stop a validation or comparison run.
///
/// Coverage gaps, undefined rules, and symbol-load failures are absorbed
/// where they occur and never show up here; a [`Divergence`] is a verdict,
/// not an error. What remains is genuinely fatal: broken input, table
/// content the checker cannot judge, or a failing backend.
#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    /// Reading or compiling an unwind table failed.
    #[error("failed to build unwind table: {0}")]
    Table(#[from] TableError),
    /// The trace backend fell over.
    #[error("trace failure: {0}")]
    Trace(#[from] TraceError),
    /// A location expression the evaluator cannot run.
    #[error("cannot evaluate location expression: {0}")]
    Expression(#[from] ExprError),
    /// A binary operation found fewer than two operands.
    #[error("location expression underflowed its operand stack")]
    ExprUnderflow,
    /// Evaluation finished with other than exactly one value.
    #[error("location expression left {depth} values on the stack")]
    ExprResidue { depth: usize },
    /// A CFA expression named a register instead of computing an address.
    #[error("CFA expression yielded a register, not an address")]
    CfaNotAddress,
    /// A register rule kind the checker cannot test dynamically.
    #[error("unimplemented register rule: {kind}")]
    UnimplementedRule { kind: &'static str },
    /// A DWARF register number with no name on this machine.
    #[error("no register {register} on {arch}")]
    UnknownRegister { register: u16, arch: Arch },
    /// Tables for different machines cannot be compared.
    #[error("cannot compare {left} and {right} unwind tables")]
    ArchMismatch { left: Arch, right: Arch },
}
