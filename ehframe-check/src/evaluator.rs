// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Interpreter for the location expressions compiled tables carry.
//!
//! The machine is an explicit operand stack of `u64`, fresh per
//! evaluation. Registers are read through the [`Tracer`] at evaluation
//! time, so the same expression yields different values at different
//! stops; nothing else about the tracee is touched and nothing is cached.

use crate::tracer::Tracer;
use crate::CheckError;
use ehframe::{CfaRule, ExprError, ExprOp, ExprProgram, RegRule};
use ehframe_common::{Arch, RaLocation};

/// What a location expression evaluates to.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExprValue {
    /// A computed number, usually an address.
    Int(u64),
    /// The value lives in this DWARF-numbered register.
    Register(u16),
}

/// Run one expression against the tracee's current registers.
///
/// A program that is exactly `DW_OP_reg<N>` names a register rather than
/// computing anything and comes back as [`ExprValue::Register`]; everything
/// else must leave exactly one value on the stack.
pub fn evaluate(
    program: &ExprProgram,
    arch: Arch,
    tracer: &mut dyn Tracer,
) -> Result<ExprValue, CheckError> {
    let ops = program.ops()?;
    if let [ExprOp::Reg(register)] = ops {
        return Ok(ExprValue::Register(*register));
    }

    let mut stack: Vec<u64> = Vec::with_capacity(ops.len());
    for op in ops {
        match *op {
            ExprOp::RegOffset { register, offset } => {
                let base = read_numbered(register, arch, tracer)?;
                stack.push(base.wrapping_add_signed(offset));
            }
            ExprOp::Lit(value) => stack.push(value),
            ExprOp::Plus => apply(&mut stack, |lhs, rhs| lhs.wrapping_add(rhs))?,
            ExprOp::And => apply(&mut stack, |lhs, rhs| lhs & rhs)?,
            ExprOp::Shl => apply(&mut stack, |lhs, rhs| lhs.wrapping_shl(rhs as u32))?,
            ExprOp::Ge => apply(&mut stack, |lhs, rhs| u64::from(lhs >= rhs))?,
            // decode() rejects these inside larger programs already.
            ExprOp::Reg(register) => {
                return Err(ExprError::MisplacedReg { register }.into());
            }
        }
    }

    match stack.as_slice() {
        [value] => Ok(ExprValue::Int(*value)),
        rest => Err(CheckError::ExprResidue { depth: rest.len() }),
    }
}

/// Compute the canonical frame address for one row at the current stop.
pub fn eval_cfa(
    cfa: &CfaRule,
    arch: Arch,
    tracer: &mut dyn Tracer,
) -> Result<u64, CheckError> {
    match cfa {
        CfaRule::RegisterOffset { register, offset } => {
            let base = read_numbered(*register, arch, tracer)?;
            Ok(base.wrapping_add_signed(*offset))
        }
        CfaRule::Expression(program) => match evaluate(program, arch, tracer)? {
            ExprValue::Int(value) => Ok(value),
            ExprValue::Register(_) => Err(CheckError::CfaNotAddress),
        },
    }
}

/// Where a row says the return address lives, given its CFA.
///
/// `Offset` is the one rule compilers emit for the return-address column;
/// `Undefined` means the row makes no claim and the caller auto-passes.
/// Any other kind here is real table content the checker cannot judge, so
/// it fails loudly rather than guessing.
pub fn eval_ra_rule(rule: &RegRule, cfa: u64) -> Result<Option<RaLocation>, CheckError> {
    match rule {
        RegRule::Undefined => Ok(None),
        RegRule::Offset(offset) => {
            Ok(Some(RaLocation::Address(cfa.wrapping_add_signed(*offset))))
        }
        other => Err(CheckError::UnimplementedRule { kind: other.kind() }),
    }
}

fn read_numbered(
    register: u16,
    arch: Arch,
    tracer: &mut dyn Tracer,
) -> Result<u64, CheckError> {
    let name = arch
        .register_name(register)
        .ok_or(CheckError::UnknownRegister { register, arch })?;
    Ok(tracer.read_register(name)?)
}

fn apply(
    stack: &mut Vec<u64>,
    op: impl FnOnce(u64, u64) -> u64,
) -> Result<(), CheckError> {
    // First pop is the most recent push: the right-hand operand.
    let rhs = stack.pop().ok_or(CheckError::ExprUnderflow)?;
    let lhs = stack.pop().ok_or(CheckError::ExprUnderflow)?;
    stack.push(op(lhs, rhs));
    Ok(())
}
