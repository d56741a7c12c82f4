// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Unwind rules and the DWARF location expressions they may carry.
//!
//! Expression bytes are decoded exactly once, when a table is compiled, into
//! the closed [`ExprOp`] set. An expression using anything outside that set
//! still produces a table entry (the raw bytes are kept so tables can be
//! compared and dumped), but it carries its defect with it and evaluating
//! the rule later reports the offending opcode instead of guessing at its
//! semantics.

use ehframe_common::Arch;
use gimli::{EndianSlice, LittleEndian, Reader};
use std::fmt;

const OP_LIT0: u8 = gimli::constants::DW_OP_lit0.0;
const OP_LIT31: u8 = gimli::constants::DW_OP_lit31.0;
const OP_REG0: u8 = gimli::constants::DW_OP_reg0.0;
const OP_REG31: u8 = gimli::constants::DW_OP_reg31.0;
const OP_BREG0: u8 = gimli::constants::DW_OP_breg0.0;
const OP_BREG31: u8 = gimli::constants::DW_OP_breg31.0;
const OP_AND: u8 = gimli::constants::DW_OP_and.0;
const OP_PLUS: u8 = gimli::constants::DW_OP_plus.0;
const OP_SHL: u8 = gimli::constants::DW_OP_shl.0;
const OP_GE: u8 = gimli::constants::DW_OP_ge.0;

/// The DWARF opcode name for diagnostics, `DW_OP_...` when gimli knows it.
fn op_name(opcode: u8) -> &'static str {
    gimli::constants::DwOp(opcode)
        .static_string()
        .unwrap_or("unknown")
}

/// A defect recorded at decode time and reported when the expression is
/// actually used.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExprError {
    /// An opcode outside the supported set. Operand widths of unknown
    /// opcodes are unknowable, so decoding stops at the first one.
    #[error("unsupported DWARF expression opcode {opcode:#04x} ({})", op_name(*opcode))]
    Unsupported { opcode: u8 },
    /// `DW_OP_reg<N>` names a whole location; inside a larger computation
    /// it pushes nothing and the expression is malformed.
    #[error("DW_OP_reg{register} used inside a computation")]
    MisplacedReg { register: u16 },
}

/// One decoded operation of a location expression.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExprOp {
    /// `DW_OP_breg<N>`: push register N plus a signed offset.
    RegOffset { register: u16, offset: i64 },
    /// `DW_OP_lit<N>`: push the literal N embedded in the opcode.
    Lit(u64),
    /// `DW_OP_plus`: pop two, push the wrapping sum.
    Plus,
    /// `DW_OP_and`: pop two, push the bitwise and.
    And,
    /// `DW_OP_shl`: pop count then value, push `value << count`.
    Shl,
    /// `DW_OP_ge`: pop rhs then lhs, push 1 if `lhs >= rhs` else 0.
    Ge,
    /// `DW_OP_reg<N>`: the value lives in register N. Only legal as the
    /// sole operation of a program.
    Reg(u16),
}

/// A location expression: the raw bytes plus their one-time decode.
///
/// Equality is over the raw bytes, so two tables can be diffed without
/// caring whether either side decoded cleanly.
#[derive(Clone, Debug)]
pub struct ExprProgram {
    raw: Vec<u8>,
    decoded: Result<Vec<ExprOp>, ExprError>,
}

impl ExprProgram {
    /// Decode `bytes`. Truncated operands are malformed input and fail
    /// here; an unsupported opcode is carried in the result instead, to
    /// surface if and when the expression is evaluated.
    pub fn decode(bytes: &[u8]) -> Result<ExprProgram, gimli::Error> {
        // Only u8 and LEB128 reads happen here, so the endianness of the
        // slice never matters.
        let mut reader = EndianSlice::new(bytes, LittleEndian);
        let mut ops = Vec::new();
        let mut defect = None;
        while !reader.is_empty() {
            let opcode = reader.read_u8()?;
            let op = match opcode {
                OP_LIT0..=OP_LIT31 => ExprOp::Lit((opcode - OP_LIT0) as u64),
                OP_REG0..=OP_REG31 => ExprOp::Reg((opcode - OP_REG0) as u16),
                OP_BREG0..=OP_BREG31 => {
                    let offset = reader.read_sleb128()?;
                    ExprOp::RegOffset {
                        register: (opcode - OP_BREG0) as u16,
                        offset,
                    }
                }
                OP_AND => ExprOp::And,
                OP_PLUS => ExprOp::Plus,
                OP_SHL => ExprOp::Shl,
                OP_GE => ExprOp::Ge,
                opcode => {
                    defect = Some(ExprError::Unsupported { opcode });
                    break;
                }
            };
            ops.push(op);
        }
        if defect.is_none() && ops.len() > 1 {
            if let Some(ExprOp::Reg(register)) =
                ops.iter().find(|op| matches!(op, ExprOp::Reg(_)))
            {
                defect = Some(ExprError::MisplacedReg {
                    register: *register,
                });
            }
        }
        Ok(ExprProgram {
            raw: bytes.to_vec(),
            decoded: match defect {
                Some(err) => Err(err),
                None => Ok(ops),
            },
        })
    }

    /// The decoded operations, or the defect found at decode time.
    pub fn ops(&self) -> Result<&[ExprOp], ExprError> {
        match &self.decoded {
            Ok(ops) => Ok(ops),
            Err(err) => Err(*err),
        }
    }

    /// The undecoded expression bytes.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

impl PartialEq for ExprProgram {
    fn eq(&self, other: &ExprProgram) -> bool {
        self.raw == other.raw
    }
}

impl Eq for ExprProgram {}

/// How to compute the canonical frame address at some PC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CfaRule {
    /// CFA = register + offset.
    RegisterOffset { register: u16, offset: i64 },
    /// CFA = the expression's value.
    Expression(ExprProgram),
}

impl CfaRule {
    /// Render readelf-style: `rsp+8`, `r1+0`, or `exp`.
    pub fn describe(&self, arch: Arch) -> String {
        match self {
            CfaRule::RegisterOffset { register, offset } => {
                format!("{}{offset:+}", arch.describe_register(*register))
            }
            CfaRule::Expression(_) => "exp".to_string(),
        }
    }
}

/// How to recover one register's caller-frame value at some PC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegRule {
    /// Not recoverable; no claim is made.
    Undefined,
    /// The register still holds its caller value.
    SameValue,
    /// Saved at CFA + offset.
    Offset(i64),
    /// The caller value *is* CFA + offset, not a load from it.
    ValOffset(i64),
    /// Moved into another register.
    Register(u16),
    /// Saved at the address the expression computes.
    Expression(ExprProgram),
    /// The caller value is the expression's value.
    ValExpression(ExprProgram),
    /// Recovery is defined by the ABI, outside the table.
    Architectural,
}

impl RegRule {
    pub fn is_undefined(&self) -> bool {
        matches!(self, RegRule::Undefined)
    }

    /// Whether applying this rule consumes the row's CFA.
    pub fn uses_cfa(&self) -> bool {
        matches!(
            self,
            RegRule::Offset(_)
                | RegRule::ValOffset(_)
                | RegRule::Expression(_)
                | RegRule::ValExpression(_)
        )
    }

    /// The rule kind for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            RegRule::Undefined => "undefined",
            RegRule::SameValue => "same-value",
            RegRule::Offset(_) => "offset",
            RegRule::ValOffset(_) => "val-offset",
            RegRule::Register(_) => "register",
            RegRule::Expression(_) => "expression",
            RegRule::ValExpression(_) => "val-expression",
            RegRule::Architectural => "architectural",
        }
    }

    /// Render readelf-style: `u`, `s`, `c-8`, `v+0`, a register name,
    /// `exp`, `vexp`, or `a`.
    pub fn describe(&self, arch: Arch) -> String {
        match self {
            RegRule::Undefined => "u".to_string(),
            RegRule::SameValue => "s".to_string(),
            RegRule::Offset(offset) => format!("c{offset:+}"),
            RegRule::ValOffset(offset) => format!("v{offset:+}"),
            RegRule::Register(register) => arch.describe_register(*register),
            RegRule::Expression(_) => "exp".to_string(),
            RegRule::ValExpression(_) => "vexp".to_string(),
            RegRule::Architectural => "a".to_string(),
        }
    }
}

impl fmt::Display for ExprOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExprOp::RegOffset { register, offset } => {
                write!(f, "breg{register}{offset:+}")
            }
            ExprOp::Lit(n) => write!(f, "lit{n}"),
            ExprOp::Plus => f.write_str("plus"),
            ExprOp::And => f.write_str("and"),
            ExprOp::Shl => f.write_str("shl"),
            ExprOp::Ge => f.write_str("ge"),
            ExprOp::Reg(n) => write!(f, "reg{n}"),
        }
    }
}
