// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Compiling `.eh_frame` into a queryable table of unwind rows.
//!
//! The structural work (CIE/FDE framing, call-frame instruction execution)
//! is gimli's; this module materialises every row each FDE describes,
//! converts the rules into the crate's own types with expressions decoded
//! up front, and indexes the rows by their half-open PC range.

use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::path::Path;

use gimli::{
    BaseAddresses, CfaRule as GimliCfaRule, CieOrFde, EhFrame, EndianSlice,
    RegisterRule as GimliRegisterRule, RunTimeEndian, UnwindContext,
    UnwindExpression, UnwindSection,
};
use memmap2::Mmap;
use object::{Object, ObjectSection};
use tracing::{debug, warn};

use crate::range_map::{RangeError, RangeMap};
use crate::rules::{CfaRule, ExprProgram, RegRule};
use ehframe_common::Arch;

type EhReader<'data> = EndianSlice<'data, RunTimeEndian>;

/// Things that can go wrong turning an input into a table.
#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("failed to read input file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse object file")]
    Object(#[from] object::Error),
    #[error("malformed call frame information")]
    CallFrame(#[from] gimli::Error),
    #[error("input has no .eh_frame section")]
    MissingUnwindInfo,
    #[error("unsupported architecture {0:?}")]
    UnsupportedArchitecture(object::Architecture),
    #[error("expression bytes fall outside the section")]
    ExpressionOutOfBounds,
    #[error("unsupported register rule {0}")]
    UnsupportedRegisterRule(String),
}

/// One row of an unwind table: for every PC in `[base, top)`, how to
/// compute the CFA and where each tracked register's caller value lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnwindRow {
    pub base: u64,
    pub top: u64,
    pub cfa: CfaRule,
    /// Explicit register rules, sorted by register number. Registers not
    /// listed are [`RegRule::Undefined`].
    pub rules: Vec<(u16, RegRule)>,
    /// Column layout shared by every row of the owning FDE: each register
    /// any rule instruction in the CIE or FDE program mentions, ascending,
    /// with the return-address column moved to the end. Stable across rows
    /// even where a register's rule is `Undefined`.
    pub register_order: Vec<u16>,
    /// The CIE's return-address column.
    pub ra_register: u16,
    /// The owning FDE's initial location, for reporting.
    pub fde_start: u64,
}

impl UnwindRow {
    /// The rule for `register`, `Undefined` when the row makes no claim.
    pub fn rule_for(&self, register: u16) -> &RegRule {
        static UNDEFINED: RegRule = RegRule::Undefined;
        match self.rules.binary_search_by_key(&register, |(reg, _)| *reg) {
            Ok(index) => &self.rules[index].1,
            Err(_) => &UNDEFINED,
        }
    }

    /// The rule for the return-address column.
    pub fn ra_rule(&self) -> &RegRule {
        self.rule_for(self.ra_register)
    }
}

/// A compiled unwind table for one object file.
#[derive(Clone, Debug)]
pub struct UnwindTable {
    arch: Arch,
    entries: RangeMap<UnwindRow>,
}

impl UnwindTable {
    /// Compile a table straight from `.eh_frame` section bytes.
    ///
    /// `section_addr` is the address the section claims to live at; PC
    /// ranges come out in the same address space.
    pub fn parse_eh_frame(
        data: &[u8],
        section_addr: u64,
        arch: Arch,
        endian: RunTimeEndian,
    ) -> Result<UnwindTable, TableError> {
        let mut entries = RangeMap::new();
        compile_into(&mut entries, data, section_addr, arch, endian)?;
        debug!("compiled {} unwind rows for {}", entries.len(), arch);
        Ok(UnwindTable { arch, entries })
    }

    /// Compile the table of an in-memory ELF image.
    pub fn from_object_bytes(data: &[u8]) -> Result<UnwindTable, TableError> {
        let obj = object::File::parse(data)?;
        let arch = arch_of(&obj)?;
        let endian = if obj.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };
        let section = obj
            .section_by_name(".eh_frame")
            .ok_or(TableError::MissingUnwindInfo)?;
        let section_addr = section.address();
        let bytes = section.data()?;
        Self::parse_eh_frame(bytes, section_addr, arch, endian)
    }

    /// Map an ELF file and compile its table.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<UnwindTable, TableError> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::from_object_bytes(&mmap)
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The row covering `pc`, if any FDE maps it.
    pub fn lookup(&self, pc: u64) -> Option<&UnwindRow> {
        self.entries.lookup(pc)
    }

    /// All rows in ascending PC order.
    pub fn rows(&self) -> impl Iterator<Item = &UnwindRow> {
        self.entries.iter().map(|(_, row)| row)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn arch_of(obj: &object::File) -> Result<Arch, TableError> {
    match obj.architecture() {
        object::Architecture::I386 => Ok(Arch::X86),
        object::Architecture::X86_64 => Ok(Arch::Amd64),
        object::Architecture::PowerPc => Ok(Arch::Ppc),
        other => Err(TableError::UnsupportedArchitecture(other)),
    }
}

fn compile_into(
    entries: &mut RangeMap<UnwindRow>,
    data: &[u8],
    section_addr: u64,
    arch: Arch,
    endian: RunTimeEndian,
) -> Result<(), TableError> {
    let mut eh_frame = EhFrame::new(data, endian);
    eh_frame.set_address_size(arch.word_size() as u8);
    let bases = BaseAddresses::default().set_eh_frame(section_addr);

    let mut ctx = UnwindContext::new();
    let mut cies = HashMap::new();
    let mut iter = eh_frame.entries(&bases);
    while let Some(entry) = iter.next()? {
        match entry {
            CieOrFde::Cie(cie) => {
                cies.insert(cie.offset(), cie);
            }
            CieOrFde::Fde(partial) => {
                let fde = partial.parse(|_, bases, offset| {
                    cies.get(&offset.0).cloned().map(Ok).unwrap_or_else(|| {
                        eh_frame.cie_from_offset(bases, offset)
                    })
                })?;
                compile_fde(entries, &eh_frame, &bases, &mut ctx, &fde, data)?;
            }
        }
    }
    Ok(())
}

fn compile_fde(
    entries: &mut RangeMap<UnwindRow>,
    eh_frame: &EhFrame<EhReader<'_>>,
    bases: &BaseAddresses,
    ctx: &mut UnwindContext<usize>,
    fde: &gimli::FrameDescriptionEntry<EhReader<'_>>,
    data: &[u8],
) -> Result<(), TableError> {
    let fde_start = fde.initial_address();
    let fde_len = fde.len();
    if fde_len == 0 {
        debug!("skipping zero-length FDE at {:#x}", fde_start);
        return Ok(());
    }
    let fde_end = fde_start.wrapping_add(fde_len);
    let ra_register = fde.cie().return_address_register().0;

    // The column layout has to be stable across the FDE's rows, including
    // registers whose only rule anywhere is Undefined, so it comes from the
    // instruction streams rather than from the materialised rows.
    let mut targets = BTreeSet::new();
    collect_rule_targets(fde.cie().instructions(eh_frame, bases), &mut targets)?;
    collect_rule_targets(fde.instructions(eh_frame, bases), &mut targets)?;
    let mut register_order: Vec<u16> = targets
        .into_iter()
        .filter(|&reg| reg != ra_register)
        .collect();
    register_order.push(ra_register);

    let mut rows = Vec::new();
    let mut table = fde.rows(eh_frame, bases, ctx)?;
    while let Some(row) = table.next_row()? {
        let cfa = convert_cfa(row.cfa(), data)?;
        let mut rules = Vec::new();
        for (reg, rule) in row.registers() {
            rules.push((reg.0, convert_reg_rule(rule, data)?));
        }
        rules.sort_by_key(|(reg, _)| *reg);
        rows.push(UnwindRow {
            base: row.start_address(),
            top: row.end_address(),
            cfa,
            rules,
            register_order: register_order.clone(),
            ra_register,
            fde_start,
        });
    }

    // Rows must tile [initial_location, initial_location + address_range)
    // exactly; the final row runs to the FDE's end.
    if let Some(last) = rows.last_mut() {
        last.top = fde_end;
    }

    for row in rows {
        let range = (row.base, row.top);
        match entries.insert(range, row) {
            Ok(()) => {}
            Err(RangeError::Empty) => {
                debug!("skipping empty unwind row at {:#x}", range.0);
            }
            Err(RangeError::Overlap) => {
                warn!(
                    "dropping unwind row {:#x}..{:#x} (fde at {:#x}) overlapping an earlier FDE",
                    range.0, range.1, fde_start
                );
            }
        }
    }
    Ok(())
}

/// Record every register whose *rule* an instruction stream touches. CFA
/// base registers are not rule columns and stay out.
fn collect_rule_targets(
    mut iter: gimli::CallFrameInstructionIter<'_, EhReader<'_>>,
    targets: &mut BTreeSet<u16>,
) -> Result<(), gimli::Error> {
    use gimli::CallFrameInstruction::*;
    while let Some(instruction) = iter.next()? {
        match instruction {
            Undefined { register }
            | SameValue { register }
            | Offset { register, .. }
            | OffsetExtendedSf { register, .. }
            | ValOffset { register, .. }
            | ValOffsetSf { register, .. }
            | Expression { register, .. }
            | ValExpression { register, .. }
            | Restore { register } => {
                targets.insert(register.0);
            }
            Register { dest_register, .. } => {
                targets.insert(dest_register.0);
            }
            _ => {}
        }
    }
    Ok(())
}

fn convert_cfa(
    rule: &GimliCfaRule<usize>,
    data: &[u8],
) -> Result<CfaRule, TableError> {
    Ok(match rule {
        GimliCfaRule::RegisterAndOffset { register, offset } => {
            CfaRule::RegisterOffset {
                register: register.0,
                offset: *offset,
            }
        }
        GimliCfaRule::Expression(expr) => {
            CfaRule::Expression(decode_expression(expr, data)?)
        }
    })
}

fn convert_reg_rule(
    rule: &GimliRegisterRule<usize>,
    data: &[u8],
) -> Result<RegRule, TableError> {
    Ok(match rule {
        GimliRegisterRule::Undefined => RegRule::Undefined,
        GimliRegisterRule::SameValue => RegRule::SameValue,
        GimliRegisterRule::Offset(offset) => RegRule::Offset(*offset),
        GimliRegisterRule::ValOffset(offset) => RegRule::ValOffset(*offset),
        GimliRegisterRule::Register(reg) => RegRule::Register(reg.0),
        GimliRegisterRule::Expression(expr) => {
            RegRule::Expression(decode_expression(expr, data)?)
        }
        GimliRegisterRule::ValExpression(expr) => {
            RegRule::ValExpression(decode_expression(expr, data)?)
        }
        GimliRegisterRule::Architectural => RegRule::Architectural,
        other => {
            return Err(TableError::UnsupportedRegisterRule(format!(
                "{other:?}"
            )))
        }
    })
}

fn decode_expression(
    expr: &UnwindExpression<usize>,
    data: &[u8],
) -> Result<ExprProgram, TableError> {
    let bytes = expr
        .offset
        .checked_add(expr.length)
        .and_then(|end| data.get(expr.offset..end))
        .ok_or(TableError::ExpressionOutOfBounds)?;
    Ok(ExprProgram::decode(bytes)?)
}
