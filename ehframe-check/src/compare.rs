// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Static table-against-table comparison.
//!
//! Two builds of the same program should describe the same unwind rules
//! at the same program counters. This diffs compiled tables without
//! running anything: for every address where both tables have a row, the
//! register columns and (when they matter) the CFA rules must agree.

use std::collections::BTreeSet;
use std::fmt;

use ehframe::UnwindTable;
use tracing::debug;

use crate::CheckError;

/// Knobs for [`compare_tables`].
#[derive(Copy, Clone, Debug, Default)]
pub struct CompareOptions {
    /// Require exact rule equality. The default is lenient: a pair agrees
    /// whenever either side is `Undefined`, so a table that merely claims
    /// less is not a mismatch.
    pub strict: bool,
    /// Compare CFA rules even at rows where no register rule consumes the
    /// CFA.
    pub check_cfa: bool,
}

/// One disagreement between two tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mismatch {
    /// The row-start address where the tables disagree.
    pub pc: u64,
    /// The rendered report line.
    pub detail: String,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.detail)
    }
}

/// Diff two compiled tables.
///
/// Walks the ascending union of row-start addresses; addresses covered by
/// only one table are skipped, since coverage differences are claims of
/// *scope*, not conflicting claims about the same instruction. CFA rules
/// are diffed when `check_cfa` asks for it or some register rule at the
/// row (either side) is non-`Undefined` and would consume the CFA.
pub fn compare_tables(
    left: &UnwindTable,
    right: &UnwindTable,
    names: (&str, &str),
    options: CompareOptions,
) -> Result<Vec<Mismatch>, CheckError> {
    if left.arch() != right.arch() {
        return Err(CheckError::ArchMismatch {
            left: left.arch(),
            right: right.arch(),
        });
    }
    let arch = left.arch();

    let pcs: BTreeSet<u64> = left
        .rows()
        .chain(right.rows())
        .map(|row| row.base)
        .collect();

    let mut mismatches = Vec::new();
    for pc in pcs {
        let (Some(left_row), Some(right_row)) = (left.lookup(pc), right.lookup(pc)) else {
            continue;
        };
        debug!("pc={pc:x}");

        let columns: BTreeSet<u16> = left_row
            .register_order
            .iter()
            .chain(right_row.register_order.iter())
            .copied()
            .collect();

        let mut needs_cfa = options.check_cfa;
        for register in columns {
            let left_rule = left_row.rule_for(register);
            let right_rule = right_row.rule_for(register);
            needs_cfa |= !left_rule.is_undefined() || !right_rule.is_undefined();

            let agree = if options.strict {
                left_rule == right_rule
            } else {
                left_rule.is_undefined()
                    || right_rule.is_undefined()
                    || left_rule == right_rule
            };
            if !agree {
                mismatches.push(Mismatch {
                    pc,
                    detail: format!(
                        "Register rule mismatch at pc={pc:#x}: {} (in {}) vs {} (in {})",
                        left_rule.describe(arch),
                        names.0,
                        right_rule.describe(arch),
                        names.1,
                    ),
                });
            }
        }

        if needs_cfa && left_row.cfa != right_row.cfa {
            mismatches.push(Mismatch {
                pc,
                detail: format!(
                    "CFA rule mismatch at pc={pc:#x}: {} (in {}) vs {} (in {})",
                    left_row.cfa.describe(arch),
                    names.0,
                    right_row.cfa.describe(arch),
                    names.1,
                ),
            });
        }
    }
    Ok(mismatches)
}

#[cfg(test)]
mod test {
    use super::*;
    use ehframe_common::Arch;
    use ehframe_synth::{cfi, CieSpec, EhFrameSection};
    use gimli::RunTimeEndian;
    use test_assembler::Endian;

    const NAMES: (&str, &str) = ("a.elf", "b.elf");

    fn amd64_cie(initial_instructions: Vec<u8>) -> CieSpec {
        CieSpec {
            code_align: 1,
            data_align: -8,
            ra_register: 16,
            initial_instructions,
        }
    }

    fn standard_cie() -> CieSpec {
        amd64_cie([cfi::def_cfa(7, 8), cfi::offset(16, 1)].concat())
    }

    fn table_with(cie: CieSpec, fde_instructions: Vec<u8>) -> UnwindTable {
        let mut section = EhFrameSection::new();
        let cie = section.cie(cie);
        section.fde(cie, 0x1000, 0x20, fde_instructions);
        UnwindTable::parse_eh_frame(&section.finish(), 0, Arch::Amd64, RunTimeEndian::Little)
            .unwrap()
    }

    #[test]
    fn test_identical_tables_have_no_mismatches() {
        let left = table_with(standard_cie(), vec![]);
        let right = table_with(standard_cie(), vec![]);
        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert!(mismatches.is_empty());
    }

    #[test]
    fn test_lenient_tolerates_one_sided_undefined() {
        // Left also tracks rbp; right stays silent about it.
        let left = table_with(standard_cie(), cfi::offset(6, 2));
        let right = table_with(standard_cie(), vec![]);

        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert!(mismatches.is_empty());

        let strict = CompareOptions {
            strict: true,
            ..Default::default()
        };
        let mismatches = compare_tables(&left, &right, NAMES, strict).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(
            mismatches[0].detail,
            "Register rule mismatch at pc=0x1000: c-16 (in a.elf) vs u (in b.elf)"
        );
    }

    #[test]
    fn test_conflicting_rules_are_flagged_even_leniently() {
        let left = table_with(standard_cie(), vec![]);
        // Right moves the return address a word lower.
        let right = table_with(standard_cie(), cfi::offset(16, 2));

        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].pc, 0x1000);
        assert_eq!(
            mismatches[0].detail,
            "Register rule mismatch at pc=0x1000: c-8 (in a.elf) vs c-16 (in b.elf)"
        );
    }

    #[test]
    fn test_cfa_diff_is_gated_when_no_rule_consumes_it() {
        // Neither table defines any register rule, so nothing consumes
        // the CFA and the difference only matters on request.
        let left = table_with(amd64_cie(cfi::def_cfa(7, 8)), vec![]);
        let right = table_with(amd64_cie(cfi::def_cfa(7, 16)), vec![]);

        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert!(mismatches.is_empty());

        let with_cfa = CompareOptions {
            check_cfa: true,
            ..Default::default()
        };
        let mismatches = compare_tables(&left, &right, NAMES, with_cfa).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(
            mismatches[0].detail,
            "CFA rule mismatch at pc=0x1000: rsp+8 (in a.elf) vs rsp+16 (in b.elf)"
        );
    }

    #[test]
    fn test_cfa_diff_surfaces_when_a_rule_consumes_it() {
        let left = table_with(standard_cie(), vec![]);
        // Same rules, different CFA: the c-8 rule reads through the CFA,
        // so the difference is a real divergence without --cfa.
        let right = table_with(standard_cie(), cfi::def_cfa_offset(16));

        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(
            mismatches[0].detail,
            "CFA rule mismatch at pc=0x1000: rsp+8 (in a.elf) vs rsp+16 (in b.elf)"
        );
    }

    #[test]
    fn test_later_rows_compare_against_the_covering_row() {
        let left = table_with(
            standard_cie(),
            [cfi::advance_loc(0x10), cfi::def_cfa_offset(16)].concat(),
        );
        let right = table_with(standard_cie(), vec![]);

        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].pc, 0x1010);
        assert_eq!(
            mismatches[0].detail,
            "CFA rule mismatch at pc=0x1010: rsp+16 (in a.elf) vs rsp+8 (in b.elf)"
        );
    }

    #[test]
    fn test_disjoint_coverage_is_not_a_mismatch() {
        let left = table_with(standard_cie(), vec![]);
        let mut section = EhFrameSection::new();
        let cie = section.cie(standard_cie());
        section.fde(cie, 0x4000, 0x20, vec![]);
        let right =
            UnwindTable::parse_eh_frame(&section.finish(), 0, Arch::Amd64, RunTimeEndian::Little)
                .unwrap();

        let mismatches =
            compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap();
        assert!(mismatches.is_empty());
    }

    #[test]
    fn test_different_machines_cannot_be_compared() {
        let left = table_with(standard_cie(), vec![]);
        let mut section = EhFrameSection::with_format(Endian::Big, 4);
        let cie = section.cie(CieSpec {
            code_align: 4,
            data_align: -4,
            ra_register: 65,
            initial_instructions: cfi::def_cfa(1, 0),
        });
        section.fde(cie, 0x1000, 0x20, vec![]);
        let right =
            UnwindTable::parse_eh_frame(&section.finish(), 0, Arch::Ppc, RunTimeEndian::Big)
                .unwrap();

        let err = compare_tables(&left, &right, NAMES, CompareOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CheckError::ArchMismatch {
                left: Arch::Amd64,
                right: Arch::Ppc,
            }
        ));
    }
}
