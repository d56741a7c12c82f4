// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The stepping loop that checks a table against a run.
//!
//! At every stop the table is asked where the return address should be
//! and the oracle where it really is. The two agreeing at every covered
//! instruction of a complete run is the property this whole workspace
//! exists to check.

use std::fmt;

use ehframe::UnwindTable;
use ehframe_common::{Arch, RaLocation};
use tracing::{debug, trace};

use crate::evaluator::{eval_cfa, eval_ra_rule};
use crate::oracle::{self, OracleStep, ReturnAddressOracle};
use crate::symbolizer::Symbolizer;
use crate::tracer::{StepOutcome, Tracer};
use crate::CheckError;

/// Counters for one run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationStats {
    /// Instructions observed.
    pub steps: u64,
    /// Stops where table and oracle were actually compared.
    pub checked: u64,
    /// Stops outside any unwind row.
    pub skipped: u64,
    /// Stops whose row leaves the return address undefined.
    pub unconstrained: u64,
}

/// A stop where the table and the oracle disagreed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Divergence {
    pub arch: Arch,
    /// The program counter of the disagreeing stop.
    pub pc: u64,
    /// Initial location of the FDE whose row made the claim.
    pub fde_start: u64,
    /// Where the table says the return address is.
    pub table: RaLocation,
    /// Where it really is.
    pub oracle: RaLocation,
}

impl Divergence {
    /// The mismatch block as it is reported.
    pub fn describe(&self) -> String {
        format!(
            "eh_frame mismatch at {:#x} (fde {:#x})\n | table:  {}\n | oracle: {}",
            self.pc,
            self.fde_start,
            self.table.describe(self.arch),
            self.oracle.describe(self.arch),
        )
    }
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Every checked stop agreed and the run ended on its own terms:
    /// the tracked top frame returned, or the debuggee exited.
    Completed(ValidationStats),
    /// Table and oracle disagreed. Nothing past this stop was checked;
    /// unwind state is untrustworthy from here on.
    Aborted(Divergence),
}

/// One validation session over one debuggee.
pub struct Validator<T: Tracer> {
    arch: Arch,
    table: UnwindTable,
    symbolizer: Symbolizer,
    oracle: Box<dyn ReturnAddressOracle>,
    tracer: T,
    stats: ValidationStats,
}

impl<T: Tracer> Validator<T> {
    /// Run the debuggee to its entry point and set up a session: modules
    /// seed the symbolizer, and the oracle reads its entry state.
    pub fn new(
        table: UnwindTable,
        mut symbolizer: Symbolizer,
        mut tracer: T,
    ) -> Result<Validator<T>, CheckError> {
        tracer.run_to_entry()?;
        symbolizer.add_modules(tracer.loaded_modules()?);
        let arch = table.arch();
        let oracle = oracle::for_arch(arch, &mut tracer)?;
        Ok(Validator {
            arch,
            table,
            symbolizer,
            oracle,
            tracer,
            stats: ValidationStats::default(),
        })
    }

    /// Step until the run completes or the first divergence.
    ///
    /// Absorbed conditions (coverage gaps, undefined return-address rules)
    /// are counted and stepped past. Backend failures and table content
    /// the evaluator cannot judge are fatal.
    pub fn run(mut self) -> Result<Verdict, CheckError> {
        loop {
            let pc = self.tracer.instruction_pointer()?;
            let func = self.symbolizer.resolve(pc);
            let insn = self.tracer.disassemble()?;
            trace!("=> {pc:#x} [{func}] ({} {})", insn.mnemonic, insn.operands);
            self.stats.steps += 1;

            match self.table.lookup(pc) {
                None => {
                    debug!("no unwind row covers {pc:#x} [SKIPPED]");
                    self.stats.skipped += 1;
                }
                Some(row) => {
                    let cfa = eval_cfa(&row.cfa, self.arch, &mut self.tracer)?;
                    match eval_ra_rule(row.ra_rule(), cfa)? {
                        None => self.stats.unconstrained += 1,
                        Some(predicted) => {
                            self.stats.checked += 1;
                            let actual = self.oracle.location();
                            if predicted != actual {
                                return Ok(Verdict::Aborted(Divergence {
                                    arch: self.arch,
                                    pc,
                                    fde_start: row.fde_start,
                                    table: predicted,
                                    oracle: actual,
                                }));
                            }
                        }
                    }
                }
            }

            if self.oracle.observe(&insn, &mut self.tracer)? == OracleStep::ReturnedFromTop {
                return Ok(Verdict::Completed(self.stats));
            }
            if self.tracer.step()? == StepOutcome::Exited {
                return Ok(Verdict::Completed(self.stats));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::symbolizer::MapSymbolSupplier;
    use crate::testing::ScriptedTracer;
    use ehframe_synth::{cfi, expr, CieSpec, EhFrameSection};
    use gimli::RunTimeEndian;
    use test_assembler::Endian;

    const SP: u64 = 0x7fff_e8b0;
    const R1: u64 = 0xbfff_f000;

    fn amd64_cie() -> CieSpec {
        // CFA = rsp+8, return address saved at CFA-8.
        CieSpec {
            code_align: 1,
            data_align: -8,
            ra_register: 16,
            initial_instructions: [cfi::def_cfa(7, 8), cfi::offset(16, 1)].concat(),
        }
    }

    fn amd64_table(section: EhFrameSection) -> UnwindTable {
        UnwindTable::parse_eh_frame(
            &section.finish(),
            0,
            Arch::Amd64,
            RunTimeEndian::Little,
        )
        .unwrap()
    }

    fn run(table: UnwindTable, tracer: ScriptedTracer) -> Result<Verdict, CheckError> {
        let symbolizer = Symbolizer::new(MapSymbolSupplier::new());
        Validator::new(table, symbolizer, tracer)?.run()
    }

    #[test]
    fn test_clean_call_and_return() {
        let mut section = EhFrameSection::new();
        let cie = section.cie(amd64_cie());
        section.fde(cie, 0x1000, 0x20, vec![]);
        section.fde(cie, 0x2000, 0x10, vec![]);
        let table = amd64_table(section);

        let tracer = ScriptedTracer::new()
            .stop(0x1000, SP, &[], "callq 0x2000")
            .stop(0x2000, SP - 8, &[], "nop")
            .stop(0x2001, SP - 8, &[], "ret")
            .stop(0x1005, SP, &[], "ret");

        match run(table, tracer).unwrap() {
            Verdict::Completed(stats) => {
                assert_eq!(
                    stats,
                    ValidationStats {
                        steps: 4,
                        checked: 4,
                        skipped: 0,
                        unconstrained: 0,
                    }
                );
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_bad_row_aborts_with_both_locations() {
        let mut section = EhFrameSection::new();
        let cie = section.cie(amd64_cie());
        section.fde(cie, 0x1000, 0x20, vec![]);
        // The callee's row claims the slot one word too low.
        section.fde(cie, 0x2000, 0x10, cfi::offset(16, 2));
        let table = amd64_table(section);

        let tracer = ScriptedTracer::new()
            .stop(0x1000, SP, &[], "callq 0x2000")
            .stop(0x2000, SP - 8, &[], "nop");

        match run(table, tracer).unwrap() {
            Verdict::Aborted(divergence) => {
                assert_eq!(
                    divergence,
                    Divergence {
                        arch: Arch::Amd64,
                        pc: 0x2000,
                        fde_start: 0x2000,
                        table: RaLocation::Address(SP - 16),
                        oracle: RaLocation::Address(SP - 8),
                    }
                );
                assert_eq!(
                    divergence.to_string(),
                    "eh_frame mismatch at 0x2000 (fde 0x2000)\n\
                     \x20| table:  0x000000007fffe8a0\n\
                     \x20| oracle: 0x000000007fffe8a8"
                );
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_row_going_stale_mid_function_aborts_at_the_ret() {
        let mut section = EhFrameSection::new();
        let cie = section.cie(amd64_cie());
        // From +0x10 on, the table claims the frame grew; nothing on the
        // scripted stack agrees.
        section.fde(
            cie,
            0x1000,
            0x20,
            [cfi::advance_loc(0x10), cfi::def_cfa_offset(16)].concat(),
        );
        let table = amd64_table(section);

        let tracer = ScriptedTracer::new()
            .stop(0x1000, SP, &[], "nop")
            .stop(0x1010, SP, &[], "ret");

        match run(table, tracer).unwrap() {
            Verdict::Aborted(divergence) => {
                assert_eq!(divergence.pc, 0x1010);
                assert_eq!(divergence.fde_start, 0x1000);
                assert_eq!(divergence.table, RaLocation::Address(SP + 8));
                assert_eq!(divergence.oracle, RaLocation::Address(SP));
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_uncovered_stops_are_skipped_not_fatal() {
        let mut section = EhFrameSection::new();
        let cie = section.cie(amd64_cie());
        section.fde(cie, 0x1000, 0x20, vec![]);
        let table = amd64_table(section);

        // First stop is outside every FDE; the run keeps going and the
        // next covered stop still gets checked.
        let tracer = ScriptedTracer::new()
            .stop(0x5000, SP, &[], "nop")
            .stop(0x1000, SP, &[], "ret");

        match run(table, tracer).unwrap() {
            Verdict::Completed(stats) => {
                assert_eq!(stats.steps, 2);
                assert_eq!(stats.skipped, 1);
                assert_eq!(stats.checked, 1);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_undefined_return_address_auto_passes() {
        let mut section = EhFrameSection::new();
        // No rule for the return-address column at all.
        let cie = section.cie(CieSpec {
            code_align: 1,
            data_align: -8,
            ra_register: 16,
            initial_instructions: cfi::def_cfa(7, 8),
        });
        section.fde(cie, 0x1000, 0x20, vec![]);
        let table = amd64_table(section);

        let tracer = ScriptedTracer::new().stop(0x1000, SP, &[], "nop");

        match run(table, tracer).unwrap() {
            Verdict::Completed(stats) => {
                assert_eq!(stats.steps, 1);
                assert_eq!(stats.unconstrained, 1);
                assert_eq!(stats.checked, 0);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_lazy_plt_push_agrees_through_the_window() {
        let mut section = EhFrameSection::new();
        let cie = section.cie(amd64_cie());
        // The PLT shape: CFA accounts for the extra pushed word purely by
        // pc alignment, and the oracle's grace window covers the stop
        // right after the push.
        section.fde(
            cie,
            0x1000,
            0x10,
            cfi::def_cfa_expression(&expr::plt_cfa_x64()),
        );
        let table = amd64_table(section);

        let tracer = ScriptedTracer::new()
            // pc & 15 == 0: CFA = rsp+8.
            .stop(0x1000, SP, &[], "pushq 0x2fe2(%rip)")
            // pc & 15 == 11: CFA = rsp+16, one word deeper.
            .stop(0x100b, SP - 8, &[], "nop");

        match run(table, tracer).unwrap() {
            Verdict::Completed(stats) => {
                assert_eq!(stats.steps, 2);
                assert_eq!(stats.checked, 2);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_ppc_prologue_checks_after_the_spill() {
        let mut section = EhFrameSection::with_format(Endian::Big, 4);
        let cie = section.cie(CieSpec {
            code_align: 4,
            data_align: -4,
            ra_register: 65,
            initial_instructions: cfi::def_cfa(1, 0),
        });
        // After two instructions the link register is saved at CFA+8.
        section.fde(
            cie,
            0x1000_0400,
            0x20,
            [cfi::advance_loc(2), cfi::offset_extended_sf(65, -2)].concat(),
        );
        let table = UnwindTable::parse_eh_frame(
            &section.finish(),
            0,
            Arch::Ppc,
            RunTimeEndian::Big,
        )
        .unwrap();

        let tracer = ScriptedTracer::for_arch(Arch::Ppc)
            .stop(0x1000_0400, R1, &[], "mflr r0")
            .stop(0x1000_0404, R1, &[], "stw r0,8(r1)")
            .stop(0x1000_0408, R1, &[], "nop");

        match run(table, tracer).unwrap() {
            Verdict::Completed(stats) => {
                assert_eq!(stats.steps, 3);
                assert_eq!(stats.unconstrained, 2);
                assert_eq!(stats.checked, 1);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn test_address_claim_against_register_reality_is_a_divergence() {
        let mut section = EhFrameSection::with_format(Endian::Big, 4);
        let cie = section.cie(CieSpec {
            code_align: 4,
            data_align: -4,
            ra_register: 65,
            // Claims a stack slot from the first instruction on, while
            // the return address is still in a register.
            initial_instructions: [cfi::def_cfa(1, 0), cfi::offset_extended_sf(65, -2)]
                .concat(),
        });
        section.fde(cie, 0x1000_0400, 0x20, vec![]);
        let table = UnwindTable::parse_eh_frame(
            &section.finish(),
            0,
            Arch::Ppc,
            RunTimeEndian::Big,
        )
        .unwrap();

        let tracer = ScriptedTracer::for_arch(Arch::Ppc).stop(0x1000_0400, R1, &[], "mflr r0");

        match run(table, tracer).unwrap() {
            Verdict::Aborted(divergence) => {
                assert_eq!(divergence.table, RaLocation::Address(R1 + 8));
                assert_eq!(divergence.oracle, RaLocation::Register(65));
                assert!(divergence.describe().contains("register lr"));
            }
            other => panic!("expected divergence, got {other:?}"),
        }
    }

    #[test]
    fn test_unimplemented_rule_kind_is_fatal() {
        let mut section = EhFrameSection::new();
        let cie = section.cie(CieSpec {
            code_align: 1,
            data_align: -8,
            ra_register: 16,
            // Return address "still in a register": not a claim the
            // checker knows how to test.
            initial_instructions: [cfi::def_cfa(7, 8), cfi::register(16, 0)].concat(),
        });
        section.fde(cie, 0x1000, 0x20, vec![]);
        let table = amd64_table(section);

        let tracer = ScriptedTracer::new().stop(0x1000, SP, &[], "nop");

        let err = run(table, tracer).unwrap_err();
        assert!(matches!(
            err,
            CheckError::UnimplementedRule { kind: "register" }
        ));
    }
}
