// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use super::*;
use crate::testing::ScriptedTracer;

const SP: u64 = 0x7fff_e8b0;

/// Feed the current stop's instruction to the oracle, then step.
fn advance(oracle: &mut dyn ReturnAddressOracle, tracer: &mut ScriptedTracer) -> OracleStep {
    let insn = tracer.disassemble().unwrap();
    let step = oracle.observe(&insn, tracer).unwrap();
    tracer.step().unwrap();
    step
}

#[test]
fn test_starts_at_entry_sp() {
    let oracle = X86Oracle::new(Arch::Amd64, SP);
    assert_eq!(oracle.location(), RaLocation::Address(SP));
}

#[test]
fn test_call_and_ret_balance() {
    let mut tracer = ScriptedTracer::new()
        .stop(0x1000, SP, &[], "callq 0x2000")
        .stop(0x2000, SP - 8, &[], "ret")
        .stop(0x1005, SP, &[], "nop");
    let mut oracle = X86Oracle::new(Arch::Amd64, SP);

    // The call will write its return address just below the current sp.
    assert_eq!(advance(&mut oracle, &mut tracer), OracleStep::Continue);
    assert_eq!(oracle.location(), RaLocation::Address(SP - 8));

    // The ret pops back to the entry frame's slot.
    assert_eq!(advance(&mut oracle, &mut tracer), OracleStep::Continue);
    assert_eq!(oracle.location(), RaLocation::Address(SP));
}

#[test]
fn test_ret_with_no_saved_frames_completes_the_run() {
    let mut tracer = ScriptedTracer::new().stop(0x1000, SP, &[], "ret");
    let mut oracle = X86Oracle::new(Arch::Amd64, SP);
    assert_eq!(advance(&mut oracle, &mut tracer), OracleStep::ReturnedFromTop);
}

#[test]
fn test_push_rip_answers_old_slot_for_one_stop() {
    // PLT0: push a GOT word, jump to the resolver.
    let mut tracer = ScriptedTracer::new()
        .stop(0x40_03f0, SP, &[], "pushq 0x2fe2(%rip)")
        .stop(0x40_03f6, SP - 8, &[], "jmpq *0x2fe4(%rip)")
        .stop(0x7ff0_0290, SP - 8, &[], "sub $0x38,%rsp");
    let mut oracle = X86Oracle::new(Arch::Amd64, SP);

    advance(&mut oracle, &mut tracer);
    // One stop of grace: still the pre-push slot.
    assert_eq!(oracle.location(), RaLocation::Address(SP));

    advance(&mut oracle, &mut tracer);
    // Grace spent: the pushed slot answers now.
    assert_eq!(oracle.location(), RaLocation::Address(SP - 8));
}

#[test]
fn test_second_push_rip_rearms_the_window() {
    let mut tracer = ScriptedTracer::new()
        .stop(0x1000, SP, &[], "pushq 0x10(%rip)")
        .stop(0x1006, SP - 8, &[], "pushq 0x20(%rip)")
        .stop(0x100c, SP - 16, &[], "nop")
        .stop(0x100d, SP - 16, &[], "nop");
    let mut oracle = X86Oracle::new(Arch::Amd64, SP);

    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Address(SP));

    advance(&mut oracle, &mut tracer);
    // Re-armed: one stop of grace against the slot of the first push.
    assert_eq!(oracle.location(), RaLocation::Address(SP - 8));

    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Address(SP - 16));
}

#[test]
fn test_plain_pushes_are_ignored() {
    let mut tracer = ScriptedTracer::new()
        .stop(0x1000, SP, &[], "push %rbp")
        .stop(0x1001, SP - 8, &[], "pushq $0x0")
        .stop(0x1003, SP - 16, &[], "mov %rsp,%rbp");
    let mut oracle = X86Oracle::new(Arch::Amd64, SP);

    for _ in 0..3 {
        assert_eq!(advance(&mut oracle, &mut tracer), OracleStep::Continue);
        assert_eq!(oracle.location(), RaLocation::Address(SP));
    }
}

#[test]
fn test_x86_slots_are_four_bytes() {
    let mut tracer = ScriptedTracer::for_arch(Arch::X86)
        .stop(0x804_8400, 0xbfff_f000, &[], "call 0x8048300")
        .stop(0x804_8300, 0xbfff_effc, &[], "nop");
    let mut oracle = X86Oracle::new(Arch::X86, 0xbfff_f000);

    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Address(0xbfff_effc));
}

#[test]
fn test_repz_ret_counts_as_ret() {
    let mut tracer = ScriptedTracer::new()
        .stop(0x1000, SP, &[], "callq 0x2000")
        .stop(0x2000, SP - 8, &[], "repz ret");
    let mut oracle = X86Oracle::new(Arch::Amd64, SP);

    advance(&mut oracle, &mut tracer);
    assert_eq!(advance(&mut oracle, &mut tracer), OracleStep::Continue);
    assert_eq!(oracle.location(), RaLocation::Address(SP));
}
