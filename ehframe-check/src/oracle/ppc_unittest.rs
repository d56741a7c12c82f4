// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use super::*;
use crate::testing::ScriptedTracer;

const R1: u64 = 0xbfff_f000;
const LR: u16 = 65;

fn advance(oracle: &mut PpcOracle, tracer: &mut ScriptedTracer) {
    let insn = tracer.disassemble().unwrap();
    assert_eq!(oracle.observe(&insn, tracer).unwrap(), OracleStep::Continue);
    tracer.step().unwrap();
}

#[test]
fn test_starts_in_link_register() {
    let oracle = PpcOracle::new();
    assert_eq!(oracle.location(), RaLocation::Register(LR));
}

#[test]
fn test_prologue_moves_then_spills() {
    let mut tracer = ScriptedTracer::for_arch(Arch::Ppc)
        .stop(0x1000_0400, R1, &[], "mflr r0")
        .stop(0x1000_0404, R1, &[], "stw r0,8(r1)")
        .stop(0x1000_0408, R1, &[], "stwu r1,-32(r1)");
    let mut oracle = PpcOracle::new();

    advance(&mut oracle, &mut tracer);
    // Moved into a general register: an identity, not an address.
    assert_eq!(oracle.location(), RaLocation::Register(0));

    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Address(R1 + 8));
}

#[test]
fn test_mflr_into_r31_is_tracked_by_number() {
    let mut tracer = ScriptedTracer::for_arch(Arch::Ppc)
        .stop(0x1000_0400, R1, &[], "mflr r31")
        .stop(0x1000_0404, R1, &[], "stw r31,8(r1)")
        .stop(0x1000_0408, R1, &[], "nop");
    let mut oracle = PpcOracle::new();

    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Register(31));

    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Address(R1 + 8));
}

#[test]
fn test_store_of_unrelated_register_is_ignored() {
    let mut tracer = ScriptedTracer::for_arch(Arch::Ppc)
        .stop(0x1000_0400, R1, &[], "mflr r0")
        .stop(0x1000_0404, R1, &[], "stw r5,16(r1)")
        .stop(0x1000_0408, R1, &[], "nop");
    let mut oracle = PpcOracle::new();

    advance(&mut oracle, &mut tracer);
    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Register(0));
}

#[test]
fn test_store_off_the_stack_frame_is_ignored() {
    let mut tracer = ScriptedTracer::for_arch(Arch::Ppc)
        .stop(0x1000_0400, R1, &[], "mflr r0")
        .stop(0x1000_0404, R1, &[], "stw r0,8(r9)")
        .stop(0x1000_0408, R1, &[], "nop");
    let mut oracle = PpcOracle::new();

    advance(&mut oracle, &mut tracer);
    advance(&mut oracle, &mut tracer);
    assert_eq!(oracle.location(), RaLocation::Register(0));
}

#[test]
fn test_blr_never_ends_the_run() {
    let mut tracer = ScriptedTracer::for_arch(Arch::Ppc).stop(0x1000_0400, R1, &[], "blr");
    let mut oracle = PpcOracle::new();
    let insn = tracer.disassemble().unwrap();
    assert_eq!(
        oracle.observe(&insn, &mut tracer).unwrap(),
        OracleStep::Continue
    );
}
