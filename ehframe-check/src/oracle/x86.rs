// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

// Note x86 and x86-64 differ only in word size and register spellings
// here, so one implementation covers both, parameterised on Arch.

use super::{OracleStep, ReturnAddressOracle};
use crate::tracer::{Instruction, Tracer};
use crate::CheckError;
use ehframe_common::{Arch, RaLocation};
use tracing::trace;

/// Return-address tracking for x86 and x86-64.
///
/// At a function's first instruction the return address sits exactly at
/// `*sp`, so the oracle starts at the entry stack pointer and follows it
/// from there: `call` stacks the current slot and watches the one the
/// call will write, `ret` unstacks. The depth of `saved` is the call
/// depth below the entry frame; a `ret` with nothing saved means the
/// frame the run started in returned.
pub struct X86Oracle {
    arch: Arch,
    /// The innermost frame's return-address slot.
    ra_at: u64,
    /// Outer frames' slots, innermost last.
    saved: Vec<u64>,
    /// Stops remaining in which `location()` still answers with the
    /// pre-push slot after a `push offset(%rip)`.
    push_rip_grace: u8,
}

impl X86Oracle {
    pub fn new(arch: Arch, entry_sp: u64) -> X86Oracle {
        X86Oracle {
            arch,
            ra_at: entry_sp,
            saved: Vec::new(),
            push_rip_grace: 0,
        }
    }

    /// The PLT0 `pushq offset(%rip)` shape: a push whose memory operand
    /// is based on the instruction pointer.
    fn is_ip_relative_push(&self, insn: &Instruction) -> bool {
        insn.base_register() == Some(self.arch.instruction_pointer_name())
    }
}

impl ReturnAddressOracle for X86Oracle {
    fn location(&self) -> RaLocation {
        // During the grace window the pushed word hasn't been claimed by
        // the table yet; the previous frame's slot still answers.
        let slot = if self.push_rip_grace > 0 {
            self.saved.last().copied().unwrap_or(self.ra_at)
        } else {
            self.ra_at
        };
        RaLocation::Address(slot)
    }

    fn observe(
        &mut self,
        insn: &Instruction,
        tracer: &mut dyn Tracer,
    ) -> Result<OracleStep, CheckError> {
        let word = self.arch.word_size();
        if insn.mnemonic.starts_with("call") {
            let slot = tracer.stack_pointer()?.wrapping_sub(word);
            self.saved.push(self.ra_at);
            self.ra_at = slot;
            trace!("call: return address will land at {slot:#x}");
        } else if insn.mnemonic.starts_with("ret") {
            match self.saved.pop() {
                Some(outer) => {
                    trace!("ret: back to slot {outer:#x}");
                    self.ra_at = outer;
                }
                None => return Ok(OracleStep::ReturnedFromTop),
            }
        } else if insn.mnemonic.starts_with("push") && self.is_ip_relative_push(insn) {
            // Lazy PLT resolution: PLT0 pushes a word the resolver owns.
            // Track the new slot, but keep answering with the old one for
            // exactly the next stop; armed to 2 because the unconditional
            // decrement below burns one immediately.
            let slot = tracer.stack_pointer()?.wrapping_sub(word);
            self.saved.push(self.ra_at);
            self.ra_at = slot;
            self.push_rip_grace = 2;
            trace!("push through {}: resolver slot at {slot:#x}", self.arch.instruction_pointer_name());
        }
        self.push_rip_grace = self.push_rip_grace.saturating_sub(1);
        Ok(OracleStep::Continue)
    }
}
