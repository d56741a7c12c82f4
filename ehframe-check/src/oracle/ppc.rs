// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

use super::{OracleStep, ReturnAddressOracle};
use crate::tracer::{Instruction, Tracer};
use crate::CheckError;
use ehframe_common::{Arch, RaLocation};
use tracing::trace;

/// Return-address tracking for 32-bit PowerPC.
///
/// Power keeps the return address in the link register until the prologue
/// moves it: `mflr rX` copies it into a general register, and a later
/// `stw rX, off(r1)` spills that register into the caller's frame. The
/// oracle follows those two hops and nothing else; between them the
/// location is a register identity, never a fabricated address. There is
/// no depth to track, so a Power run only ends when the debuggee exits.
pub struct PpcOracle {
    location: RaLocation,
}

impl PpcOracle {
    pub fn new() -> PpcOracle {
        PpcOracle {
            location: RaLocation::Register(Arch::Ppc.return_address_register()),
        }
    }
}

impl Default for PpcOracle {
    fn default() -> PpcOracle {
        PpcOracle::new()
    }
}

impl ReturnAddressOracle for PpcOracle {
    fn location(&self) -> RaLocation {
        self.location
    }

    fn observe(
        &mut self,
        insn: &Instruction,
        tracer: &mut dyn Tracer,
    ) -> Result<OracleStep, CheckError> {
        match insn.mnemonic.as_str() {
            "mflr" => {
                if let Some(register) = Arch::Ppc.register_number(insn.operands.trim()) {
                    trace!("mflr: return address moved to {}", insn.operands.trim());
                    self.location = RaLocation::Register(register);
                }
            }
            "stw" => {
                if let Some((source, offset, base)) = parse_store(&insn.operands) {
                    let stored = Arch::Ppc.register_number(source);
                    let spills_ra = base == Arch::Ppc.stack_pointer_name()
                        && stored.map(RaLocation::Register) == Some(self.location);
                    if spills_ra {
                        let frame = tracer.read_register(base)?;
                        let addr = frame.wrapping_add_signed(offset);
                        trace!("stw: return address spilled to {addr:#x}");
                        self.location = RaLocation::Address(addr);
                    }
                }
            }
            _ => {}
        }
        Ok(OracleStep::Continue)
    }
}

/// Split a `rS,off(rB)` store operand.
fn parse_store(operands: &str) -> Option<(&str, i64, &str)> {
    let (source, memory) = operands.split_once(',')?;
    let open = memory.find('(')?;
    let close = memory[open..].find(')')? + open;
    let offset = memory[..open].trim().parse::<i64>().ok()?;
    let base = &memory[open + 1..close];
    Some((source.trim(), offset, base))
}
