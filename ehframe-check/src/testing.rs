// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Canned process-control for tests.
//!
//! [`ScriptedTracer`] replays a fixed sequence of stops instead of driving
//! a live process, so validator scenarios can be written as data: each
//! stop is a program counter, a stack pointer, any registers the scenario
//! reads, and the instruction text the disassembler would have produced.

use std::collections::HashMap;

use crate::tracer::{Instruction, Module, StepOutcome, TraceError, Tracer};
use ehframe_common::Arch;

struct Stop {
    pc: u64,
    sp: u64,
    registers: HashMap<String, u64>,
    instruction: Instruction,
}

/// A [`Tracer`] that replays a pre-written script.
///
/// Builder methods chain by value, one `stop` per instruction the fake
/// debuggee executes. Stepping past the last stop reports
/// [`StepOutcome::Exited`].
pub struct ScriptedTracer {
    arch: Arch,
    stops: Vec<Stop>,
    memory: HashMap<u64, u64>,
    modules: Vec<Module>,
    position: usize,
}

impl ScriptedTracer {
    /// An empty x86-64 script.
    pub fn new() -> ScriptedTracer {
        ScriptedTracer::for_arch(Arch::Amd64)
    }

    pub fn for_arch(arch: Arch) -> ScriptedTracer {
        ScriptedTracer {
            arch,
            stops: Vec::new(),
            memory: HashMap::new(),
            modules: Vec::new(),
            position: 0,
        }
    }

    /// Append one stop. The stack and instruction pointers are readable
    /// as registers under their architectural names; `registers` entries
    /// override them.
    pub fn stop(
        mut self,
        pc: u64,
        sp: u64,
        registers: &[(&str, u64)],
        instruction: &str,
    ) -> ScriptedTracer {
        let mut map = HashMap::new();
        map.insert(self.arch.instruction_pointer_name().to_string(), pc);
        map.insert(self.arch.stack_pointer_name().to_string(), sp);
        for (name, value) in registers {
            map.insert(name.to_string(), *value);
        }
        self.stops.push(Stop {
            pc,
            sp,
            registers: map,
            instruction: Instruction::from_line(instruction),
        });
        self
    }

    /// Make one word of fake memory readable.
    pub fn word(mut self, addr: u64, value: u64) -> ScriptedTracer {
        self.memory.insert(addr, value);
        self
    }

    /// Record a loaded module.
    pub fn module(mut self, start: u64, end: u64, path: &str) -> ScriptedTracer {
        self.modules.push(Module {
            start,
            end,
            path: path.to_string(),
        });
        self
    }

    fn current(&self) -> Result<&Stop, TraceError> {
        self.stops
            .get(self.position)
            .ok_or_else(|| TraceError::Backend("stepped past the end of the script".into()))
    }
}

impl Default for ScriptedTracer {
    fn default() -> ScriptedTracer {
        ScriptedTracer::new()
    }
}

impl Tracer for ScriptedTracer {
    fn instruction_pointer(&mut self) -> Result<u64, TraceError> {
        Ok(self.current()?.pc)
    }

    fn stack_pointer(&mut self) -> Result<u64, TraceError> {
        Ok(self.current()?.sp)
    }

    fn read_register(&mut self, name: &str) -> Result<u64, TraceError> {
        self.current()?
            .registers
            .get(name)
            .copied()
            .ok_or_else(|| TraceError::UnknownRegister(name.to_string()))
    }

    fn read_word(&mut self, addr: u64) -> Result<u64, TraceError> {
        self.memory
            .get(&addr)
            .copied()
            .ok_or(TraceError::UnreadableMemory(addr))
    }

    fn disassemble(&mut self) -> Result<Instruction, TraceError> {
        Ok(self.current()?.instruction.clone())
    }

    fn step(&mut self) -> Result<StepOutcome, TraceError> {
        self.position += 1;
        if self.position < self.stops.len() {
            Ok(StepOutcome::Running)
        } else {
            Ok(StepOutcome::Exited)
        }
    }

    fn run_to_entry(&mut self) -> Result<(), TraceError> {
        self.position = 0;
        Ok(())
    }

    fn loaded_modules(&mut self) -> Result<Vec<Module>, TraceError> {
        Ok(self.modules.clone())
    }
}
