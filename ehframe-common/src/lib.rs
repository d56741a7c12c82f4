// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Architecture and register types shared by the ehframe crates.
//!
//! Everything here is keyed off an explicit [`Arch`] value. The validated
//! machine is a property of the session, threaded through as a plain
//! parameter, so two sessions over binaries for different machines can
//! coexist in one process.

/// Machines the unwind-table tooling knows how to reason about.
///
/// DWARF register numbering differs per machine, as does the register the
/// call-frame address is usually computed from, so nearly every operation
/// downstream takes one of these.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// 32-bit x86.
    X86,
    /// x86-64, also known as AMD64.
    Amd64,
    /// 32-bit PowerPC.
    Ppc,
}

/// DWARF register names for 32-bit x86, indexed by register number.
static X86_REGS: &[&str] = &[
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags",
];

/// DWARF register names for x86-64, indexed by register number.
static AMD64_REGS: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10",
    "r11", "r12", "r13", "r14", "r15", "rip",
];

/// DWARF register names for 32-bit PowerPC: r0-r31, f0-f31, then the
/// special registers.
static PPC_REGS: &[&str] = &[
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11",
    "r12", "r13", "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21",
    "r22", "r23", "r24", "r25", "r26", "r27", "r28", "r29", "r30", "r31",
    "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11",
    "f12", "f13", "f14", "f15", "f16", "f17", "f18", "f19", "f20", "f21",
    "f22", "f23", "f24", "f25", "f26", "f27", "f28", "f29", "f30", "f31",
    "cr", "lr", "ctr",
];

impl Arch {
    /// The size in bytes of a pointer-width stack slot.
    pub fn word_size(self) -> u64 {
        match self {
            Arch::X86 => 4,
            Arch::Amd64 => 8,
            Arch::Ppc => 4,
        }
    }

    /// The name of a DWARF-numbered register, matching the spelling the
    /// reference disassemblers use (`rsp`, `eip`, `r1`, `lr`, ...).
    pub fn register_name(self, reg: u16) -> Option<&'static str> {
        let table = match self {
            Arch::X86 => X86_REGS,
            Arch::Amd64 => AMD64_REGS,
            Arch::Ppc => PPC_REGS,
        };
        table.get(reg as usize).copied()
    }

    /// The DWARF number of a named register, the inverse of
    /// [`register_name`](Self::register_name).
    pub fn register_number(self, name: &str) -> Option<u16> {
        let table = match self {
            Arch::X86 => X86_REGS,
            Arch::Amd64 => AMD64_REGS,
            Arch::Ppc => PPC_REGS,
        };
        table.iter().position(|&n| n == name).map(|i| i as u16)
    }

    /// Render a register for human output, falling back to `rN` for
    /// numbers outside the name table.
    pub fn describe_register(self, reg: u16) -> String {
        match self.register_name(reg) {
            Some(name) => name.to_string(),
            None => format!("r{reg}"),
        }
    }

    /// DWARF number of the stack pointer.
    pub fn stack_pointer(self) -> u16 {
        match self {
            Arch::X86 => 4,   // esp
            Arch::Amd64 => 7, // rsp
            Arch::Ppc => 1,   // r1
        }
    }

    /// DWARF number of the instruction pointer, where the machine exposes
    /// one as a numbered register.
    pub fn instruction_pointer(self) -> u16 {
        match self {
            Arch::X86 => 8,    // eip
            Arch::Amd64 => 16, // rip
            Arch::Ppc => 65,   // lr is the closest thing Power has
        }
    }

    /// Disassembler spelling of the stack pointer.
    pub fn stack_pointer_name(self) -> &'static str {
        match self {
            Arch::X86 => "esp",
            Arch::Amd64 => "rsp",
            Arch::Ppc => "r1",
        }
    }

    /// Disassembler spelling of the instruction pointer.
    pub fn instruction_pointer_name(self) -> &'static str {
        match self {
            Arch::X86 => "eip",
            Arch::Amd64 => "rip",
            Arch::Ppc => "pc",
        }
    }

    /// The register that conventionally holds the return address at
    /// function entry. The CIE's return-address column is authoritative for
    /// any particular table; this is the machine-level default.
    pub fn return_address_register(self) -> u16 {
        match self {
            Arch::X86 => 8,    // eip
            Arch::Amd64 => 16, // rip
            Arch::Ppc => 65,   // lr
        }
    }
}

impl std::fmt::Display for Arch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Arch::X86 => "x86",
            Arch::Amd64 => "amd64",
            Arch::Ppc => "ppc",
        };
        f.write_str(name)
    }
}

/// Where a return address lives at a particular instant.
///
/// The two variants never coerce into each other: an address is only equal
/// to the same address, a register only to the same register. Comparing a
/// concrete stack slot against "still in a register" is a real disagreement
/// and must surface as one.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RaLocation {
    /// Stored in memory at this address.
    Address(u64),
    /// Still live in this DWARF-numbered register.
    Register(u16),
}

impl RaLocation {
    /// Render for logs and mismatch reports.
    pub fn describe(self, arch: Arch) -> String {
        match self {
            RaLocation::Address(addr) => format!("{addr:#018x}"),
            RaLocation::Register(reg) => {
                format!("register {}", arch.describe_register(reg))
            }
        }
    }
}
