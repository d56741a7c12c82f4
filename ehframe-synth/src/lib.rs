// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic `.eh_frame` sections for testing.
//!
//! Lays out CIE and FDE records byte by byte the way a compiler would,
//! without going through any writer library, so tests exercise the real
//! parsing path. Basic usage is to create an [EhFrameSection][], append a
//! CIE, cite it from FDEs whose instructions come from the [cfi][] and
//! [expr][] builders, and `finish()` to get the section contents.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use std::mem;

use gimli::constants;
use test_assembler::*;

/// The shape of a CIE: alignment factors, the return-address column, and
/// the initial instructions every FDE citing it starts from.
pub struct CieSpec {
    pub code_align: u64,
    pub data_align: i64,
    pub ra_register: u16,
    pub initial_instructions: Vec<u8>,
}

/// A writer of synthetic `.eh_frame` sections.
pub struct EhFrameSection {
    section: Section,
    endian: Endian,
    address_size: u8,
}

impl EhFrameSection {
    /// A little-endian section with 8-byte addresses.
    pub fn new() -> EhFrameSection {
        EhFrameSection::with_format(Endian::Little, 8)
    }

    /// A section with the given endianness and address size.
    pub fn with_format(endian: Endian, address_size: u8) -> EhFrameSection {
        assert!(address_size == 4 || address_size == 8);
        let section = Section::with_endian(endian);
        section.start().set_const(0);
        EhFrameSection {
            section,
            endian,
            address_size,
        }
    }

    /// Append a CIE, returning its offset for [fde][Self::fde] to cite.
    ///
    /// Writes a version 1 record with an empty augmentation string. The
    /// return-address register is ULEB128-encoded; every register number
    /// used here is below 128, where that coincides with the single-byte
    /// encoding version 1 calls for.
    pub fn cie(&mut self, spec: CieSpec) -> usize {
        let offset = self.section.size() as usize;
        let length = Label::new();
        let start = Label::new();
        let end = Label::new();
        self.append(|section| {
            section
                .D32(&length)
                .mark(&start)
                // CIE id.
                .D32(0)
                // Version.
                .D8(1)
                // Empty augmentation string.
                .D8(0)
                .append_bytes(&uleb128(spec.code_align))
                .append_bytes(&sleb128(spec.data_align))
                .append_bytes(&uleb128(u64::from(spec.ra_register)))
                .append_bytes(&spec.initial_instructions)
                .mark(&end)
        });
        length.set_const((&end - &start) as u64);
        offset
    }

    /// Append an FDE citing the CIE at `cie_offset`, covering
    /// `address_range` bytes of code starting at `initial_address`.
    pub fn fde(
        &mut self,
        cie_offset: usize,
        initial_address: u64,
        address_range: u64,
        instructions: Vec<u8>,
    ) {
        let address_size = self.address_size;
        // The citation is relative to its own field, which sits after the
        // 4-byte length.
        let pointer_field = self.section.size() as usize + 4;
        assert!(pointer_field > cie_offset);
        let length = Label::new();
        let start = Label::new();
        let end = Label::new();
        self.append(|section| {
            let section = section
                .D32(&length)
                .mark(&start)
                .D32((pointer_field - cie_offset) as u32);
            let section = if address_size == 4 {
                section
                    .D32(initial_address as u32)
                    .D32(address_range as u32)
            } else {
                section.D64(initial_address).D64(address_range)
            };
            section.append_bytes(&instructions).mark(&end)
        });
        length.set_const((&end - &start) as u64);
    }

    /// Terminate the entry list and return the section contents.
    pub fn finish(self) -> Vec<u8> {
        // A zero length is the end-of-entries marker.
        self.section.D32(0).get_contents().unwrap()
    }

    fn append<F>(&mut self, build: F)
    where
        F: FnOnce(Section) -> Section,
    {
        let section = mem::replace(&mut self.section, Section::with_endian(self.endian));
        self.section = build(section);
    }
}

impl Default for EhFrameSection {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode `value` as ULEB128.
pub fn uleb128(mut value: u64) -> Vec<u8> {
    let mut bytes = Vec::new();
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        bytes.push(byte);
        if value == 0 {
            return bytes;
        }
    }
}

/// Encode `value` as SLEB128.
pub fn sleb128(mut value: i64) -> Vec<u8> {
    let mut bytes = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        bytes.push(if done { byte } else { byte | 0x80 });
        if done {
            return bytes;
        }
    }
}

/// Call-frame instruction bytes.
pub mod cfi {
    use super::{constants, sleb128, uleb128};

    /// `DW_CFA_nop`.
    pub fn nop() -> Vec<u8> {
        vec![constants::DW_CFA_nop.0]
    }

    /// `DW_CFA_advance_loc`: advance by `delta` code-alignment units.
    pub fn advance_loc(delta: u8) -> Vec<u8> {
        assert!(delta < 0x40);
        vec![constants::DW_CFA_advance_loc.0 | delta]
    }

    /// `DW_CFA_advance_loc1`.
    pub fn advance_loc1(delta: u8) -> Vec<u8> {
        vec![constants::DW_CFA_advance_loc1.0, delta]
    }

    /// `DW_CFA_offset`, or `DW_CFA_offset_extended` for registers past the
    /// 6-bit range: saved at CFA plus `factored_offset` data-alignment
    /// units.
    pub fn offset(register: u16, factored_offset: u64) -> Vec<u8> {
        if register < 0x40 {
            let mut bytes = vec![constants::DW_CFA_offset.0 | register as u8];
            bytes.extend(uleb128(factored_offset));
            bytes
        } else {
            let mut bytes = vec![constants::DW_CFA_offset_extended.0];
            bytes.extend(uleb128(u64::from(register)));
            bytes.extend(uleb128(factored_offset));
            bytes
        }
    }

    /// `DW_CFA_offset_extended_sf`: signed factored offset. Tables with a
    /// negative data alignment need this to place a save above the CFA,
    /// as PowerPC does with the link register.
    pub fn offset_extended_sf(register: u16, factored_offset: i64) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_offset_extended_sf.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes.extend(sleb128(factored_offset));
        bytes
    }

    /// `DW_CFA_val_offset`.
    pub fn val_offset(register: u16, factored_offset: u64) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_val_offset.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes.extend(uleb128(factored_offset));
        bytes
    }

    /// `DW_CFA_undefined`.
    pub fn undefined(register: u16) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_undefined.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes
    }

    /// `DW_CFA_same_value`.
    pub fn same_value(register: u16) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_same_value.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes
    }

    /// `DW_CFA_register`: `dest` is now saved in `src`.
    pub fn register(dest: u16, src: u16) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_register.0];
        bytes.extend(uleb128(u64::from(dest)));
        bytes.extend(uleb128(u64::from(src)));
        bytes
    }

    /// `DW_CFA_def_cfa`.
    pub fn def_cfa(register: u16, offset: u64) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_def_cfa.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes.extend(uleb128(offset));
        bytes
    }

    /// `DW_CFA_def_cfa_register`.
    pub fn def_cfa_register(register: u16) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_def_cfa_register.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes
    }

    /// `DW_CFA_def_cfa_offset`.
    pub fn def_cfa_offset(offset: u64) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_def_cfa_offset.0];
        bytes.extend(uleb128(offset));
        bytes
    }

    /// `DW_CFA_def_cfa_expression`.
    pub fn def_cfa_expression(expression: &[u8]) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_def_cfa_expression.0];
        bytes.extend(uleb128(expression.len() as u64));
        bytes.extend_from_slice(expression);
        bytes
    }

    /// `DW_CFA_expression`.
    pub fn expression(register: u16, expression: &[u8]) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_expression.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes.extend(uleb128(expression.len() as u64));
        bytes.extend_from_slice(expression);
        bytes
    }

    /// `DW_CFA_val_expression`.
    pub fn val_expression(register: u16, expression: &[u8]) -> Vec<u8> {
        let mut bytes = vec![constants::DW_CFA_val_expression.0];
        bytes.extend(uleb128(u64::from(register)));
        bytes.extend(uleb128(expression.len() as u64));
        bytes.extend_from_slice(expression);
        bytes
    }
}

/// DWARF location-expression operation bytes.
pub mod expr {
    use super::{constants, sleb128};

    /// `DW_OP_breg<N>`: push register `register` plus `offset`.
    pub fn breg(register: u16, offset: i64) -> Vec<u8> {
        assert!(register < 32);
        let mut bytes = vec![constants::DW_OP_breg0.0 + register as u8];
        bytes.extend(sleb128(offset));
        bytes
    }

    /// `DW_OP_lit<N>`: push the literal `n`.
    pub fn lit(n: u8) -> Vec<u8> {
        assert!(n < 32);
        vec![constants::DW_OP_lit0.0 + n]
    }

    /// `DW_OP_reg<N>`: the value lives in register `register`.
    pub fn reg(register: u16) -> Vec<u8> {
        assert!(register < 32);
        vec![constants::DW_OP_reg0.0 + register as u8]
    }

    /// `DW_OP_plus`.
    pub fn plus() -> Vec<u8> {
        vec![constants::DW_OP_plus.0]
    }

    /// `DW_OP_and`.
    pub fn and() -> Vec<u8> {
        vec![constants::DW_OP_and.0]
    }

    /// `DW_OP_shl`.
    pub fn shl() -> Vec<u8> {
        vec![constants::DW_OP_shl.0]
    }

    /// `DW_OP_ge`.
    pub fn ge() -> Vec<u8> {
        vec![constants::DW_OP_ge.0]
    }

    /// `DW_OP_deref`.
    pub fn deref() -> Vec<u8> {
        vec![constants::DW_OP_deref.0]
    }

    /// `DW_OP_const1u`.
    pub fn const1u(value: u8) -> Vec<u8> {
        vec![constants::DW_OP_const1u.0, value]
    }

    /// The CFA expression glibc uses for x86-64 PLT entries:
    /// `rsp + 8 + ((rip & 15) >= 11 ? 8 : 0)`.
    pub fn plt_cfa_x64() -> Vec<u8> {
        [
            breg(7, 8),
            breg(16, 0),
            lit(15),
            and(),
            lit(11),
            ge(),
            lit(3),
            shl(),
            plus(),
        ]
        .concat()
    }
}

#[test]
fn test_leb128_encodings() {
    assert_eq!(uleb128(0), vec![0]);
    assert_eq!(uleb128(127), vec![0x7f]);
    assert_eq!(uleb128(128), vec![0x80, 0x01]);
    assert_eq!(uleb128(624_485), vec![0xe5, 0x8e, 0x26]);
    assert_eq!(sleb128(2), vec![2]);
    assert_eq!(sleb128(-2), vec![0x7e]);
    assert_eq!(sleb128(127), vec![0xff, 0x00]);
    assert_eq!(sleb128(-127), vec![0x81, 0x7f]);
    assert_eq!(sleb128(128), vec![0x80, 0x01]);
    assert_eq!(sleb128(-128), vec![0x80, 0x7f]);
}

#[test]
fn test_cie_layout() {
    let mut section = EhFrameSection::new();
    let offset = section.cie(CieSpec {
        code_align: 1,
        data_align: -8,
        ra_register: 16,
        initial_instructions: cfi::def_cfa(7, 8),
    });
    assert_eq!(offset, 0);
    assert_eq!(
        section.finish(),
        vec![
            0x0c, 0, 0, 0, // length
            0, 0, 0, 0, // CIE id
            1,    // version
            0,    // empty augmentation
            1,    // code alignment
            0x78, // data alignment (-8)
            16,   // return address register
            0x0c, 7, 8, // DW_CFA_def_cfa rsp+8
            0, 0, 0, 0, // end of entries
        ]
    );
}

#[test]
fn test_fde_cites_its_cie() {
    let mut section = EhFrameSection::new();
    let cie = section.cie(CieSpec {
        code_align: 1,
        data_align: -8,
        ra_register: 16,
        initial_instructions: cfi::def_cfa(7, 8),
    });
    section.fde(cie, 0x1000, 0x20, cfi::nop());
    let contents = section.finish();
    // The CIE record is 16 bytes, so the FDE starts at 16.
    assert_eq!(
        &contents[16..41],
        &[
            0x15, 0, 0, 0, // length
            20, 0, 0, 0, // citation: field offset 20 - CIE offset 0
            0x00, 0x10, 0, 0, 0, 0, 0, 0, // initial location
            0x20, 0, 0, 0, 0, 0, 0, 0, // address range
            0x00, // DW_CFA_nop
        ]
    );
    // Terminator.
    assert_eq!(&contents[41..], &[0, 0, 0, 0]);
}

#[test]
fn test_big_endian_32_bit_layout() {
    let mut section = EhFrameSection::with_format(Endian::Big, 4);
    let cie = section.cie(CieSpec {
        code_align: 4,
        data_align: 4,
        ra_register: 65,
        initial_instructions: Vec::new(),
    });
    section.fde(cie, 0x1800, 0x40, Vec::new());
    let contents = section.finish();
    assert_eq!(
        &contents[..13],
        &[
            0, 0, 0, 9, // length
            0, 0, 0, 0, // CIE id
            1,  // version
            0,  // empty augmentation
            4,  // code alignment
            4,  // data alignment
            65, // return address register
        ]
    );
    assert_eq!(
        &contents[13..29],
        &[
            0, 0, 0, 12, // length
            0, 0, 0, 17, // citation: field offset 17 - CIE offset 0
            0, 0, 0x18, 0, // initial location
            0, 0, 0, 0x40, // address range
        ]
    );
}

#[test]
fn test_wide_registers_use_extended_forms() {
    assert_eq!(cfi::offset(6, 2), vec![0x86, 2]);
    assert_eq!(cfi::offset(65, 1), vec![0x05, 65, 1]);
}

#[test]
fn test_plt_expression_bytes() {
    assert_eq!(
        expr::plt_cfa_x64(),
        vec![0x77, 0x08, 0x80, 0x00, 0x3f, 0x1a, 0x3b, 0x2a, 0x33, 0x24, 0x22]
    );
}
