// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A compiler for DWARF call frame information (`.eh_frame`) into queryable
//! per-PC unwind tables.
//!
//! [`UnwindTable`] parses a binary's `.eh_frame` section and materialises one
//! [`UnwindRow`] per program-counter range each FDE describes. [`SymbolTable`]
//! maps addresses back to function names, and [`dump`] renders compiled
//! tables the way `readelf` renders CFI.

pub mod dump;
mod range_map;
mod rules;
mod symbols;
mod table;

pub use crate::range_map::{Range, RangeError, RangeMap};
pub use crate::rules::{CfaRule, ExprError, ExprOp, ExprProgram, RegRule};
pub use crate::symbols::SymbolTable;
pub use crate::table::{TableError, UnwindRow, UnwindTable};
