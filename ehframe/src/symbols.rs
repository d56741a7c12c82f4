// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Function names for addresses, read from ELF symbol tables.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use object::{Object, ObjectSymbol, SymbolKind};
use tracing::debug;

use crate::range_map::{RangeError, RangeMap};
use crate::table::TableError;

/// Function symbols of one or more objects, indexed by address range.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    functions: RangeMap<String>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        Default::default()
    }

    /// Index every function symbol of the ELF file at `path`, with `base`
    /// added to each address. `base` is zero for a non-relocated binary and
    /// the load offset for a shared object.
    pub fn index_object<P: AsRef<Path>>(
        &mut self,
        path: P,
        base: u64,
    ) -> Result<(), TableError> {
        let file = File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        let obj = object::File::parse(&*mmap)?;
        for symbol in obj.symbols() {
            if symbol.kind() != SymbolKind::Text {
                continue;
            }
            let size = symbol.size();
            if size == 0 {
                // Common for PLT stubs and assembly labels; a zero-length
                // range can never answer a lookup anyway.
                continue;
            }
            let name = match symbol.name() {
                Ok(name) if !name.is_empty() => name.to_string(),
                _ => continue,
            };
            self.insert_function(name, symbol.address().wrapping_add(base), size);
        }
        debug!(
            "indexed {} functions from {}",
            self.functions.len(),
            path.as_ref().display()
        );
        Ok(())
    }

    /// Record one function covering `[start, start + size)`. When two
    /// symbols claim the same addresses the first one indexed wins.
    pub fn insert_function(&mut self, name: String, start: u64, size: u64) {
        let end = start.wrapping_add(size);
        match self.functions.insert((start, end), name) {
            Ok(()) | Err(RangeError::Empty) => {}
            Err(RangeError::Overlap) => {
                debug!(
                    "discarding symbol at {:#x}..{:#x} overlapping an earlier function",
                    start, end
                );
            }
        }
    }

    /// The name of the function containing `addr`, if any.
    pub fn lookup(&self, addr: u64) -> Option<&str> {
        self.functions.lookup(addr).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
