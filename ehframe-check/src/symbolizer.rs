// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Lazy address-to-function-name resolution.
//!
//! Symbols load per module, the first time an address inside that module
//! is asked about. A load is attempted exactly once per module path; a
//! module whose symbols cannot be read just resolves to a placeholder
//! from then on. Trace output is the only consumer, so failure here never
//! stops a run.

use std::collections::{HashMap, HashSet};

use ehframe::{RangeMap, SymbolTable, TableError};
use tracing::{debug, info, warn};

use crate::tracer::Module;

/// Things that can go wrong finding symbols for one module.
#[derive(Debug, thiserror::Error)]
pub enum SymbolError {
    /// The module's file could not be read or parsed.
    #[error("failed to load symbols")]
    Load(#[from] TableError),
    /// The supplier has nothing for this module.
    #[error("no symbols for this module")]
    NotFound,
}

/// A source of function symbols, one module at a time.
pub trait SymbolSupplier {
    /// Load the function symbols of the module at `path` into `symbols`,
    /// rebasing module-relative addresses by `base`.
    fn fill_symbols(
        &mut self,
        path: &str,
        base: u64,
        symbols: &mut SymbolTable,
    ) -> Result<(), SymbolError>;
}

/// Reads symbols from the module's own file on disk.
pub struct FileSymbolSupplier;

impl SymbolSupplier for FileSymbolSupplier {
    fn fill_symbols(
        &mut self,
        path: &str,
        base: u64,
        symbols: &mut SymbolTable,
    ) -> Result<(), SymbolError> {
        Ok(symbols.index_object(path, base)?)
    }
}

/// An in-memory supplier for tests: canned function lists keyed by module
/// path, with module-relative addresses.
#[derive(Default)]
pub struct MapSymbolSupplier {
    modules: HashMap<String, Vec<(String, u64, u64)>>,
}

impl MapSymbolSupplier {
    pub fn new() -> MapSymbolSupplier {
        Default::default()
    }

    /// Add a module and its functions as `(name, start, size)` triples.
    pub fn module(mut self, path: &str, functions: &[(&str, u64, u64)]) -> MapSymbolSupplier {
        self.modules.insert(
            path.to_string(),
            functions
                .iter()
                .map(|&(name, start, size)| (name.to_string(), start, size))
                .collect(),
        );
        self
    }
}

impl SymbolSupplier for MapSymbolSupplier {
    fn fill_symbols(
        &mut self,
        path: &str,
        base: u64,
        symbols: &mut SymbolTable,
    ) -> Result<(), SymbolError> {
        let functions = self.modules.get(path).ok_or(SymbolError::NotFound)?;
        for (name, start, size) in functions {
            symbols.insert_function(name.clone(), start.wrapping_add(base), *size);
        }
        Ok(())
    }
}

/// Resolves program counters to function names, loading symbols lazily.
pub struct Symbolizer {
    symbols: SymbolTable,
    modules: RangeMap<Module>,
    attempted: HashSet<String>,
    supplier: Box<dyn SymbolSupplier>,
}

impl Symbolizer {
    pub fn new<T: SymbolSupplier + 'static>(supplier: T) -> Symbolizer {
        Symbolizer {
            symbols: SymbolTable::new(),
            modules: RangeMap::new(),
            attempted: HashSet::new(),
            supplier: Box::new(supplier),
        }
    }

    /// Record the modules addresses can fall into.
    pub fn add_modules(&mut self, modules: Vec<Module>) {
        for module in modules {
            let range = (module.start, module.end);
            if let Err(err) = self.modules.insert(range, module) {
                debug!("ignoring module range {range:x?}: {err}");
            }
        }
    }

    /// Load one module's symbols right now, at an explicit base. The main
    /// binary wants this: its symbol values are already absolute, so the
    /// module's mapped start must not rebase them.
    pub fn preload(&mut self, path: &str, base: u64) -> Result<(), SymbolError> {
        self.attempted.insert(path.to_string());
        self.supplier.fill_symbols(path, base, &mut self.symbols)
    }

    /// The function name covering `addr`, loading the owning module's
    /// symbols if this is the first miss inside it.
    pub fn resolve(&mut self, addr: u64) -> String {
        if let Some(name) = self.symbols.lookup(addr) {
            return name.to_string();
        }

        let Some((module_start, path)) = self
            .modules
            .lookup_entry(addr)
            .map(|((start, _), module)| (start, module.path.clone()))
        else {
            return "_unknown @ [???]".to_string();
        };

        if self.attempted.insert(path.clone()) {
            info!("loading symbols for {path} at {module_start:#x}");
            if let Err(err) = self
                .supplier
                .fill_symbols(&path, module_start, &mut self.symbols)
            {
                warn!("failed to load symbols for {path}: {err}");
            }
            if let Some(name) = self.symbols.lookup(addr) {
                return name.to_string();
            }
        }

        format!("_unknown @ [{path}]")
    }
}
