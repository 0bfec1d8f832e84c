//! The kernel symbol lookup service: an external collaborator the engine
//! consumes to resolve a to-be-patched function's live address and size
//! (`lookup_open`/`lookup_global_symbol`/`lookup_local_symbol` in the
//! original). Modeled as a trait so tests can supply a stand-in without a
//! real kernel object on disk.

use std::path::Path;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LookupResult {
    pub value: u64,
    pub size: u64,
}

pub trait SymbolLookup {
    fn open(path: &Path) -> Result<Self>
    where
        Self: Sized;

    /// Resolves a global symbol by name alone.
    fn global_symbol(&self, name: &str) -> Result<LookupResult>;

    /// Resolves a local symbol, disambiguated by the basename of its
    /// originating translation unit (the "hint").
    fn local_symbol(&self, name: &str, file_hint: &str) -> Result<LookupResult>;
}

/// Used when `--resolve` is not passed (the default: the in-kernel patch
/// loader resolves `old_addr` itself at load time) and in tests that don't
/// care about real addresses. Always reports a size large enough to pass the
/// "too small to patch" check, since no real function has been looked up.
pub struct NullLookup;

impl SymbolLookup for NullLookup {
    fn open(_path: &Path) -> Result<Self> {
        Ok(NullLookup)
    }

    fn global_symbol(&self, _name: &str) -> Result<LookupResult> {
        Ok(LookupResult { value: 0, size: u64::MAX })
    }

    fn local_symbol(&self, _name: &str, _file_hint: &str) -> Result<LookupResult> {
        Ok(LookupResult { value: 0, size: u64::MAX })
    }
}

/// Resolves symbols against a real kernel object file on disk (the third
/// CLI argument), backing `--resolve`. Global symbols are looked up by name
/// directly; local symbols are disambiguated by the basename of the FILE
/// symbol that precedes them in the object's own symbol table, the same
/// scoping an assembler/linker uses.
pub struct KernelObjectLookup {
    globals: std::collections::HashMap<String, LookupResult>,
    locals: std::collections::HashMap<(String, String), LookupResult>,
}

impl SymbolLookup for KernelObjectLookup {
    fn open(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let obj = crate::elf::reader::parse(&bytes)?;

        let mut globals = std::collections::HashMap::new();
        let mut locals = std::collections::HashMap::new();
        let mut hint = String::new();

        for sym in &obj.symbols {
            if sym.is_file() {
                hint = sym.name.clone();
                continue;
            }
            if sym.is_null() || sym.name.is_empty() {
                continue;
            }
            let result = LookupResult { value: sym.st_value, size: sym.st_size };
            if sym.is_local() {
                locals.insert((sym.name.clone(), hint.clone()), result);
            } else {
                globals.insert(sym.name.clone(), result);
            }
        }

        Ok(KernelObjectLookup { globals, locals })
    }

    fn global_symbol(&self, name: &str) -> Result<LookupResult> {
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| crate::error::Error::DiffFatal(format!("lookup_global_symbol {}", name)))
    }

    fn local_symbol(&self, name: &str, file_hint: &str) -> Result<LookupResult> {
        self.locals
            .get(&(name.to_string(), file_hint.to_string()))
            .copied()
            .ok_or_else(|| crate::error::Error::DiffFatal(format!("lookup_local_symbol {} ({})", name, file_hint)))
    }
}

#[cfg(test)]
/// An in-memory stand-in keyed by `(name, Option<file_hint>)`, used by the
/// assembler's tests to exercise `--resolve` without reading a kernel image.
pub mod test_support {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct FakeLookup {
        pub globals: HashMap<String, LookupResult>,
        pub locals: HashMap<(String, String), LookupResult>,
    }

    impl FakeLookup {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_global(mut self, name: &str, result: LookupResult) -> Self {
            self.globals.insert(name.to_string(), result);
            self
        }

        pub fn with_local(mut self, name: &str, hint: &str, result: LookupResult) -> Self {
            self.locals.insert((name.to_string(), hint.to_string()), result);
            self
        }
    }

    impl SymbolLookup for FakeLookup {
        fn open(_path: &Path) -> Result<Self> {
            Ok(FakeLookup::new())
        }

        fn global_symbol(&self, name: &str) -> Result<LookupResult> {
            self.globals
                .get(name)
                .copied()
                .ok_or_else(|| crate::error::Error::DiffFatal(format!("lookup_global_symbol {}", name)))
        }

        fn local_symbol(&self, name: &str, file_hint: &str) -> Result<LookupResult> {
            self.locals
                .get(&(name.to_string(), file_hint.to_string()))
                .copied()
                .ok_or_else(|| crate::error::Error::DiffFatal(format!("lookup_local_symbol {} ({})", name, file_hint)))
        }
    }
}
