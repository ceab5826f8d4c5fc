//! The global symbol table and the per-chunk inline cache
//!
//! Global access ops resolve a name once and then hit a side cache indexed
//! by the instruction's offset, so steady-state access skips the table lock
//! without rewriting the instruction stream.

use std::sync::OnceLock;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use vireo_bytecode::TypeTag;

use crate::{Error, ErrorKind, Ptr, Result, Value, ValueCell, value::value_cell};

/// A global variable: its declaration and its storage cell
#[derive(Debug)]
pub struct Global {
    /// The lowered name
    pub name: Ptr<str>,
    /// The declared type
    pub tag: TypeTag,
    /// True for constants, which reject `SetGlobal`
    pub is_const: bool,
    /// The storage cell; pointers and captures may alias it
    pub value: ValueCell,
}

/// The mutable global symbol table, shared by all worker threads
///
/// Keys are lowercased at definition and lookup, so access is
/// case-insensitive.
#[derive(Debug, Default)]
pub struct GlobalTable {
    entries: Mutex<FxHashMap<String, Ptr<Global>>>,
}

impl GlobalTable {
    /// Makes an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a global, or returns the existing entry when the name is
    /// already defined
    ///
    /// Redefinition keeps the original storage so that addresses taken
    /// before a module is re-entered stay valid.
    pub fn define(&self, name: &str, tag: TypeTag, is_const: bool, initial: Value) -> Ptr<Global> {
        let key = name.to_lowercase();
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&key) {
            return existing.clone();
        }
        let global = Ptr::new(Global {
            name: key.as_str().into(),
            tag,
            is_const,
            value: value_cell(initial),
        });
        entries.insert(key, global.clone());
        global
    }

    /// Looks up a global by name, case-insensitively
    pub fn get(&self, name: &str) -> Option<Ptr<Global>> {
        self.entries.lock().get(&name.to_lowercase()).cloned()
    }

    /// Removes every entry
    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Compile-time constants, resolved before execution starts
///
/// The map is immutable during a run, so reads need no lock.
#[derive(Debug, Default)]
pub struct ConstGlobals {
    entries: FxHashMap<String, Ptr<Global>>,
}

impl ConstGlobals {
    /// Makes an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a constant
    pub fn insert(&mut self, name: &str, tag: TypeTag, value: Value) {
        let key = name.to_lowercase();
        let global = Ptr::new(Global {
            name: key.as_str().into(),
            tag,
            is_const: true,
            value: value_cell(value),
        });
        self.entries.insert(key, global);
    }

    /// Looks up a constant by name, case-insensitively
    pub fn get(&self, name: &str) -> Option<&Ptr<Global>> {
        self.entries.get(&name.to_lowercase())
    }
}

/// The per-chunk global-access cache
///
/// One write-once slot per code byte, indexed by the offset of the access
/// instruction. Concurrent first resolutions of the same slot are benign:
/// both resolve the same name against the same table and the slot publishes
/// one of the identical results.
pub struct GlobalCache {
    slots: Box<[OnceLock<Ptr<Global>>]>,
}

impl GlobalCache {
    /// Makes a cache sized for a chunk's code
    pub fn new(code_len: usize) -> Self {
        let mut slots = Vec::with_capacity(code_len);
        slots.resize_with(code_len, OnceLock::new);
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// Returns the cached resolution for an instruction offset, resolving
    /// and publishing it on first touch
    pub fn get_or_resolve(
        &self,
        offset: usize,
        resolve: impl FnOnce() -> Result<Ptr<Global>>,
    ) -> Result<Ptr<Global>> {
        let slot = self
            .slots
            .get(offset)
            .ok_or_else(|| Error::new(ErrorKind::TruncatedInstruction))?;
        if let Some(global) = slot.get() {
            return Ok(global.clone());
        }
        let global = resolve()?;
        let _ = slot.set(global.clone());
        Ok(global)
    }
}

impl std::fmt::Debug for GlobalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let resolved = self.slots.iter().filter(|s| s.get().is_some()).count();
        write!(f, "GlobalCache({resolved}/{} resolved)", self.slots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definitions_are_case_insensitive_and_stable() {
        let table = GlobalTable::new();
        let first = table.define("Counter", TypeTag::Int32, false, Value::int(0));
        let second = table.define("COUNTER", TypeTag::Int32, false, Value::int(9));
        assert!(Ptr::ptr_eq(&first, &second));
        assert_eq!(*first.value.borrow(), Value::int(0));
        assert!(table.get("counter").is_some());
    }

    #[test]
    fn cache_resolves_once() {
        let table = GlobalTable::new();
        table.define("x", TypeTag::Int32, false, Value::int(5));
        let cache = GlobalCache::new(16);

        let mut resolutions = 0;
        for _ in 0..3 {
            let global = cache
                .get_or_resolve(4, || {
                    resolutions += 1;
                    table
                        .get("x")
                        .ok_or_else(|| Error::new(ErrorKind::UndefinedGlobal("x".into())))
                })
                .unwrap();
            assert_eq!(*global.value.borrow(), Value::int(5));
        }
        assert_eq!(resolutions, 1);
    }

    #[test]
    fn unresolved_cache_miss_propagates() {
        let cache = GlobalCache::new(8);
        let result = cache.get_or_resolve(2, || {
            Err(Error::new(ErrorKind::UndefinedGlobal("missing".into())))
        });
        assert!(matches!(
            result.unwrap_err().kind,
            ErrorKind::UndefinedGlobal(_)
        ));
    }
}
