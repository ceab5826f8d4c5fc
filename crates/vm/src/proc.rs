use rustc_hash::FxHashMap;

use crate::{Error, ErrorKind, Ptr, Result};

/// Describes one variable captured by a nested routine
///
/// `is_local` selects between the enclosing frame's locals and the enclosing
/// frame's own captures; `is_ref` records whether the capture aliases a VAR
/// parameter.
#[derive(Clone, Copy, Debug)]
pub struct UpvalueDesc {
    /// Slot index in the enclosing frame's locals or upvalues
    pub index: u8,
    /// True when the capture refers to a local of the enclosing routine
    pub is_local: bool,
    /// True when the captured variable is a reference parameter
    pub is_ref: bool,
}

/// The compiled-symbol descriptor for a procedure or function
///
/// Produced by the front-end compilers alongside the chunk; never relocated
/// once created.
#[derive(Debug)]
pub struct ProcInfo {
    /// The routine's name, as written in the source
    pub name: Ptr<str>,
    /// Entry offset in the chunk's bytecode
    pub entry: u32,
    /// Number of parameters
    pub arity: u8,
    /// Number of local variables, excluding parameters
    pub locals_count: u16,
    /// Captured-variable descriptors, empty for plain routines
    pub upvalues: Vec<UpvalueDesc>,
    /// The lexically enclosing routine, if any
    pub enclosing: Option<Ptr<ProcInfo>>,
    /// False while only a forward declaration has been seen
    pub defined: bool,
}

impl ProcInfo {
    /// Makes a descriptor for a routine without captures
    pub fn new(name: &str, entry: u32, arity: u8, locals_count: u16) -> Self {
        Self {
            name: name.into(),
            entry,
            arity,
            locals_count,
            upvalues: Vec::new(),
            enclosing: None,
            defined: true,
        }
    }
}

/// A per-class method-address table used for interface/virtual dispatch
#[derive(Debug)]
pub struct Vtable {
    /// The lowered class identity the table was built for
    pub class_name: Ptr<str>,
    /// Method slot index to compiled routine
    pub methods: Vec<Option<Ptr<ProcInfo>>>,
}

impl Vtable {
    /// Returns the routine for a method slot
    pub fn method(&self, index: usize) -> Result<&Ptr<ProcInfo>> {
        self.methods
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| {
                Error::new(ErrorKind::UnknownProcedure(format!(
                    "{}.{index}",
                    self.class_name
                )))
            })
    }
}

/// The table of compiled routines for a program
///
/// Keys are lowercased; methods are additionally registered under
/// `class.slot` alias keys that share the real routine's descriptor.
#[derive(Debug, Default)]
pub struct ProcTable {
    by_name: FxHashMap<String, Ptr<ProcInfo>>,
    by_entry: FxHashMap<u32, Ptr<ProcInfo>>,
}

impl ProcTable {
    /// Makes an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a routine under its own name
    pub fn insert(&mut self, proc: ProcInfo) -> Ptr<ProcInfo> {
        let proc = Ptr::new(proc);
        self.by_name
            .insert(proc.name.to_lowercase(), proc.clone());
        self.by_entry.insert(proc.entry, proc.clone());
        proc
    }

    /// Registers an alias key (e.g. `point.0`) for an existing routine
    pub fn alias(&mut self, key: &str, target: &Ptr<ProcInfo>) {
        self.by_name.insert(key.to_lowercase(), target.clone());
    }

    /// Looks up a routine by name, case-insensitively
    pub fn get(&self, name: &str) -> Option<&Ptr<ProcInfo>> {
        self.by_name.get(&name.to_lowercase())
    }

    /// Looks up a routine by its entry offset
    pub fn get_by_entry(&self, entry: u32) -> Option<&Ptr<ProcInfo>> {
        self.by_entry.get(&entry)
    }

    /// Builds the method table for a class from its `class.slot` alias keys
    ///
    /// Returns None when the class has no registered methods.
    pub fn build_vtable(&self, class_name: &str) -> Option<Vtable> {
        let class_name = class_name.to_lowercase();
        let prefix = format!("{class_name}.");
        let mut methods: Vec<Option<Ptr<ProcInfo>>> = Vec::new();

        for (key, proc) in self.by_name.iter() {
            let Some(slot) = key.strip_prefix(&prefix) else {
                continue;
            };
            let Ok(slot) = slot.parse::<usize>() else {
                continue;
            };
            if slot >= methods.len() {
                methods.resize(slot + 1, None);
            }
            methods[slot] = Some(proc.clone());
        }

        if methods.is_empty() {
            None
        } else {
            Some(Vtable {
                class_name: class_name.into(),
                methods,
            })
        }
    }
}
