//! The builtin and host call conventions
//!
//! Builtins are named routines registered by the embedder; only
//! function-classified builtins push a result. Host callbacks live in a
//! fixed slot table indexed by [HostId] and always push a result. The
//! interface-support callbacks ship with the table because method dispatch
//! depends on them; the I/O and runtime-library builtins are the embedder's.

use rustc_hash::FxHashMap;

use crate::{
    Error, ErrorKind, Result, Value, Vm,
    threads::Job,
    value::{Closure, InterfaceValue, value_cell},
};

/// The signature shared by builtin handlers and host callbacks
pub type BuiltinFn = fn(&mut Vm, &mut [Value]) -> Result<Value>;

/// The signature of a host callback
pub type HostFn = BuiltinFn;

#[derive(Clone)]
struct BuiltinEntry {
    name: crate::Ptr<str>,
    handler: BuiltinFn,
    is_function: bool,
}

/// The registry of named builtins
///
/// Names are lowercased; each registration also receives a numeric id for
/// the id-carrying call op.
#[derive(Default)]
pub struct BuiltinRegistry {
    by_name: FxHashMap<String, usize>,
    entries: Vec<BuiltinEntry>,
}

impl BuiltinRegistry {
    /// Makes an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a builtin and returns its id
    ///
    /// `is_function` decides whether a call pushes the handler's result.
    pub fn register(&mut self, name: &str, handler: BuiltinFn, is_function: bool) -> usize {
        let key = name.to_lowercase();
        if let Some(&id) = self.by_name.get(&key) {
            self.entries[id].handler = handler;
            self.entries[id].is_function = is_function;
            return id;
        }
        let id = self.entries.len();
        self.entries.push(BuiltinEntry {
            name: key.as_str().into(),
            handler,
            is_function,
        });
        self.by_name.insert(key, id);
        id
    }

    /// Looks up a builtin by name, case-insensitively
    pub fn get(&self, name: &str) -> Result<(BuiltinFn, bool)> {
        self.by_name
            .get(&name.to_lowercase())
            .map(|&id| (self.entries[id].handler, self.entries[id].is_function))
            .ok_or_else(|| Error::new(ErrorKind::UnknownBuiltin(name.into())))
    }

    /// Looks up a builtin by id, falling back to the name
    pub fn get_by_id(&self, id: usize, name: &str) -> Result<(BuiltinFn, bool)> {
        match self.entries.get(id) {
            Some(entry) if entry.name.eq_ignore_ascii_case(name) || name.is_empty() => {
                Ok((entry.handler, entry.is_function))
            }
            _ => self.get(name),
        }
    }
}

impl std::fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BuiltinRegistry({} builtins)", self.entries.len())
    }
}

/// The number of host callback slots
pub const HOST_SLOT_COUNT: usize = 16;

/// The well-known host callback slots
///
/// The front-end compilers emit `CallHost` with these ids; embedders may
/// replace any slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HostId {
    /// Polls whether the embedder has requested the program to stop
    QuitRequested = 0,
    /// Spawns a worker for a callable plus arguments
    ThreadCreateWithAddress,
    /// Joins a worker and takes its result value
    ThreadWait,
    /// Pauses a worker at its next interrupt check
    ThreadPause,
    /// Resumes a paused worker
    ThreadResume,
    /// Asks a worker to stop at its next interrupt check
    ThreadCancel,
    /// Cancels a worker and discards its slot
    ThreadKill,
    /// Prints a value with optional width/precision operands
    PrintFormatted,
    /// Evaluates a shell loop-control value
    ShellLoopHelper,
    /// Maps a shell exit status to a boolean
    ShellConditionHelper,
    /// Builds a closure for an entry address in the current scope
    MakeClosure,
    /// Boxes a receiver behind its class's method table
    InterfaceBox,
    /// Looks up a method slot on a boxed receiver
    InterfaceLookup,
    /// Asserts a boxed receiver's class identity
    InterfaceAssert,
}

/// The fixed table of host callbacks
pub struct HostTable {
    slots: [Option<HostFn>; HOST_SLOT_COUNT],
}

impl HostTable {
    /// Replaces a slot
    pub fn register(&mut self, id: HostId, handler: HostFn) {
        self.slots[id as usize] = Some(handler);
    }

    /// Returns the callback in a slot
    pub fn get(&self, slot: u8) -> Result<HostFn> {
        self.slots
            .get(slot as usize)
            .copied()
            .flatten()
            .ok_or_else(|| Error::new(ErrorKind::EmptyHostSlot(slot)))
    }
}

impl Default for HostTable {
    fn default() -> Self {
        let mut table = Self {
            slots: [None; HOST_SLOT_COUNT],
        };
        table.register(HostId::QuitRequested, host_quit_requested);
        table.register(HostId::ThreadCreateWithAddress, host_thread_create);
        table.register(HostId::ThreadWait, host_thread_wait);
        table.register(HostId::ThreadPause, host_thread_pause);
        table.register(HostId::ThreadResume, host_thread_resume);
        table.register(HostId::ThreadCancel, host_thread_cancel);
        table.register(HostId::ThreadKill, host_thread_kill);
        table.register(HostId::PrintFormatted, host_print_formatted);
        table.register(HostId::ShellLoopHelper, host_shell_loop);
        table.register(HostId::ShellConditionHelper, host_shell_condition);
        table.register(HostId::MakeClosure, host_make_closure);
        table.register(HostId::InterfaceBox, host_interface_box);
        table.register(HostId::InterfaceLookup, host_interface_lookup);
        table.register(HostId::InterfaceAssert, host_interface_assert);
        table
    }
}

impl std::fmt::Debug for HostTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let filled = self.slots.iter().filter(|s| s.is_some()).count();
        write!(f, "HostTable({filled}/{HOST_SLOT_COUNT} slots)")
    }
}

fn host_quit_requested(vm: &mut Vm, _args: &mut [Value]) -> Result<Value> {
    Ok(Value::Bool(vm.context().interrupt_requested()))
}

fn host_thread_create(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let Some((callee, rest)) = args.split_first() else {
        return crate::runtime_error!("Thread creation expects a callable");
    };
    let job = match callee {
        Value::Closure(closure) => Job::Bytecode {
            entry: closure.proc.entry as usize,
            args: rest.iter().map(Value::deep_copy).collect(),
            env: closure.env.clone(),
        },
        Value::Int(int) => Job::Bytecode {
            entry: int.value as usize,
            args: rest.iter().map(Value::deep_copy).collect(),
            env: None,
        },
        other => return Err(crate::unexpected_type("a callable", other)),
    };
    let id = vm.context().threads.spawn(vm.context(), job)?;
    Ok(Value::Thread(id))
}

fn host_thread_wait(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let [Value::Thread(id)] = args else {
        return crate::runtime_error!("Thread wait expects a thread handle");
    };
    vm.context().threads.take_result(*id, vm.context())
}

fn thread_handle(args: &[Value], what: &str) -> Result<usize> {
    match args {
        [Value::Thread(id)] => Ok(*id),
        _ => crate::runtime_error!("Thread {what} expects a thread handle"),
    }
}

fn host_thread_pause(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    vm.context().threads.pause(thread_handle(args, "pause")?)?;
    Ok(Value::Nil)
}

fn host_thread_resume(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    vm.context().threads.resume(thread_handle(args, "resume")?)?;
    Ok(Value::Nil)
}

fn host_thread_cancel(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    vm.context().threads.cancel(thread_handle(args, "cancel")?)?;
    Ok(Value::Nil)
}

fn host_thread_kill(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    vm.context().threads.kill(thread_handle(args, "kill")?)?;
    Ok(Value::Nil)
}

fn host_print_formatted(_vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let (value, width, precision) = match args {
        [value] => (value, None, None),
        [value, width] => (value, format_operand(width)?, None),
        [value, width, precision] => (value, format_operand(width)?, format_operand(precision)?),
        _ => return crate::runtime_error!("Formatted print expects 1 to 3 arguments"),
    };
    print!("{}", value.format(width, precision));
    Ok(Value::Nil)
}

fn format_operand(value: &Value) -> Result<Option<usize>> {
    match value.as_i64()? {
        v if v < 0 => Ok(None),
        v => Ok(Some(v as usize)),
    }
}

fn host_shell_loop(_vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let [value] = args else {
        return crate::runtime_error!("Shell loop helper expects one value");
    };
    Ok(Value::Bool(value.is_truthy()))
}

fn host_shell_condition(_vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    // Shell semantics: exit status zero means success/true
    let [status] = args else {
        return crate::runtime_error!("Shell condition helper expects an exit status");
    };
    Ok(Value::Bool(status.as_i64()? == 0))
}

fn host_make_closure(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let [entry] = args else {
        return crate::runtime_error!("Closure creation expects an entry address");
    };
    let entry = entry.as_i64()? as u32;
    let proc = vm.proc_by_entry(entry)?;
    let env = vm.capture_env(&proc)?;
    Ok(Value::Closure(Closure { proc, env }))
}

fn host_interface_box(vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let [receiver, class_name] = args else {
        return crate::runtime_error!("Interface boxing expects a receiver and a class name");
    };
    let Value::Str(class_name) = class_name else {
        return Err(crate::unexpected_type("a class name", class_name));
    };
    let class_name = class_name.to_string();
    let vtable = vm.vtable_for(&class_name)?;
    Ok(Value::Interface(InterfaceValue {
        receiver: value_cell(std::mem::take(receiver)),
        class_name: vtable.class_name.clone(),
        vtable,
    }))
}

fn host_interface_lookup(_vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let [Value::Interface(interface), slot] = args else {
        return crate::runtime_error!("Interface lookup expects a boxed receiver and a slot");
    };
    let proc = interface.vtable.method(slot.as_i64()? as usize)?.clone();
    Ok(Value::Closure(Closure { proc, env: None }))
}

fn host_interface_assert(_vm: &mut Vm, args: &mut [Value]) -> Result<Value> {
    let [value, class_name] = args else {
        return crate::runtime_error!("Interface assertion expects a value and a class name");
    };
    let Value::Str(class_name) = class_name else {
        return Err(crate::unexpected_type("a class name", class_name));
    };
    let Value::Interface(interface) = value else {
        return Err(crate::unexpected_type("an interface", value));
    };
    if !interface
        .class_name
        .eq_ignore_ascii_case(&class_name.to_string())
    {
        return crate::runtime_error!(
            "Expected an instance of '{class_name}', found '{}'",
            interface.class_name
        );
    }
    Ok(value.clone())
}
