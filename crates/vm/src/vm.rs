//! The virtual machine
//!
//! One `Vm` per thread; all VMs for a run share a [SharedContext] holding
//! the installed program, the global tables, and the worker/mutex
//! registries. The dispatch loop is a single `Op` match with an
//! interrupt/abort poll per instruction.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use vireo_bytecode::{BYTECODE_VERSION, Chunk, Constant, Op, TypeTag};

use crate::{
    Address, AddressSlot, Error, ErrorKind, Frame, Global, GlobalCache, GlobalTable,
    MutexRegistry, PathSegment, Pointer, ProcInfo, ProcTable, Ptr, Result, ThreadRegistry, Value,
    Vtable,
    address::assign_value,
    builtins::{BuiltinRegistry, HostTable},
    globals::ConstGlobals,
    threads::{Job, Mailbox},
    value::{
        ArrayStorage, ArrayValue, ClosureEnv, FieldSlot, FileValue, IntValue, RealValue,
        RealWidth, RecordValue, VmString, value_cell,
    },
};

/// Configuration for a VM and its worker pool
#[derive(Clone, Debug)]
pub struct VmSettings {
    /// When set, string index 0 reads the string's length and writing to it
    /// sets the length. On for every front end except the shell dialect.
    pub legacy_length_index: bool,
    /// The worker-pool thread cap
    pub max_workers: usize,
    /// The operand stack limit
    pub stack_capacity: usize,
    /// The call stack limit
    pub frame_capacity: usize,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            legacy_length_index: true,
            max_workers: 8,
            stack_capacity: 4096,
            frame_capacity: 256,
        }
    }
}

/// A program installed for execution
#[derive(Clone)]
pub(crate) struct Program {
    pub(crate) chunk: Ptr<Chunk>,
    pub(crate) cache: Ptr<GlobalCache>,
    pub(crate) procs: Ptr<ProcTable>,
    pub(crate) const_globals: Ptr<ConstGlobals>,
}

/// The state shared between a VM and its workers
pub struct SharedContext {
    /// The run's settings
    pub settings: VmSettings,
    /// The global symbol table
    pub globals: GlobalTable,
    /// The guest mutex registry
    pub mutexes: MutexRegistry,
    /// The worker pool
    pub threads: ThreadRegistry,
    /// The registered builtins
    pub builtins: RwLock<BuiltinRegistry>,
    /// The host callback table
    pub host: RwLock<HostTable>,
    vtables: Mutex<FxHashMap<String, Ptr<Vtable>>>,
    program: Mutex<Option<Program>>,
    interrupt: AtomicBool,
    abort: AtomicBool,
}

impl SharedContext {
    fn new(settings: VmSettings) -> Self {
        Self {
            threads: ThreadRegistry::new(settings.max_workers),
            settings,
            globals: GlobalTable::new(),
            mutexes: MutexRegistry::new(),
            builtins: RwLock::new(BuiltinRegistry::new()),
            host: RwLock::new(HostTable::default()),
            vtables: Mutex::new(FxHashMap::default()),
            program: Mutex::new(None),
            interrupt: AtomicBool::new(false),
            abort: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn new_for_tests() -> Self {
        Self::new(VmSettings::default())
    }

    /// True once an interrupt has been requested or a fatal error has been
    /// raised anywhere in the run
    pub fn interrupt_requested(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed) || self.abort.load(Ordering::Relaxed)
    }

    /// Asks every VM sharing this context to stop at its next instruction
    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Relaxed);
        self.threads.interrupt_all();
    }

    /// Marks the run as fatally failed, stopping every VM
    pub fn raise_abort(&self) {
        self.abort.store(true, Ordering::Relaxed);
        self.threads.interrupt_all();
    }

    fn clear_flags(&self) {
        self.interrupt.store(false, Ordering::Relaxed);
        self.abort.store(false, Ordering::Relaxed);
    }

    fn install(&self, program: Program) {
        self.vtables.lock().clear();
        *self.program.lock() = Some(program);
    }

    pub(crate) fn program(&self) -> Option<Program> {
        self.program.lock().clone()
    }
}

impl std::fmt::Debug for SharedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SharedContext")
    }
}

/// A bytecode interpreter
pub struct Vm {
    context: Ptr<SharedContext>,
    program: Option<Program>,
    ip: usize,
    instruction_ip: usize,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    worker: Option<Ptr<Mailbox>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Makes a VM with default settings
    pub fn new() -> Self {
        Self::with_settings(VmSettings::default())
    }

    /// Makes a VM with the given settings
    pub fn with_settings(settings: VmSettings) -> Self {
        Self {
            context: Ptr::new(SharedContext::new(settings)),
            program: None,
            ip: 0,
            instruction_ip: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            worker: None,
        }
    }

    /// Makes the private VM for a worker thread
    pub(crate) fn for_worker(context: Ptr<SharedContext>, mailbox: Ptr<Mailbox>) -> Self {
        Self {
            program: context.program(),
            context,
            ip: 0,
            instruction_ip: 0,
            stack: Vec::new(),
            frames: Vec::new(),
            worker: Some(mailbox),
        }
    }

    /// The context shared with this VM's workers
    pub fn context(&self) -> &Ptr<SharedContext> {
        &self.context
    }

    /// Installs a program and runs it from an entry offset
    ///
    /// Returns the value left by the outermost `Return` (or by `Halt`).
    pub fn interpret(
        &mut self,
        chunk: Chunk,
        const_globals: ConstGlobals,
        procedures: ProcTable,
        entry: usize,
    ) -> Result<Value> {
        if chunk.version != BYTECODE_VERSION {
            return Err(Error::new(ErrorKind::VersionMismatch {
                expected: BYTECODE_VERSION,
                found: chunk.version,
            }));
        }

        let program = Program {
            cache: Ptr::new(GlobalCache::new(chunk.bytes.len())),
            chunk: Ptr::new(chunk),
            procs: Ptr::new(procedures),
            const_globals: Ptr::new(const_globals),
        };
        self.context.install(program.clone());
        self.program = Some(program);
        self.context.clear_flags();

        self.stack.clear();
        self.frames.clear();
        self.frames.push(Frame::top_level(0));
        self.ip = entry;
        self.execute()
    }

    /// Tears down the worker pool and clears the execution state
    ///
    /// Globals, builtins, and the mutex registry stay usable for the next
    /// run.
    pub fn reset(&mut self) {
        self.context.request_interrupt();
        self.context.threads.reset();
        self.context.clear_flags();
        self.stack.clear();
        self.frames.clear();
        self.ip = 0;
    }

    /// Runs a worker job to completion
    pub(crate) fn run_job(&mut self, job: Job) -> Result<Value> {
        match job {
            Job::Bytecode { entry, args, env } => {
                let program = self.require_program()?;
                let proc = match program.procs.get_by_entry(entry as u32) {
                    Some(proc) => proc.clone(),
                    None => Ptr::new(ProcInfo::new("thread", entry as u32, args.len() as u8, 0)),
                };
                self.stack.clear();
                self.frames.clear();
                self.call_routine(proc, args, env, None, false)?;
                self.execute()
            }
            Job::Builtin { name, mut args } => {
                let (handler, _) = self.context.builtins.read().get(&name)?;
                handler(self, &mut args)
            }
            Job::Host { id, mut args } => {
                let handler = self.context.host.read().get(id)?;
                handler(self, &mut args)
            }
        }
    }

    /// The routine registered for a bytecode entry offset
    pub fn proc_by_entry(&self, entry: u32) -> Result<Ptr<ProcInfo>> {
        self.program
            .as_ref()
            .and_then(|p| p.procs.get_by_entry(entry).cloned())
            .ok_or_else(|| Error::new(ErrorKind::UnknownProcedure(format!("entry {entry}"))))
    }

    /// The cached method table for a lowered class name
    pub fn vtable_for(&self, class: &str) -> Result<Ptr<Vtable>> {
        let key = class.to_lowercase();
        let mut vtables = self.context.vtables.lock();
        if let Some(vtable) = vtables.get(&key) {
            return Ok(vtable.clone());
        }
        let program = self.require_program()?;
        let vtable = program
            .procs
            .build_vtable(&key)
            .map(Ptr::new)
            .ok_or_else(|| Error::new(ErrorKind::UnknownClass(key.clone())))?;
        vtables.insert(key, vtable.clone());
        Ok(vtable)
    }

    /// Builds the capture environment for a routine, binding against the
    /// current frame
    ///
    /// By-reference captures alias the live cell; by-value captures snapshot
    /// the current value into a fresh cell.
    pub fn capture_env(&self, proc: &Ptr<ProcInfo>) -> Result<Option<Ptr<ClosureEnv>>> {
        if proc.upvalues.is_empty() {
            return Ok(None);
        }
        let frame = self.frame()?;
        let mut slots = Vec::with_capacity(proc.upvalues.len());
        for desc in proc.upvalues.iter() {
            let source = if desc.is_local {
                frame.locals.get(desc.index as usize)
            } else {
                frame.upvalues.get(desc.index as usize)
            };
            let cell = source
                .ok_or_else(|| Error::from(format!("Invalid capture index {}", desc.index)))?;
            slots.push(if desc.is_ref {
                cell.clone()
            } else {
                value_cell(cell.borrow().clone())
            });
        }
        Ok(Some(Ptr::new(ClosureEnv {
            proc: proc.clone(),
            slots,
        })))
    }

    fn require_program(&self) -> Result<Program> {
        self.program
            .clone()
            .ok_or_else(|| Error::from("No program installed"))
    }

    fn execute(&mut self) -> Result<Value> {
        let program = self.require_program()?;
        match self.run_loop(&program) {
            Ok(result) => Ok(result),
            Err(mut error) => {
                error.extend_trace(
                    self.instruction_ip as u32,
                    program.chunk.line_for(self.instruction_ip),
                );
                while let Some(frame) = self.frames.pop() {
                    self.stack.truncate(frame.stack_base);
                    if !self.frames.is_empty() {
                        error.extend_trace(
                            frame.return_ip as u32,
                            program.chunk.line_for(frame.return_ip),
                        );
                    }
                }
                if !error.is_interrupt() {
                    log::error!("runtime error: {error}");
                    self.context.raise_abort();
                }
                Err(error)
            }
        }
    }

    fn run_loop(&mut self, program: &Program) -> Result<Value> {
        let chunk = program.chunk.clone();
        loop {
            self.poll_interrupt()?;
            self.instruction_ip = self.ip;
            let op = Op::from(self.read_byte(&chunk)?);
            match op {
                Op::Return | Op::Exit => {
                    let frame = self.frames.pop().ok_or(ErrorKind::EmptyCallStack)?;
                    let result = if self.stack.len() > frame.stack_base {
                        self.pop()?
                    } else {
                        Value::Nil
                    };
                    self.stack.truncate(frame.stack_base);
                    if self.frames.is_empty() {
                        return Ok(result);
                    }
                    self.ip = frame.return_ip;
                    if !frame.discard_result {
                        self.push(result)?;
                    }
                }
                Op::Halt => {
                    let result = self.stack.pop().unwrap_or(Value::Nil);
                    self.stack.clear();
                    self.frames.clear();
                    return Ok(result);
                }
                Op::Constant => {
                    let index = self.read_byte(&chunk)? as u16;
                    let value = self.constant_value(&chunk, index)?;
                    self.push(value)?;
                }
                Op::Constant16 => {
                    let index = self.read_u16(&chunk)?;
                    let value = self.constant_value(&chunk, index)?;
                    self.push(value)?;
                }
                Op::Const0 => self.push(Value::int(0))?,
                Op::Const1 => self.push(Value::int(1))?,
                Op::ConstTrue => self.push(Value::Bool(true))?,
                Op::ConstFalse => self.push(Value::Bool(false))?,
                Op::PushInt8 => {
                    let n = self.read_byte(&chunk)? as i8;
                    self.push(Value::int(n as i64))?;
                }
                Op::Add
                | Op::Subtract
                | Op::Multiply
                | Op::Divide
                | Op::IntDiv
                | Op::Mod
                | Op::And
                | Op::Or
                | Op::Xor
                | Op::Shl
                | Op::Shr => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let result = eval_binary(op, lhs, rhs)?;
                    self.push(result)?;
                }
                Op::Equal
                | Op::NotEqual
                | Op::Greater
                | Op::GreaterEqual
                | Op::Less
                | Op::LessEqual => {
                    let rhs = self.pop()?;
                    let lhs = self.pop()?;
                    let result = eval_compare(op, &lhs, &rhs)?;
                    self.push(Value::Bool(result))?;
                }
                Op::Negate => {
                    let value = chase(self.pop()?)?;
                    let result = match value {
                        Value::Int(int) => {
                            let negated = int.value.checked_neg().ok_or(
                                ErrorKind::IntegerOverflow { op: "negate" },
                            )?;
                            Value::Int(IntValue::with_width(int.width, negated))
                        }
                        Value::Real(real) => {
                            Value::Real(RealValue { width: real.width, value: -real.value })
                        }
                        other => return Err(crate::unexpected_type("a number", &other)),
                    };
                    self.push(result)?;
                }
                Op::Not => {
                    let value = chase(self.pop()?)?;
                    let result = match value {
                        Value::Bool(b) => Value::Bool(!b),
                        Value::Int(int) => Value::Int(IntValue::with_width(int.width, !int.value)),
                        other => return Err(crate::unexpected_type("a boolean or integer", &other)),
                    };
                    self.push(result)?;
                }
                Op::ToBool => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_truthy()))?;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_i16(&chunk)?;
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.jump_by(offset)?;
                    }
                }
                Op::Jump => {
                    let offset = self.read_i16(&chunk)?;
                    self.jump_by(offset)?;
                }
                Op::Swap => {
                    let len = self.stack.len();
                    if len < 2 {
                        return Err(Error::new(ErrorKind::StackUnderflow));
                    }
                    self.stack.swap(len - 1, len - 2);
                }
                Op::Dup => {
                    let top = self
                        .stack
                        .last()
                        .cloned()
                        .ok_or(ErrorKind::StackUnderflow)?;
                    self.push(top)?;
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::DefineGlobal => self.define_global(&chunk, false)?,
                Op::DefineGlobal16 => self.define_global(&chunk, true)?,
                Op::GetGlobal | Op::GetGlobal16 => {
                    let name = self.read_name(&chunk, op == Op::GetGlobal16)?;
                    let global = self.cached_global(program, &name)?;
                    let value = global.value.borrow().clone();
                    self.push(value)?;
                }
                Op::SetGlobal | Op::SetGlobal16 => {
                    let name = self.read_name(&chunk, op == Op::SetGlobal16)?;
                    let global = self.cached_global(program, &name)?;
                    if global.is_const {
                        return Err(Error::new(ErrorKind::AssignToConst(name.to_string())));
                    }
                    let value = self.pop()?;
                    assign_value(&mut global.value.borrow_mut(), value)?;
                }
                Op::GetGlobalAddress | Op::GetGlobalAddress16 => {
                    let name = self.read_name(&chunk, op == Op::GetGlobalAddress16)?;
                    let global = self.cached_global(program, &name)?;
                    self.push(Value::Pointer(Pointer::Cell(Address::whole(
                        global.value.clone(),
                    ))))?;
                }
                Op::GetLocal => {
                    let slot = self.read_byte(&chunk)? as usize;
                    let value = self.local(slot)?.borrow().clone();
                    self.push(value)?;
                }
                Op::SetLocal => {
                    let slot = self.read_byte(&chunk)? as usize;
                    let value = self.pop()?;
                    let cell = self.local(slot)?.clone();
                    assign_value(&mut cell.borrow_mut(), value)?;
                }
                Op::IncLocal => self.step_local(&chunk, 1)?,
                Op::DecLocal => self.step_local(&chunk, -1)?,
                Op::InitLocalArray => {
                    let slot = self.read_byte(&chunk)? as usize;
                    let array = self.read_array_shape(&chunk)?;
                    *self.local(slot)?.borrow_mut() = Value::Array(array);
                }
                Op::InitLocalFile => {
                    let slot = self.read_byte(&chunk)? as usize;
                    *self.local(slot)?.borrow_mut() = Value::File(FileValue::default());
                }
                Op::InitLocalPointer => {
                    let slot = self.read_byte(&chunk)? as usize;
                    *self.local(slot)?.borrow_mut() = Value::Pointer(Pointer::Nil);
                }
                Op::InitLocalString => {
                    let slot = self.read_byte(&chunk)? as usize;
                    let len_index = self.read_u16(&chunk)?;
                    let max_len = self.constant_int(&chunk, len_index)?;
                    let string = if max_len == 0 {
                        VmString::default()
                    } else {
                        VmString::fixed(max_len as usize)
                    };
                    *self.local(slot)?.borrow_mut() = Value::Str(string);
                }
                Op::InitFieldArray => {
                    let field = self.read_u16(&chunk)? as usize;
                    let array = self.read_array_shape(&chunk)?;
                    let base = self.pop()?;
                    let address = base_address(base)?.child(PathSegment::Field(field))?;
                    address.store(Value::Array(array))?;
                }
                Op::GetLocalAddress => {
                    let slot = self.read_byte(&chunk)? as usize;
                    let cell = self.local(slot)?.clone();
                    self.push(Value::Pointer(Pointer::Cell(Address::whole(cell))))?;
                }
                Op::GetUpvalue => {
                    let index = self.read_byte(&chunk)? as usize;
                    let value = self.upvalue(index)?.borrow().clone();
                    self.push(value)?;
                }
                Op::SetUpvalue => {
                    let index = self.read_byte(&chunk)? as usize;
                    let value = self.pop()?;
                    let cell = self.upvalue(index)?.clone();
                    assign_value(&mut cell.borrow_mut(), value)?;
                }
                Op::GetUpvalueAddress => {
                    let index = self.read_byte(&chunk)? as usize;
                    let cell = self.upvalue(index)?.clone();
                    self.push(Value::Pointer(Pointer::Cell(Address::whole(cell))))?;
                }
                Op::GetFieldAddress | Op::GetFieldAddress16 => {
                    let name = self.read_name(&chunk, op == Op::GetFieldAddress16)?;
                    let base = self.pop()?;
                    let address = base_address(base)?;
                    let index = address.read(|value| match value {
                        Value::Record(record) => record.field_index(&name),
                        other => Err(crate::unexpected_type("a record", other)),
                    })?;
                    let address = address.child(PathSegment::Field(index))?;
                    self.push(Value::Pointer(Pointer::Cell(address)))?;
                }
                Op::LoadFieldValueByName | Op::LoadFieldValueByName16 => {
                    let name = self.read_name(&chunk, op == Op::LoadFieldValueByName16)?;
                    let base = self.pop()?;
                    let value = match base {
                        Value::Record(record) => {
                            let index = record.field_index(&name)?;
                            record.fields[index].value.clone()
                        }
                        other => {
                            let address = base_address(other)?;
                            address.read(|value| match value {
                                Value::Record(record) => {
                                    let index = record.field_index(&name)?;
                                    Ok(record.fields[index].value.clone())
                                }
                                other => Err(crate::unexpected_type("a record", other)),
                            })?
                        }
                    };
                    self.push(value)?;
                }
                Op::GetElementAddress => {
                    let address = self.element_address(&chunk)?;
                    self.push(Value::Pointer(Pointer::Cell(address)))?;
                }
                Op::GetElementAddressConst => {
                    let flat = self.read_u16(&chunk)? as usize;
                    let address = self.const_element_address(flat)?;
                    self.push(Value::Pointer(Pointer::Cell(address)))?;
                }
                Op::LoadElementValue => {
                    let address = self.element_address(&chunk)?;
                    let value = address.load()?;
                    self.push(value)?;
                }
                Op::LoadElementValueConst => {
                    let flat = self.read_u16(&chunk)? as usize;
                    let address = self.const_element_address(flat)?;
                    let value = address.load()?;
                    self.push(value)?;
                }
                Op::GetCharAddress => {
                    let index = self.pop()?.as_i64()?;
                    let base = self.pop()?;
                    let address = base_address(base)?;
                    let slot = self.string_slot(&address, index)?;
                    self.push(Value::Pointer(Pointer::Cell(address.with_slot(slot))))?;
                }
                Op::SetIndirect => {
                    let value = self.pop()?;
                    let pointer = self.pop()?;
                    match pointer {
                        Value::Pointer(pointer) => pointer.store(value)?,
                        other => return Err(crate::unexpected_type("a pointer", &other)),
                    }
                }
                Op::GetIndirect => {
                    let pointer = self.pop()?;
                    let value = match pointer {
                        Value::Pointer(pointer) => pointer.load()?,
                        other => return Err(crate::unexpected_type("a pointer", &other)),
                    };
                    self.push(value)?;
                }
                Op::In => {
                    let set = chase(self.pop()?)?;
                    let value = self.pop()?;
                    let set = match set {
                        Value::Set(set) => set,
                        other => return Err(crate::unexpected_type("a set", &other)),
                    };
                    let ordinal = value.ordinal()?;
                    self.push(Value::Bool(set.contains(ordinal)))?;
                }
                Op::GetCharFromString => {
                    let index = self.pop()?.as_i64()?;
                    let string = match chase(self.pop()?)? {
                        Value::Str(string) => string,
                        other => return Err(crate::unexpected_type("a string", &other)),
                    };
                    let legacy = self.context.settings.legacy_length_index;
                    let result = if legacy && index == 0 {
                        Value::int(string.len() as i64)
                    } else {
                        let offset = index - 1;
                        let byte = (offset >= 0)
                            .then(|| string.bytes.get(offset as usize).copied())
                            .flatten()
                            .ok_or_else(|| {
                                Error::new(ErrorKind::IndexOutOfRange {
                                    index,
                                    min: if legacy { 0 } else { 1 },
                                    max: string.len() as i64,
                                })
                            })?;
                        Value::Char(byte)
                    };
                    self.push(result)?;
                }
                Op::AllocObject | Op::AllocObject16 => {
                    let field_count = if op == Op::AllocObject16 {
                        self.read_u16(&chunk)? as usize
                    } else {
                        self.read_byte(&chunk)? as usize
                    };
                    let record = RecordValue {
                        class: None,
                        fields: (0..field_count)
                            .map(|_| FieldSlot {
                                name: "".into(),
                                value: Value::Nil,
                            })
                            .collect(),
                    };
                    let cell = value_cell(Value::Record(record));
                    self.push(Value::Pointer(Pointer::Cell(Address::whole(cell))))?;
                }
                Op::GetFieldOffset | Op::GetFieldOffset16 => {
                    let field = if op == Op::GetFieldOffset16 {
                        self.read_u16(&chunk)? as usize
                    } else {
                        self.read_byte(&chunk)? as usize
                    };
                    let base = self.pop()?;
                    let address = base_address(base)?.child(PathSegment::Field(field))?;
                    self.push(Value::Pointer(Pointer::Cell(address)))?;
                }
                Op::LoadFieldValue | Op::LoadFieldValue16 => {
                    let field = if op == Op::LoadFieldValue16 {
                        self.read_u16(&chunk)? as usize
                    } else {
                        self.read_byte(&chunk)? as usize
                    };
                    let base = self.pop()?;
                    let value = match base {
                        Value::Record(record) => record
                            .fields
                            .get(field)
                            .map(|f| f.value.clone())
                            .ok_or_else(|| {
                                Error::new(ErrorKind::UnknownField(field.to_string()))
                            })?,
                        other => base_address(other)?
                            .child(PathSegment::Field(field))?
                            .load()?,
                    };
                    self.push(value)?;
                }
                Op::CallBuiltin => {
                    let name = self.read_str_constant(&chunk)?;
                    let argc = self.read_byte(&chunk)? as usize;
                    let mut args = self.pop_args(argc)?;
                    let (handler, is_function) = self.context.builtins.read().get(&name)?;
                    let result = handler(self, &mut args)?;
                    if is_function {
                        self.push(result)?;
                    }
                }
                Op::CallBuiltinProc => {
                    let id = self.read_u16(&chunk)? as usize;
                    let name = self.read_str_constant(&chunk)?;
                    let argc = self.read_byte(&chunk)? as usize;
                    let mut args = self.pop_args(argc)?;
                    let (handler, _) = self.context.builtins.read().get_by_id(id, &name)?;
                    handler(self, &mut args)?;
                }
                Op::CallHost => {
                    let id = self.read_byte(&chunk)?;
                    let argc = self.read_byte(&chunk)? as usize;
                    let mut args = self.pop_args(argc)?;
                    let handler = self.context.host.read().get(id)?;
                    let result = handler(self, &mut args)?;
                    self.push(result)?;
                }
                Op::Call => {
                    let name = self.read_str_constant(&chunk)?;
                    let entry = self.read_u16(&chunk)? as u32;
                    let argc = self.read_byte(&chunk)? as usize;
                    let args = self.pop_args(argc)?;
                    let proc = program
                        .procs
                        .get_by_entry(entry)
                        .or_else(|| program.procs.get(&name))
                        .cloned()
                        .ok_or_else(|| {
                            Error::new(ErrorKind::UnknownProcedure(name.to_string()))
                        })?;
                    self.call_routine(proc, args, None, None, false)?;
                }
                Op::CallIndirect | Op::ProcCallIndirect => {
                    let argc = self.read_byte(&chunk)? as usize;
                    let args = self.pop_args(argc)?;
                    let callee = self.pop()?;
                    let discard = op == Op::ProcCallIndirect;
                    match callee {
                        Value::Closure(closure) => {
                            self.call_routine(closure.proc, args, closure.env, None, discard)?;
                        }
                        Value::Int(int) => {
                            let proc = self.proc_by_entry(int.value as u32)?;
                            self.call_routine(proc, args, None, None, discard)?;
                        }
                        other => return Err(crate::unexpected_type("a callable", &other)),
                    }
                }
                Op::CallMethod => {
                    let method = self.read_byte(&chunk)? as usize;
                    let argc = self.read_byte(&chunk)? as usize;
                    let args = self.pop_args(argc)?;
                    let receiver = self.pop()?;
                    self.call_method(receiver, method, args)?;
                }
                Op::FormatValue => {
                    let width = self.read_byte(&chunk)?;
                    let precision = self.read_byte(&chunk)?;
                    let value = self.pop()?;
                    let formatted = value.format(
                        (width != u8::MAX).then_some(width as usize),
                        (precision != u8::MAX).then_some(precision as usize),
                    );
                    self.push(Value::string(&formatted))?;
                }
                Op::ThreadCreate => {
                    let entry = self.read_u16(&chunk)? as usize;
                    let job = Job::Bytecode {
                        entry,
                        args: Vec::new(),
                        env: None,
                    };
                    let id = self.context.threads.spawn(&self.context, job)?;
                    self.push(Value::Thread(id))?;
                }
                Op::ThreadJoin => {
                    let id = self.pop_handle()?;
                    self.context.threads.take_status(id, &self.context)?;
                }
                Op::MutexCreate => {
                    let handle = self.context.mutexes.create(false)?;
                    self.push(Value::int(handle as i64))?;
                }
                Op::RcMutexCreate => {
                    let handle = self.context.mutexes.create(true)?;
                    self.push(Value::int(handle as i64))?;
                }
                Op::MutexLock => {
                    let handle = self.pop_handle()?;
                    self.context.mutexes.lock(handle, &self.context)?;
                }
                Op::MutexUnlock => {
                    let handle = self.pop_handle()?;
                    self.context.mutexes.unlock(handle)?;
                }
                Op::MutexDestroy => {
                    let handle = self.pop_handle()?;
                    self.context.mutexes.destroy(handle)?;
                }
                _ => {
                    return crate::runtime_error!(
                        "Unexpected opcode {op:?} at offset {}",
                        self.instruction_ip
                    );
                }
            }
        }
    }

    fn poll_interrupt(&self) -> Result<()> {
        if self.context.interrupt_requested() {
            return Err(Error::new(ErrorKind::Interrupted));
        }
        if let Some(mailbox) = &self.worker {
            if mailbox.cancelled() || !mailbox.wait_while_paused(&self.context) {
                return Err(Error::new(ErrorKind::Interrupted));
            }
        }
        Ok(())
    }

    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= self.context.settings.stack_capacity {
            return Err(Error::new(ErrorKind::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| Error::new(ErrorKind::StackUnderflow))
    }

    fn pop_args(&mut self, argc: usize) -> Result<Vec<Value>> {
        if self.stack.len() < argc {
            return Err(Error::new(ErrorKind::StackUnderflow));
        }
        Ok(self.stack.split_off(self.stack.len() - argc))
    }

    fn pop_handle(&mut self) -> Result<usize> {
        match self.pop()? {
            Value::Thread(id) => Ok(id),
            value => Ok(value.as_i64()? as usize),
        }
    }

    fn frame(&self) -> Result<&Frame> {
        self.frames.last().ok_or_else(|| Error::new(ErrorKind::EmptyCallStack))
    }

    fn local(&self, slot: usize) -> Result<&crate::ValueCell> {
        self.frame()?
            .local(slot)
            .ok_or_else(|| Error::from(format!("Invalid local slot {slot}")))
    }

    fn upvalue(&self, index: usize) -> Result<&crate::ValueCell> {
        self.frame()?
            .upvalues
            .get(index)
            .ok_or_else(|| Error::from(format!("Invalid capture index {index}")))
    }

    fn step_local(&mut self, chunk: &Chunk, delta: i64) -> Result<()> {
        let slot = self.read_byte(chunk)? as usize;
        let cell = self.local(slot)?.clone();
        let mut value = cell.borrow_mut();
        match &mut *value {
            Value::Int(int) => {
                let stepped = int
                    .value
                    .checked_add(delta)
                    .ok_or(ErrorKind::IntegerOverflow { op: "step" })?;
                if !int.width.in_range(stepped) {
                    log::warn!("value {stepped} out of range for {:?} storage, wrapping", int.width);
                }
                int.value = int.width.wrap(stepped);
                Ok(())
            }
            other => Err(crate::unexpected_type("an integer", other)),
        }
    }

    fn jump_by(&mut self, offset: i16) -> Result<()> {
        let target = self.ip as i64 + offset as i64;
        if target < 0 {
            return Err(Error::new(ErrorKind::TruncatedInstruction));
        }
        self.ip = target as usize;
        Ok(())
    }

    fn read_byte(&mut self, chunk: &Chunk) -> Result<u8> {
        let byte = chunk
            .bytes
            .get(self.ip)
            .copied()
            .ok_or(ErrorKind::TruncatedInstruction)?;
        self.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self, chunk: &Chunk) -> Result<u16> {
        let hi = self.read_byte(chunk)?;
        let lo = self.read_byte(chunk)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn read_i16(&mut self, chunk: &Chunk) -> Result<i16> {
        Ok(self.read_u16(chunk)? as i16)
    }

    fn read_name(&mut self, chunk: &Chunk, wide: bool) -> Result<std::sync::Arc<str>> {
        let index = if wide {
            self.read_u16(chunk)?
        } else {
            self.read_byte(chunk)? as u16
        };
        self.constant_str(chunk, index)
    }

    fn read_str_constant(&mut self, chunk: &Chunk) -> Result<std::sync::Arc<str>> {
        let index = self.read_u16(chunk)?;
        self.constant_str(chunk, index)
    }

    fn constant_str(&self, chunk: &Chunk, index: u16) -> Result<std::sync::Arc<str>> {
        chunk
            .constant(index)
            .and_then(Constant::as_str)
            .cloned()
            .ok_or_else(|| Error::from(format!("Expected a string constant at index {index}")))
    }

    fn constant_int(&self, chunk: &Chunk, index: u16) -> Result<i64> {
        chunk
            .constant(index)
            .and_then(Constant::as_int)
            .ok_or_else(|| Error::from(format!("Expected an integer constant at index {index}")))
    }

    fn constant_value(&self, chunk: &Chunk, index: u16) -> Result<Value> {
        let constant = chunk
            .constant(index)
            .ok_or_else(|| Error::from(format!("Invalid constant index {index}")))?;
        Ok(match constant {
            Constant::Int(n) => Value::int(*n),
            Constant::Real(x) => Value::real(*x),
            Constant::Str(s) => Value::string(s),
            Constant::Char(c) => Value::Char(*c),
            Constant::Bool(b) => Value::Bool(*b),
        })
    }

    fn cached_global(&self, program: &Program, name: &str) -> Result<Ptr<Global>> {
        program
            .cache
            .get_or_resolve(self.instruction_ip, || self.resolve_global(program, name))
    }

    fn resolve_global(&self, program: &Program, name: &str) -> Result<Ptr<Global>> {
        if let Some(global) = program.const_globals.get(name) {
            return Ok(global.clone());
        }
        self.context
            .globals
            .get(name)
            .ok_or_else(|| Error::new(ErrorKind::UndefinedGlobal(name.into())))
    }

    fn define_global(&mut self, chunk: &Chunk, wide: bool) -> Result<()> {
        let name = self.read_name(chunk, wide)?;
        let tag = TypeTag::from_byte(self.read_byte(chunk)?);
        let initial = match tag {
            TypeTag::Array => {
                let array = self.read_array_shape(chunk)?;
                let _elem_type_name = self.read_u16(chunk)?;
                Value::Array(array)
            }
            TypeTag::String => {
                let _type_name = self.read_u16(chunk)?;
                let len_index = self.read_u16(chunk)?;
                let max_len = self.constant_int(chunk, len_index)?;
                if max_len == 0 {
                    Value::Str(VmString::default())
                } else {
                    Value::Str(VmString::fixed(max_len as usize))
                }
            }
            TypeTag::File => {
                let _type_name = self.read_u16(chunk)?;
                let elem = TypeTag::from_byte(self.read_byte(chunk)?);
                let _elem_type_name = self.read_u16(chunk)?;
                Value::File(FileValue {
                    path: None,
                    elem,
                    open: false,
                })
            }
            _ => {
                let _type_name = self.read_u16(chunk)?;
                Value::default_for_type(tag)
            }
        };
        self.context.globals.define(&name, tag, false, initial);
        Ok(())
    }

    // Reads `[dim_count] { [lower const[2]] [upper const[2]] }* [elem type]`
    fn read_array_shape(&mut self, chunk: &Chunk) -> Result<ArrayValue> {
        let dim_count = self.read_byte(chunk)? as usize;
        let mut bounds = SmallVec::new();
        for _ in 0..dim_count {
            let lower_index = self.read_u16(chunk)?;
            let upper_index = self.read_u16(chunk)?;
            let lower = self.constant_int(chunk, lower_index)?;
            let upper = self.constant_int(chunk, upper_index)?;
            bounds.push((lower, upper));
        }
        let elem = TypeTag::from_byte(self.read_byte(chunk)?);
        Ok(ArrayValue::new(bounds, elem))
    }

    fn element_address(&mut self, chunk: &Chunk) -> Result<Address> {
        let dim_count = self.read_byte(chunk)? as usize;
        let mut indices = Vec::with_capacity(dim_count);
        for _ in 0..dim_count {
            indices.push(self.pop()?.as_i64()?);
        }
        indices.reverse();
        let base = self.pop()?;
        let address = base_address(base)?;

        enum Target {
            Flat { flat: usize, packed: bool },
            Text,
        }
        let target = address.read(|value| match value {
            Value::Array(array) => {
                let flat = array.flatten(&indices)?;
                Ok(Target::Flat {
                    flat,
                    packed: matches!(array.storage, ArrayStorage::Packed(_)),
                })
            }
            Value::Str(_) if dim_count == 1 => Ok(Target::Text),
            other => Err(crate::unexpected_type("an array or string", other)),
        })?;

        match target {
            Target::Flat { flat, packed } => {
                if packed {
                    Ok(address.with_slot(AddressSlot::PackedByte(flat)))
                } else {
                    address.child(PathSegment::Element(flat))
                }
            }
            Target::Text => {
                let slot = self.string_slot(&address, indices[0])?;
                Ok(address.with_slot(slot))
            }
        }
    }

    fn const_element_address(&mut self, flat: usize) -> Result<Address> {
        let base = self.pop()?;
        let address = base_address(base)?;
        let packed = address.read(|value| match value {
            Value::Array(array) => Ok(matches!(array.storage, ArrayStorage::Packed(_))),
            other => Err(crate::unexpected_type("an array", other)),
        })?;
        if packed {
            Ok(address.with_slot(AddressSlot::PackedByte(flat)))
        } else {
            address.child(PathSegment::Element(flat))
        }
    }

    fn string_slot(&self, address: &Address, index: i64) -> Result<AddressSlot> {
        let legacy = self.context.settings.legacy_length_index;
        if legacy && index == 0 {
            return Ok(AddressSlot::StringLength);
        }
        if index >= 1 {
            return Ok(AddressSlot::StringChar((index - 1) as usize));
        }
        let len = address.read(|value| match value {
            Value::Str(s) => Ok(s.len() as i64),
            other => Err(crate::unexpected_type("a string", other)),
        })?;
        Err(Error::new(ErrorKind::IndexOutOfRange {
            index,
            min: if legacy { 0 } else { 1 },
            max: len,
        }))
    }

    fn call_method(&mut self, receiver: Value, method: usize, mut args: Vec<Value>) -> Result<()> {
        let (proc, vtable, self_arg) = match receiver {
            Value::Interface(interface) => {
                let proc = interface.vtable.method(method)?.clone();
                let self_arg =
                    Value::Pointer(Pointer::Cell(Address::whole(interface.receiver.clone())));
                (proc, interface.vtable, self_arg)
            }
            Value::Pointer(Pointer::Cell(address)) => {
                let class = address.read(|value| match value {
                    Value::Record(record) => match &record.class {
                        Some(class) => Ok(class.to_string()),
                        // Hidden slot 0 carries the class identity for
                        // compiler-allocated objects
                        None => match record.fields.first().map(|f| &f.value) {
                            Some(Value::Str(s)) => Ok(s.to_string()),
                            _ => Err(Error::new(ErrorKind::UnknownClass("<anonymous>".into()))),
                        },
                    },
                    other => Err(crate::unexpected_type("an object", other)),
                })?;
                let vtable = self.vtable_for(&class)?;
                let proc = vtable.method(method)?.clone();
                (proc, vtable, Value::Pointer(Pointer::Cell(address)))
            }
            other => return Err(crate::unexpected_type("an object or interface", &other)),
        };
        args.insert(0, self_arg);
        self.call_routine(proc, args, None, Some(vtable), false)
    }

    /// Pushes a call frame for a routine and transfers control to its entry
    pub(crate) fn call_routine(
        &mut self,
        proc: Ptr<ProcInfo>,
        args: Vec<Value>,
        env: Option<Ptr<ClosureEnv>>,
        vtable: Option<Ptr<Vtable>>,
        discard_result: bool,
    ) -> Result<()> {
        if !proc.defined {
            return Err(Error::new(ErrorKind::UnknownProcedure(proc.name.to_string())));
        }
        if args.len() != proc.arity as usize {
            return Err(Error::new(ErrorKind::ArityMismatch {
                name: proc.name.to_string(),
                expected: proc.arity,
                found: args.len() as u8,
            }));
        }
        if self.frames.len() >= self.context.settings.frame_capacity {
            return Err(Error::new(ErrorKind::FrameOverflow));
        }

        let mut locals = Vec::with_capacity(proc.arity as usize + proc.locals_count as usize);
        for arg in args {
            locals.push(value_cell(arg));
        }
        locals.resize_with(proc.arity as usize + proc.locals_count as usize, || {
            value_cell(Value::Nil)
        });

        let upvalues = match &env {
            Some(env) => env.slots.clone(),
            None => self.bind_upvalues(&proc)?,
        };

        self.frames.push(Frame {
            return_ip: self.ip,
            stack_base: self.stack.len(),
            locals,
            upvalues,
            env,
            vtable,
            discard_result,
            proc: Some(proc.clone()),
        });
        self.ip = proc.entry as usize;
        Ok(())
    }

    // Resolves a nested routine's captures against the live frame of its
    // enclosing routine
    fn bind_upvalues(&self, proc: &Ptr<ProcInfo>) -> Result<Vec<crate::ValueCell>> {
        if proc.upvalues.is_empty() {
            return Ok(Vec::new());
        }
        let Some(enclosing) = &proc.enclosing else {
            return crate::runtime_error!("'{}' captures variables but has no parent", proc.name);
        };
        let frame = self
            .frames
            .iter()
            .rev()
            .find(|frame| {
                frame
                    .proc
                    .as_ref()
                    .is_some_and(|p| Ptr::ptr_eq(p, enclosing))
            })
            .ok_or_else(|| {
                Error::from(format!("No live frame for '{}'", enclosing.name))
            })?;

        let mut cells = Vec::with_capacity(proc.upvalues.len());
        for desc in proc.upvalues.iter() {
            let source = if desc.is_local {
                frame.locals.get(desc.index as usize)
            } else {
                frame.upvalues.get(desc.index as usize)
            };
            let cell = source
                .ok_or_else(|| Error::from(format!("Invalid capture index {}", desc.index)))?;
            cells.push(if desc.is_ref {
                cell.clone()
            } else {
                value_cell(cell.borrow().clone())
            });
        }
        Ok(cells)
    }
}

// Loads through a pointer operand so arithmetic can act on the pointee
fn chase(value: Value) -> Result<Value> {
    match value {
        Value::Pointer(Pointer::Cell(address)) => address.load(),
        other => Ok(other),
    }
}

// Resolves a base operand for field/element addressing, following chains of
// pointers stored in cells
fn base_address(base: Value) -> Result<Address> {
    match base {
        Value::Pointer(Pointer::Cell(mut address)) => loop {
            let next = address.read(|value| match value {
                Value::Pointer(Pointer::Cell(inner)) => Ok(Some(inner.clone())),
                Value::Pointer(Pointer::Nil) => Err(Error::new(ErrorKind::NilDereference)),
                _ => Ok(None),
            })?;
            match next {
                Some(inner) => address = inner,
                None => return Ok(address),
            }
        },
        Value::Pointer(Pointer::Nil) => Err(Error::new(ErrorKind::NilDereference)),
        Value::Pointer(Pointer::Opaque(_)) => {
            crate::runtime_error!("Cannot dereference an opaque pointer")
        }
        Value::Interface(interface) => Ok(Address::whole(interface.receiver)),
        other => Err(crate::unexpected_type("a pointer", &other)),
    }
}

fn op_name(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Subtract => "-",
        Op::Multiply => "*",
        Op::Divide => "/",
        Op::IntDiv => "div",
        Op::Mod => "mod",
        Op::And => "and",
        Op::Or => "or",
        Op::Xor => "xor",
        Op::Shl => "shl",
        Op::Shr => "shr",
        Op::Equal => "=",
        Op::NotEqual => "<>",
        Op::Greater => ">",
        Op::GreaterEqual => ">=",
        Op::Less => "<",
        Op::LessEqual => "<=",
        _ => "?",
    }
}

// The binary-operator promotion ladder: strings/chars concatenate under Add,
// enums offset by integers, sets combine, and numerics promote to real when
// either side is real. `/` always produces a real; div/mod are integer-only.
fn eval_binary(op: Op, lhs: Value, rhs: Value) -> Result<Value> {
    use Value::*;

    let lhs = chase(lhs)?;
    let rhs = chase(rhs)?;

    match (op, &lhs, &rhs) {
        (Op::Add, Str(a), Str(b)) => {
            let mut bytes = a.bytes.clone();
            bytes.extend_from_slice(&b.bytes);
            return Ok(Str(VmString { bytes, max_len: None }));
        }
        (Op::Add, Str(a), Char(c)) => {
            let mut bytes = a.bytes.clone();
            bytes.push(*c);
            return Ok(Str(VmString { bytes, max_len: None }));
        }
        (Op::Add, Char(c), Str(b)) => {
            let mut bytes = vec![*c];
            bytes.extend_from_slice(&b.bytes);
            return Ok(Str(VmString { bytes, max_len: None }));
        }
        (Op::Add, Char(a), Char(b)) => {
            return Ok(Str(VmString {
                bytes: vec![*a, *b],
                max_len: None,
            }));
        }
        (Op::Add | Op::Subtract, Enum(e), Int(n)) => {
            let delta = if op == Op::Add { n.value } else { -n.value };
            let ordinal = e
                .ordinal
                .checked_add(delta)
                .ok_or(ErrorKind::IntegerOverflow { op: op_name(op) })?;
            if !e.in_range(ordinal) {
                return Err(Error::new(ErrorKind::OrdinalOutOfRange {
                    ordinal,
                    type_name: e.type_name.to_string(),
                }));
            }
            let mut result = e.clone();
            result.ordinal = ordinal;
            return Ok(Enum(result));
        }
        (Op::Add, Int(n), Enum(e)) => {
            let ordinal = e
                .ordinal
                .checked_add(n.value)
                .ok_or(ErrorKind::IntegerOverflow { op: "+" })?;
            if !e.in_range(ordinal) {
                return Err(Error::new(ErrorKind::OrdinalOutOfRange {
                    ordinal,
                    type_name: e.type_name.to_string(),
                }));
            }
            let mut result = e.clone();
            result.ordinal = ordinal;
            return Ok(Enum(result));
        }
        (Op::Add, Set(a), Set(b)) => return Ok(Set(a.union(b))),
        (Op::Subtract, Set(a), Set(b)) => return Ok(Set(a.difference(b))),
        (Op::Multiply, Set(a), Set(b)) => return Ok(Set(a.intersection(b))),
        (Op::And, Bool(a), Bool(b)) => return Ok(Bool(*a && *b)),
        (Op::Or, Bool(a), Bool(b)) => return Ok(Bool(*a || *b)),
        (Op::Xor, Bool(a), Bool(b)) => return Ok(Bool(*a != *b)),
        _ => {}
    }

    match (&lhs, &rhs) {
        (Int(a), Int(b)) if op != Op::Divide => int_binary(op, *a, *b),
        (Int(_) | Real(_), Int(_) | Real(_)) => real_binary(op, &lhs, &rhs),
        _ => Err(Error::new(ErrorKind::InvalidBinaryOp {
            op: op_name(op),
            lhs: lhs.type_as_string(),
            rhs: rhs.type_as_string(),
        })),
    }
}

fn int_binary(op: Op, a: IntValue, b: IntValue) -> Result<Value> {
    let width = a.width.wider(b.width);
    let (x, y) = (a.value, b.value);
    let result = match op {
        Op::Add => x.checked_add(y),
        Op::Subtract => x.checked_sub(y),
        Op::Multiply => x.checked_mul(y),
        Op::IntDiv => {
            if y == 0 {
                return Err(Error::new(ErrorKind::DivisionByZero));
            }
            x.checked_div(y)
        }
        Op::Mod => {
            if y == 0 {
                return Err(Error::new(ErrorKind::DivisionByZero));
            }
            x.checked_rem(y)
        }
        Op::And => Some(x & y),
        Op::Or => Some(x | y),
        Op::Xor => Some(x ^ y),
        Op::Shl => Some(if (0..64).contains(&y) { x << y } else { 0 }),
        Op::Shr => Some(if (0..64).contains(&y) { x >> y } else { 0 }),
        _ => None,
    };
    let result = result.ok_or(ErrorKind::IntegerOverflow { op: op_name(op) })?;
    Ok(Value::Int(IntValue::with_width(width, result)))
}

fn real_binary(op: Op, lhs: &Value, rhs: &Value) -> Result<Value> {
    let invalid = || {
        Error::new(ErrorKind::InvalidBinaryOp {
            op: op_name(op),
            lhs: lhs.type_as_string(),
            rhs: rhs.type_as_string(),
        })
    };
    let as_real = |value: &Value| match value {
        Value::Int(int) => Ok(int.value as f64),
        Value::Real(real) => Ok(real.value),
        _ => Err(invalid()),
    };
    // An int operand promotes to the real operand's declared width
    let width = match (lhs, rhs) {
        (Value::Real(a), Value::Real(b)) => a.width.wider(b.width),
        (Value::Real(a), _) => a.width,
        (_, Value::Real(b)) => b.width,
        _ => RealWidth::Double,
    };
    let x = as_real(lhs)?;
    let y = as_real(rhs)?;
    let result = match op {
        Op::Add => x + y,
        Op::Subtract => x - y,
        Op::Multiply => x * y,
        Op::Divide => {
            if y == 0.0 {
                return Err(Error::new(ErrorKind::DivisionByZero));
            }
            x / y
        }
        _ => return Err(invalid()),
    };
    Ok(Value::Real(RealValue { width, value: result }))
}

// Comparison rules: numerics compare across int/real, chars compare with
// single-character strings and integer ordinals for equality only, enums
// order only within the same declared type, and everything else supports
// equality at most.
fn eval_compare(op: Op, lhs: &Value, rhs: &Value) -> Result<bool> {
    use std::cmp::Ordering;
    use Value::*;

    // Pointers compare by identity against pointers and nil, and are chased
    // otherwise so the comparison acts on the pointee
    let (lhs, rhs) = match (lhs, rhs) {
        (Pointer(_), Pointer(_) | Nil) | (Nil, Pointer(_)) => (lhs.clone(), rhs.clone()),
        _ => (chase(lhs.clone())?, chase(rhs.clone())?),
    };

    let invalid = || {
        Error::new(ErrorKind::InvalidBinaryOp {
            op: op_name(op),
            lhs: lhs.type_as_string(),
            rhs: rhs.type_as_string(),
        })
    };
    let from_ordering = |ordering: Ordering| match op {
        Op::Equal => ordering == Ordering::Equal,
        Op::NotEqual => ordering != Ordering::Equal,
        Op::Greater => ordering == Ordering::Greater,
        Op::GreaterEqual => ordering != Ordering::Less,
        Op::Less => ordering == Ordering::Less,
        Op::LessEqual => ordering != Ordering::Greater,
        _ => false,
    };
    let equality_only = |equal: bool| match op {
        Op::Equal => Ok(equal),
        Op::NotEqual => Ok(!equal),
        _ => Err(invalid()),
    };

    match (&lhs, &rhs) {
        (Int(a), Int(b)) => Ok(from_ordering(a.value.cmp(&b.value))),
        (Real(a), Real(b)) => a
            .value
            .partial_cmp(&b.value)
            .map(from_ordering)
            .ok_or_else(|| invalid()),
        (Int(a), Real(b)) => (a.value as f64)
            .partial_cmp(&b.value)
            .map(from_ordering)
            .ok_or_else(|| invalid()),
        (Real(a), Int(b)) => a
            .value
            .partial_cmp(&(b.value as f64))
            .map(from_ordering)
            .ok_or_else(|| invalid()),
        (Char(a), Char(b)) => Ok(from_ordering(a.cmp(b))),
        (Str(a), Str(b)) => Ok(from_ordering(a.bytes.cmp(&b.bytes))),
        (Char(a), Str(b)) if b.len() == 1 => equality_only(*a == b.bytes[0]),
        (Str(a), Char(b)) if a.len() == 1 => equality_only(a.bytes[0] == *b),
        (Char(a), Int(b)) => equality_only(*a as i64 == b.value),
        (Int(a), Char(b)) => equality_only(a.value == *b as i64),
        (Bool(a), Bool(b)) => Ok(from_ordering(a.cmp(b))),
        (Enum(a), Enum(b)) => {
            if a.type_name == b.type_name {
                Ok(from_ordering(a.ordinal.cmp(&b.ordinal)))
            } else {
                // Values of different enum types are never equal
                equality_only(false)
            }
        }
        (Set(a), Set(b)) => match op {
            Op::Equal => Ok(a == b),
            Op::NotEqual => Ok(a != b),
            Op::LessEqual => Ok(a.is_subset(b)),
            Op::GreaterEqual => Ok(b.is_subset(a)),
            _ => Err(invalid()),
        },
        (Pointer(a), Pointer(b)) => equality_only(a == b),
        (Nil, Pointer(p)) | (Pointer(p), Nil) => {
            equality_only(matches!(p, crate::Pointer::Nil))
        }
        (Nil, Nil) => equality_only(true),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promotion_to_real() {
        let result = eval_binary(Op::Add, Value::int(1), Value::real(2.0)).unwrap();
        assert_eq!(result, Value::real(3.0));
        let result = eval_binary(Op::Divide, Value::int(5), Value::int(2)).unwrap();
        assert_eq!(result, Value::real(2.5));
        let result = eval_binary(Op::IntDiv, Value::int(5), Value::int(2)).unwrap();
        assert_eq!(result, Value::int(2));
    }

    #[test]
    fn division_by_zero_is_an_error() {
        for op in [Op::Divide, Op::IntDiv, Op::Mod] {
            let error = eval_binary(op, Value::int(1), Value::int(0)).unwrap_err();
            assert!(matches!(error.kind, ErrorKind::DivisionByZero));
        }
    }

    #[test]
    fn integer_overflow_is_an_error() {
        let error = eval_binary(Op::Add, Value::int(i64::MAX), Value::int(1)).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::IntegerOverflow { .. }));
    }

    #[test]
    fn concatenation() {
        let result = eval_binary(Op::Add, Value::string("ab"), Value::Char(b'c')).unwrap();
        assert_eq!(result, Value::string("abc"));
        let result = eval_binary(Op::Add, Value::Char(b'a'), Value::Char(b'b')).unwrap();
        assert_eq!(result, Value::string("ab"));
    }

    #[test]
    fn mixed_type_comparison_is_an_error() {
        let error = eval_compare(Op::Less, &Value::string("a"), &Value::int(1)).unwrap_err();
        assert!(matches!(error.kind, ErrorKind::InvalidBinaryOp { .. }));
    }

    #[test]
    fn char_and_string_compare_for_equality_only() {
        assert!(eval_compare(Op::Equal, &Value::Char(b'x'), &Value::string("x")).unwrap());
        assert!(eval_compare(Op::Less, &Value::Char(b'x'), &Value::string("x")).is_err());
    }

    #[test]
    fn comparison_chases_pointer_operands() {
        let cell = value_cell(Value::int(3));
        let pointer = Value::Pointer(Pointer::Cell(Address::whole(cell)));
        assert!(eval_compare(Op::Less, &pointer, &Value::int(4)).unwrap());
        assert!(eval_compare(Op::Equal, &Value::int(3), &pointer).unwrap());
        // Nil checks stay on the pointer itself
        assert!(!eval_compare(Op::Equal, &pointer, &Value::Nil).unwrap());
    }

    #[test]
    fn real_arithmetic_keeps_the_wider_declared_width() {
        let single = |value| {
            Value::Real(RealValue {
                width: RealWidth::Single,
                value,
            })
        };
        let Value::Real(real) = eval_binary(Op::Add, single(1.5), single(2.0)).unwrap() else {
            panic!("expected a real result");
        };
        assert_eq!(real.width, RealWidth::Single);
        let Value::Real(real) = eval_binary(Op::Multiply, single(1.5), Value::real(2.0)).unwrap()
        else {
            panic!("expected a real result");
        };
        assert_eq!(real.width, RealWidth::Double);
        let Value::Real(real) = eval_binary(Op::Divide, Value::int(3), single(2.0)).unwrap() else {
            panic!("expected a real result");
        };
        assert_eq!(real.width, RealWidth::Single);
    }
}
