//! The vireo virtual machine
//!
//! Executes bytecode chunks produced by the external front ends: the value
//! model, the dispatch loop, the call/closure protocol, the addressing
//! subsystem, the worker pool, and the mutex registry.

#![warn(missing_docs)]

mod address;
mod builtins;
mod error;
mod frame;
mod globals;
mod memory;
mod mutexes;
mod proc;
mod threads;
mod value;
mod vm;

pub mod prelude;

pub use crate::{
    address::{Address, AddressSlot, PathSegment, Pointer},
    builtins::{BuiltinFn, BuiltinRegistry, HOST_SLOT_COUNT, HostFn, HostId, HostTable},
    error::{Error, ErrorKind, Result, TraceFrame, unexpected_type},
    frame::Frame,
    globals::{ConstGlobals, Global, GlobalCache, GlobalTable},
    memory::{Borrow, BorrowMut, Ptr, VmCell},
    mutexes::{MAX_MUTEXES, MutexRegistry},
    proc::{ProcInfo, ProcTable, UpvalueDesc, Vtable},
    threads::{Job, ThreadRegistry},
    value::{
        ArrayStorage, ArrayValue, Closure, ClosureEnv, EnumValue, FieldSlot, FileValue,
        InterfaceValue, IntWidth, IntValue, MemStream, RealValue, RealWidth, RecordValue, SetValue,
        Value, ValueCell, VmString, value_cell,
    },
    vm::{SharedContext, Vm, VmSettings},
};
