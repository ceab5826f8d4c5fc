//! A collection of useful items to make it easier to work with `vireo_vm`

#[doc(inline)]
pub use crate::{
    Address, AddressSlot, ArrayStorage, ArrayValue, BuiltinRegistry, Closure, ClosureEnv,
    ConstGlobals, Error, ErrorKind, FieldSlot, Global, GlobalTable, HostId, HostTable, IntValue,
    IntWidth, Job, MutexRegistry, Pointer, ProcInfo, ProcTable, Ptr, RealValue, RealWidth,
    RecordValue, Result, SetValue, SharedContext, ThreadRegistry, UpvalueDesc, Value, ValueCell,
    Vm, VmCell, VmSettings, VmString, Vtable, runtime_error, unexpected_type, value_cell,
};
