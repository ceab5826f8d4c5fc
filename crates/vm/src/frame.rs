use crate::{ProcInfo, Ptr, ValueCell, Vtable, value::ClosureEnv};

/// A call frame
///
/// Locals are cells so that VAR parameters, captures, and address-of can
/// alias them; they start as Nil and are shaped by the `InitLocal*` ops in
/// the routine's prologue.
#[derive(Debug)]
pub struct Frame {
    /// The instruction offset to return to
    pub return_ip: usize,
    /// The operand-stack height on entry; the stack is truncated back to
    /// this on return
    pub stack_base: usize,
    /// Parameter and local cells
    pub locals: Vec<ValueCell>,
    /// Captured-variable cells, bound at call time
    pub upvalues: Vec<ValueCell>,
    /// The routine being executed, absent for the top-level frame
    pub proc: Option<Ptr<ProcInfo>>,
    /// The environment the frame's closure was called with
    pub env: Option<Ptr<ClosureEnv>>,
    /// The method table for `CallMethod` dispatch inside this frame
    pub vtable: Option<Ptr<Vtable>>,
    /// True for statement-position indirect calls, whose result is dropped
    /// instead of pushed
    pub discard_result: bool,
}

impl Frame {
    /// Makes the top-level frame
    pub fn top_level(stack_base: usize) -> Self {
        Self {
            return_ip: 0,
            stack_base,
            locals: Vec::new(),
            upvalues: Vec::new(),
            proc: None,
            env: None,
            vtable: None,
            discard_result: false,
        }
    }

    /// Returns a local's cell
    pub fn local(&self, index: usize) -> Option<&ValueCell> {
        self.locals.get(index)
    }
}
