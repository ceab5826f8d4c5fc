/// The operations used in vireo bytecode
///
/// Each operation is a single byte, followed by N additional bytes that define its
/// behaviour. Operands are read inline by the VM's dispatch loop.
///
/// In the comments for each operation, the additional bytes are specified inside
/// square brackets. Byte suffixes:
///     [2] - a 16-bit big-endian unsigned integer
///     (i8)/(i16) - signed, two's complement
/// `const` operands are indices into the chunk's constant pool, `type` operands
/// are [TypeTag](crate::TypeTag) bytes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)] // Allowed for the UnusedX ops
pub enum Op {
    /// Returns from the current frame, or ends the run when in the outermost frame
    ///
    /// `[]`
    Return,

    /// Pushes a constant onto the stack
    ///
    /// `[const]`
    Constant,

    /// Pushes a constant with a 16-bit pool index
    ///
    /// `[const[2]]`
    Constant16,

    /// Pushes integer 0
    ///
    /// `[]`
    Const0,

    /// Pushes integer 1
    ///
    /// `[]`
    Const1,

    /// Pushes boolean true
    ///
    /// `[]`
    ConstTrue,

    /// Pushes boolean false
    ///
    /// `[]`
    ConstFalse,

    /// Pushes an inline signed 8-bit integer
    ///
    /// `[n(i8)]`
    PushInt8,

    /// Pops two values, pushes their sum
    ///
    /// Also concatenates strings/chars, offsets enums by integers,
    /// and takes the union of two sets.
    ///
    /// `[]`
    Add,

    /// Pops two values, pushes lhs - rhs (set difference for sets)
    ///
    /// `[]`
    Subtract,

    /// Pops two values, pushes their product (set intersection for sets)
    ///
    /// `[]`
    Multiply,

    /// Pops two values, pushes lhs / rhs as a real (source-language `/`)
    ///
    /// `[]`
    Divide,

    /// Negates the value on top of the stack
    ///
    /// `[]`
    Negate,

    /// Inverts the boolean on top of the stack (bitwise NOT for integers)
    ///
    /// `[]`
    Not,

    /// Coerces the top of the stack to a boolean using truthiness rules
    ///
    /// `[]`
    ToBool,

    /// Pops two values, pushes lhs == rhs
    ///
    /// `[]`
    Equal,

    /// Pops two values, pushes lhs != rhs
    ///
    /// `[]`
    NotEqual,

    /// Pops two values, pushes lhs > rhs
    ///
    /// `[]`
    Greater,

    /// Pops two values, pushes lhs >= rhs
    ///
    /// `[]`
    GreaterEqual,

    /// Pops two values, pushes lhs < rhs
    ///
    /// `[]`
    Less,

    /// Pops two values, pushes lhs <= rhs
    ///
    /// `[]`
    LessEqual,

    /// Pops two integers, pushes their integer quotient (source-language `div`)
    ///
    /// `[]`
    IntDiv,

    /// Pops two integers, pushes lhs mod rhs
    ///
    /// `[]`
    Mod,

    /// Logical AND for booleans, bitwise AND for integers
    ///
    /// `[]`
    And,

    /// Logical OR for booleans, bitwise OR for integers
    ///
    /// `[]`
    Or,

    /// Logical XOR for booleans, bitwise XOR for integers
    ///
    /// `[]`
    Xor,

    /// Pops two integers, pushes lhs shifted left by rhs
    ///
    /// `[]`
    Shl,

    /// Pops two integers, pushes lhs shifted right by rhs
    ///
    /// `[]`
    Shr,

    /// Pops a boolean; if false, jumps by a signed 16-bit offset
    ///
    /// `[offset(i16)]`
    JumpIfFalse,

    /// Unconditionally jumps by a signed 16-bit offset
    ///
    /// `[offset(i16)]`
    Jump,

    /// Swaps the top two stack values
    ///
    /// `[]`
    Swap,

    /// Duplicates the top stack value
    ///
    /// `[]`
    Dup,

    /// Defines a global variable with a structured type payload
    ///
    /// The payload depends on the declared type:
    ///   * arrays: `[dim_count] { [lower const[2]] [upper const[2]] }* [elem type] [elem name const[2]]`
    ///   * strings: `[type name const[2]] [len const[2]]` (length constant 0 means dynamic)
    ///   * typed files: `[type name const[2]] [elem type] [elem name const[2]]`
    ///   * everything else: `[type name const[2]]`
    ///
    /// `[name const, type, payload...]`
    DefineGlobal,

    /// 16-bit name index variant of [DefineGlobal](Op::DefineGlobal)
    ///
    /// `[name const[2], type, payload...]`
    DefineGlobal16,

    /// Pushes a copy of a global's value, resolving the name through the inline cache
    ///
    /// `[name const]`
    GetGlobal,

    /// Pops a value into a global, resolving the name through the inline cache
    ///
    /// `[name const]`
    SetGlobal,

    /// Pushes a pointer to a global's storage cell
    ///
    /// `[name const]`
    GetGlobalAddress,

    /// 16-bit name index variant of [GetGlobal](Op::GetGlobal)
    ///
    /// `[name const[2]]`
    GetGlobal16,

    /// 16-bit name index variant of [SetGlobal](Op::SetGlobal)
    ///
    /// `[name const[2]]`
    SetGlobal16,

    /// 16-bit name index variant of [GetGlobalAddress](Op::GetGlobalAddress)
    ///
    /// `[name const[2]]`
    GetGlobalAddress16,

    /// Pushes a copy of a local slot's value
    ///
    /// `[slot]`
    GetLocal,

    /// Pops a value into a local slot
    ///
    /// `[slot]`
    SetLocal,

    /// Increments a local slot by 1 (peephole optimized helper)
    ///
    /// `[slot]`
    IncLocal,

    /// Decrements a local slot by 1 (peephole optimized helper)
    ///
    /// `[slot]`
    DecLocal,

    /// Initializes a local slot with a default-valued array
    ///
    /// `[slot, dim_count, { lower const[2], upper const[2] }*, elem type]`
    InitLocalArray,

    /// Initializes a local slot with a closed file value
    ///
    /// `[slot]`
    InitLocalFile,

    /// Initializes a local slot with a nil pointer
    ///
    /// `[slot]`
    InitLocalPointer,

    /// Initializes a local slot with an empty fixed-length string
    ///
    /// `[slot, len const[2]]`
    InitLocalString,

    /// Initializes an aggregate field with a default-valued array
    ///
    /// Pops the base record (or pointer to one) from the stack.
    ///
    /// `[field[2], dim_count, { lower const[2], upper const[2] }*, elem type]`
    InitFieldArray,

    /// Pushes a pointer to a local slot's storage cell
    ///
    /// `[slot]`
    GetLocalAddress,

    /// Pushes a copy of a captured variable's value
    ///
    /// `[index]`
    GetUpvalue,

    /// Pops a value into a captured variable
    ///
    /// `[index]`
    SetUpvalue,

    /// Pushes a pointer to a captured variable's storage cell
    ///
    /// `[index]`
    GetUpvalueAddress,

    /// Pops a record base (or pointer chain), pushes the address of a named field
    ///
    /// `[name const]`
    GetFieldAddress,

    /// 16-bit name index variant of [GetFieldAddress](Op::GetFieldAddress)
    ///
    /// `[name const[2]]`
    GetFieldAddress16,

    /// Pops a record base, pushes a copy of a named field's value
    ///
    /// `[name const]`
    LoadFieldValueByName,

    /// 16-bit name index variant of [LoadFieldValueByName](Op::LoadFieldValueByName)
    ///
    /// `[name const[2]]`
    LoadFieldValueByName16,

    /// Resolves an N-dimensional element address
    ///
    /// Pops `dim_count` indices (outermost pushed first), then the array base
    /// (an address or pointer), and pushes the element's address. A
    /// single-dimension string base yields a character address, or the
    /// synthetic length slot for index 0 in legacy mode.
    ///
    /// `[dim_count]`
    GetElementAddress,

    /// Pops an array base and pushes an element address using a constant flat offset
    ///
    /// `[offset[2]]`
    GetElementAddressConst,

    /// Like [GetElementAddress](Op::GetElementAddress), but pushes a copy of the element's value
    ///
    /// `[dim_count]`
    LoadElementValue,

    /// Pops an array base and loads the element at a constant flat offset
    ///
    /// `[offset[2]]`
    LoadElementValueConst,

    /// Pops an index and a string address, pushes a character address
    ///
    /// Used for `s[i] := 'X'`.
    ///
    /// `[]`
    GetCharAddress,

    /// Pops a value and a pointer, stores the value through the pointer
    ///
    /// `[]`
    SetIndirect,

    /// Pops a pointer, pushes a copy of the value it addresses
    ///
    /// `[]`
    GetIndirect,

    /// Pops a set and an ordinal, pushes whether the ordinal is a member
    ///
    /// `[]`
    In,

    /// Pops an index and a string value, pushes the character at that index
    ///
    /// `[]`
    GetCharFromString,

    /// Allocates a record with the given field count, pushes a pointer to it
    ///
    /// Slot 0 is reserved for the hidden vtable reference.
    ///
    /// `[field_count]`
    AllocObject,

    /// 16-bit field count variant of [AllocObject](Op::AllocObject)
    ///
    /// `[field_count[2]]`
    AllocObject16,

    /// Pops a record base, pushes the address of the field at a zero-based offset
    ///
    /// `[field]`
    GetFieldOffset,

    /// 16-bit offset variant of [GetFieldOffset](Op::GetFieldOffset)
    ///
    /// `[field[2]]`
    GetFieldOffset16,

    /// Pops a record base, pushes a copy of the field value at a zero-based offset
    ///
    /// `[field]`
    LoadFieldValue,

    /// 16-bit offset variant of [LoadFieldValue](Op::LoadFieldValue)
    ///
    /// `[field[2]]`
    LoadFieldValue16,

    /// Calls a builtin routine by name
    ///
    /// Pops `argc` arguments; the result is pushed only if the builtin is
    /// classified as a function.
    ///
    /// `[name const[2], argc]`
    CallBuiltin,

    /// Calls a builtin procedure by numeric id, with its name for diagnostics
    ///
    /// `[id[2], name const[2], argc]`
    CallBuiltinProc,

    /// Calls a native host callback by slot id
    ///
    /// `[id, argc]`
    CallHost,

    /// Pops and discards the top of the stack
    ///
    /// `[]`
    Pop,

    /// Calls a compiled procedure or function
    ///
    /// `[name const[2], addr[2], argc]`
    Call,

    /// Calls a closure or routine value taken from the stack
    ///
    /// Pops `argc` arguments, then the callee.
    ///
    /// `[argc]`
    CallIndirect,

    /// Virtual method call through the receiver's vtable
    ///
    /// `[method, argc]`
    CallMethod,

    /// Indirect call in statement position; any result is discarded
    ///
    /// `[argc]`
    ProcCallIndirect,

    /// Stops the VM, unwinding all frames
    ///
    /// `[]`
    Halt,

    /// Early return from the current routine without halting the VM
    ///
    /// `[]`
    Exit,

    /// Formats the value on top of the stack into a string
    ///
    /// A width or precision byte of 255 means "unspecified".
    ///
    /// `[width, precision]`
    FormatValue,

    /// Spawns a worker thread running at a bytecode entry offset, pushes its id
    ///
    /// `[entry[2]]`
    ThreadCreate,

    /// Pops a thread id and blocks until that thread finishes
    ///
    /// `[]`
    ThreadJoin,

    /// Creates a mutex and pushes its handle
    ///
    /// `[]`
    MutexCreate,

    /// Creates a recursive mutex and pushes its handle
    ///
    /// `[]`
    RcMutexCreate,

    /// Pops a mutex handle and locks it
    ///
    /// `[]`
    MutexLock,

    /// Pops a mutex handle and unlocks it
    ///
    /// `[]`
    MutexUnlock,

    /// Pops a mutex handle and destroys it
    ///
    /// `[]`
    MutexDestroy,

    // Unused opcodes, allowing for a direct transmutation from a byte to an Op.
    Unused90,
    Unused91,
    Unused92,
    Unused93,
    Unused94,
    Unused95,
    Unused96,
    Unused97,
    Unused98,
    Unused99,
    Unused100,
    Unused101,
    Unused102,
    Unused103,
    Unused104,
    Unused105,
    Unused106,
    Unused107,
    Unused108,
    Unused109,
    Unused110,
    Unused111,
    Unused112,
    Unused113,
    Unused114,
    Unused115,
    Unused116,
    Unused117,
    Unused118,
    Unused119,
    Unused120,
    Unused121,
    Unused122,
    Unused123,
    Unused124,
    Unused125,
    Unused126,
    Unused127,
    Unused128,
    Unused129,
    Unused130,
    Unused131,
    Unused132,
    Unused133,
    Unused134,
    Unused135,
    Unused136,
    Unused137,
    Unused138,
    Unused139,
    Unused140,
    Unused141,
    Unused142,
    Unused143,
    Unused144,
    Unused145,
    Unused146,
    Unused147,
    Unused148,
    Unused149,
    Unused150,
    Unused151,
    Unused152,
    Unused153,
    Unused154,
    Unused155,
    Unused156,
    Unused157,
    Unused158,
    Unused159,
    Unused160,
    Unused161,
    Unused162,
    Unused163,
    Unused164,
    Unused165,
    Unused166,
    Unused167,
    Unused168,
    Unused169,
    Unused170,
    Unused171,
    Unused172,
    Unused173,
    Unused174,
    Unused175,
    Unused176,
    Unused177,
    Unused178,
    Unused179,
    Unused180,
    Unused181,
    Unused182,
    Unused183,
    Unused184,
    Unused185,
    Unused186,
    Unused187,
    Unused188,
    Unused189,
    Unused190,
    Unused191,
    Unused192,
    Unused193,
    Unused194,
    Unused195,
    Unused196,
    Unused197,
    Unused198,
    Unused199,
    Unused200,
    Unused201,
    Unused202,
    Unused203,
    Unused204,
    Unused205,
    Unused206,
    Unused207,
    Unused208,
    Unused209,
    Unused210,
    Unused211,
    Unused212,
    Unused213,
    Unused214,
    Unused215,
    Unused216,
    Unused217,
    Unused218,
    Unused219,
    Unused220,
    Unused221,
    Unused222,
    Unused223,
    Unused224,
    Unused225,
    Unused226,
    Unused227,
    Unused228,
    Unused229,
    Unused230,
    Unused231,
    Unused232,
    Unused233,
    Unused234,
    Unused235,
    Unused236,
    Unused237,
    Unused238,
    Unused239,
    Unused240,
    Unused241,
    Unused242,
    Unused243,
    Unused244,
    Unused245,
    Unused246,
    Unused247,
    Unused248,
    Unused249,
    Unused250,
    Unused251,
    Unused252,
    Unused253,
    Unused254,
    Unused255,
}

impl From<u8> for Op {
    fn from(op: u8) -> Op {
        // Safety:
        //  - Op is repr(u8)
        //  - All 256 possible values are represented in the enum
        unsafe { std::mem::transmute(op) }
    }
}
