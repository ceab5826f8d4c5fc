/// Declared-type byte codes shared between the front-end compilers and the VM
///
/// These appear in `DefineGlobal` payloads and the `InitLocal*` operations,
/// and describe a variable's declared type independently of the 64-bit
/// fields the VM computes with.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum TypeTag {
    #[default]
    Unknown = 0,
    Void,
    Int32,
    Double,
    String,
    Char,
    Record,
    File,
    Byte,
    Word,
    Enum,
    Array,
    Boolean,
    MemoryStream,
    Set,
    Pointer,
    Interface,
    Closure,
    Int8,
    UInt8,
    Int16,
    UInt16,
    UInt32,
    Int64,
    UInt64,
    Float,
    LongDouble,
    Nil,
    Thread,
}

impl TypeTag {
    /// The number of defined type tags
    pub const COUNT: u8 = TypeTag::Thread as u8 + 1;

    /// Converts a payload byte into a tag, defaulting to `Unknown` for undefined bytes
    pub fn from_byte(byte: u8) -> Self {
        if byte < Self::COUNT {
            // Safety: repr(u8), contiguous from 0, bounds checked above
            unsafe { std::mem::transmute(byte) }
        } else {
            TypeTag::Unknown
        }
    }

    /// Returns true for the signed and unsigned integer tags (including Byte/Word)
    pub fn is_integer(self) -> bool {
        use TypeTag::*;
        matches!(
            self,
            Int32 | Byte | Word | Int8 | UInt8 | Int16 | UInt16 | UInt32 | Int64 | UInt64
        )
    }

    /// Returns true for the floating-point tags
    pub fn is_real(self) -> bool {
        use TypeTag::*;
        matches!(self, Double | Float | LongDouble)
    }
}
