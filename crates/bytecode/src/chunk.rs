use std::{fmt, sync::Arc};

/// The chunk format version produced by the current toolchain
///
/// The VM refuses to install a chunk with a different version.
pub const BYTECODE_VERSION: u32 = 3;

/// An entry in a chunk's constant pool
#[derive(Clone, Debug)]
pub enum Constant {
    /// A signed 64-bit integer
    Int(i64),
    /// A 64-bit float
    Real(f64),
    /// An interned string
    Str(Arc<str>),
    /// A single byte character
    Char(u8),
    /// A boolean
    Bool(bool),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        use Constant::*;
        match (self, other) {
            (Int(a), Int(b)) => a == b,
            // Bitwise comparison so that pool deduplication is well defined for NaN
            (Real(a), Real(b)) => a.to_bits() == b.to_bits(),
            (Str(a), Str(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            _ => false,
        }
    }
}

impl Constant {
    /// Returns the string payload, or None for non-string constants
    pub fn as_str(&self) -> Option<&Arc<str>> {
        match self {
            Constant::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer payload, or None for non-integer constants
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Constant::Int(n) => Some(*n),
            _ => None,
        }
    }
}

/// A compiled chunk of bytecode, along with its constants and line table
///
/// Chunks are immutable once built; the VM and every worker thread execute the
/// same shared chunk. Per-site global resolution state lives in the VM's side
/// cache, never in the chunk itself.
#[derive(Clone, Default, PartialEq)]
pub struct Chunk {
    /// The chunk format version this chunk targets
    pub version: u32,
    /// The bytes representing the chunk's bytecode
    pub bytes: Box<[u8]>,
    /// The constant pool referenced by the chunk's operands
    pub constants: Box<[Constant]>,
    /// The source line for each byte of code, used for error reporting
    pub lines: Box<[u32]>,
}

impl Chunk {
    /// Initializes a chunk
    pub fn new(version: u32, bytes: Vec<u8>, constants: Vec<Constant>, lines: Vec<u32>) -> Self {
        debug_assert_eq!(bytes.len(), lines.len());
        Self {
            version,
            bytes: bytes.into(),
            constants: constants.into(),
            lines: lines.into(),
        }
    }

    /// Returns the constant at the given pool index
    pub fn constant(&self, index: u16) -> Option<&Constant> {
        self.constants.get(index as usize)
    }

    /// Returns the source line for the instruction at the given offset
    pub fn line_for(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }

}

/// The compact form shows the sizes; the alternate form (`{:#?}`) appends a
/// hex dump of the code, 16 bytes per row with the row offset leading.
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "Chunk ({} bytes, {} constants)", self.bytes.len(), self.constants.len())?;
        if f.alternate() {
            for (row, bytes) in self.bytes.chunks(16).enumerate() {
                write!(f, "\n{:04x}:", row * 16)?;
                for byte in bytes {
                    write!(f, " {byte:02x}")?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alternate_debug_includes_a_hex_dump() {
        let bytes: Vec<u8> = (0..20).collect();
        let lines = vec![1; 20];
        let chunk = Chunk::new(BYTECODE_VERSION, bytes, vec![], lines);

        assert_eq!(format!("{chunk:?}"), "Chunk (20 bytes, 0 constants)");
        let dump = format!("{chunk:#?}");
        assert!(dump.contains("\n0000: 00 01 02 03"));
        assert!(dump.contains("\n0010: 10 11 12 13"));
    }
}
