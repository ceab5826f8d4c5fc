//! The runtime value model
//!
//! Every value computes with 64-bit fields (`i64`/`f64`) while remembering
//! its declared width, so assignments back into narrower storage can be
//! range checked.

use std::fmt;

use smallvec::SmallVec;
use vireo_bytecode::TypeTag;

use crate::{
    Error, ErrorKind, Pointer, ProcInfo, Ptr, Result, Vtable, memory::VmCell, unexpected_type,
};

/// The unit of aliasable storage: globals, locals, closure slots, and heap
/// allocations are all cells so that pointers and captures can share them
pub type ValueCell = Ptr<VmCell<Value>>;

/// Makes a fresh cell holding the given value
pub fn value_cell(value: Value) -> ValueCell {
    Ptr::new(VmCell::from(value))
}

/// The declared width of an integer variable
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum IntWidth {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl IntWidth {
    /// The width declared by a type tag, if the tag is an integer type
    pub fn from_tag(tag: TypeTag) -> Option<Self> {
        use TypeTag::*;
        let width = match tag {
            Int8 => Self::I8,
            Int16 => Self::I16,
            Int32 => Self::I32,
            Int64 => Self::I64,
            UInt8 | Byte => Self::U8,
            UInt16 | Word => Self::U16,
            UInt32 => Self::U32,
            UInt64 => Self::U64,
            _ => return None,
        };
        Some(width)
    }

    /// The width's size in bits
    pub fn bits(self) -> u8 {
        match self {
            Self::I8 | Self::U8 => 8,
            Self::I16 | Self::U16 => 16,
            Self::I32 | Self::U32 => 32,
            Self::I64 | Self::U64 => 64,
        }
    }

    /// True for the signed widths
    pub fn is_signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// The wider of two widths, preferring the signed one on a tie
    pub fn wider(self, other: Self) -> Self {
        use std::cmp::Ordering::*;
        match self.bits().cmp(&other.bits()) {
            Greater => self,
            Less => other,
            Equal => {
                if self.is_signed() {
                    self
                } else {
                    other
                }
            }
        }
    }

    /// True when the computation field is representable at this width
    ///
    /// `U64` values are stored as raw bits in the i64 field, so every bit
    /// pattern is in range.
    pub fn in_range(self, value: i64) -> bool {
        match self {
            Self::I8 => i8::try_from(value).is_ok(),
            Self::I16 => i16::try_from(value).is_ok(),
            Self::I32 => i32::try_from(value).is_ok(),
            Self::I64 => true,
            Self::U8 => u8::try_from(value).is_ok(),
            Self::U16 => u16::try_from(value).is_ok(),
            Self::U32 => u32::try_from(value).is_ok(),
            Self::U64 => true,
        }
    }

    /// Truncates the computation field to this width, wrapping out-of-range
    /// values the way narrow storage would
    pub fn wrap(self, value: i64) -> i64 {
        match self {
            Self::I8 => value as i8 as i64,
            Self::I16 => value as i16 as i64,
            Self::I32 => value as i32 as i64,
            Self::I64 | Self::U64 => value,
            Self::U8 => value as u8 as i64,
            Self::U16 => value as u16 as i64,
            Self::U32 => value as u32 as i64,
        }
    }
}

/// An integer value: a 64-bit computation field plus its declared width
#[derive(Clone, Copy, Debug)]
pub struct IntValue {
    /// The declared width
    pub width: IntWidth,
    /// The computation field; `U64` values are stored as raw bits
    pub value: i64,
}

impl IntValue {
    /// Makes a 64-bit integer value
    pub fn new(value: i64) -> Self {
        Self {
            width: IntWidth::I64,
            value,
        }
    }

    /// Makes an integer value with a declared width
    pub fn with_width(width: IntWidth, value: i64) -> Self {
        Self { width, value }
    }
}

/// The declared width of a real variable
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
pub enum RealWidth {
    Single,
    Double,
    Extended,
}

impl RealWidth {
    /// The width declared by a type tag, if the tag is a real type
    pub fn from_tag(tag: TypeTag) -> Option<Self> {
        match tag {
            TypeTag::Float => Some(Self::Single),
            TypeTag::Double => Some(Self::Double),
            TypeTag::LongDouble => Some(Self::Extended),
            _ => None,
        }
    }

    /// The wider of two widths
    pub fn wider(self, other: Self) -> Self {
        if (other as u8) > (self as u8) {
            other
        } else {
            self
        }
    }
}

/// A real value: a 64-bit computation field plus its declared width
#[derive(Clone, Copy, Debug)]
pub struct RealValue {
    /// The declared width
    pub width: RealWidth,
    /// The computation field
    pub value: f64,
}

impl RealValue {
    /// Makes a double-width real value
    pub fn new(value: f64) -> Self {
        Self {
            width: RealWidth::Double,
            value,
        }
    }
}

/// An owned string buffer, optionally capped by a declared maximum length
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VmString {
    /// The string's bytes
    pub bytes: Vec<u8>,
    /// The declared capacity for fixed-length strings
    pub max_len: Option<usize>,
}

impl VmString {
    /// Makes an unbounded string from a str
    pub fn new(s: &str) -> Self {
        Self {
            bytes: s.as_bytes().to_vec(),
            max_len: None,
        }
    }

    /// Makes an empty fixed-length string
    pub fn fixed(max_len: usize) -> Self {
        Self {
            bytes: Vec::new(),
            max_len: Some(max_len),
        }
    }

    /// The string's length in bytes
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the string is empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Replaces the contents, truncating to the declared capacity
    ///
    /// Returns true when the assignment was truncated.
    pub fn assign(&mut self, bytes: &[u8]) -> bool {
        let truncated = matches!(self.max_len, Some(max) if bytes.len() > max);
        self.bytes.clear();
        match self.max_len {
            Some(max) => self.bytes.extend_from_slice(&bytes[..bytes.len().min(max)]),
            None => self.bytes.extend_from_slice(bytes),
        }
        truncated
    }

    /// Sets the length, truncating or space-padding as needed
    ///
    /// The new length is capped by the declared capacity for fixed strings.
    pub fn set_len(&mut self, new_len: usize) {
        let new_len = match self.max_len {
            Some(max) => new_len.min(max),
            None => new_len,
        };
        self.bytes.resize(new_len, b' ');
    }
}

impl fmt::Display for VmString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.bytes))
    }
}

/// A value of a declared enumeration type
#[derive(Clone, Debug)]
pub struct EnumValue {
    /// The lowered name of the enumeration type
    pub type_name: Ptr<str>,
    /// The member's ordinal
    pub ordinal: i64,
    /// The number of members, when the declaration is known
    pub member_count: Option<u32>,
}

impl EnumValue {
    /// True when an ordinal lies inside the declared member range
    pub fn in_range(&self, ordinal: i64) -> bool {
        match self.member_count {
            Some(count) => (0..count as i64).contains(&ordinal),
            None => true,
        }
    }
}

/// A set of ordinals, kept sorted and deduplicated
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SetValue {
    ordinals: Vec<i64>,
}

impl SetValue {
    /// Makes a set from arbitrary ordinals
    pub fn from_ordinals(mut ordinals: Vec<i64>) -> Self {
        ordinals.sort_unstable();
        ordinals.dedup();
        Self { ordinals }
    }

    /// The set's members in ascending order
    pub fn ordinals(&self) -> &[i64] {
        &self.ordinals
    }

    /// True when the ordinal is a member
    pub fn contains(&self, ordinal: i64) -> bool {
        self.ordinals.binary_search(&ordinal).is_ok()
    }

    /// The union of two sets
    pub fn union(&self, other: &Self) -> Self {
        let mut result = self.ordinals.clone();
        result.extend_from_slice(&other.ordinals);
        Self::from_ordinals(result)
    }

    /// The intersection of two sets
    pub fn intersection(&self, other: &Self) -> Self {
        let ordinals = self
            .ordinals
            .iter()
            .copied()
            .filter(|o| other.contains(*o))
            .collect();
        Self { ordinals }
    }

    /// The members of self that aren't members of other
    pub fn difference(&self, other: &Self) -> Self {
        let ordinals = self
            .ordinals
            .iter()
            .copied()
            .filter(|o| !other.contains(*o))
            .collect();
        Self { ordinals }
    }

    /// True when every member of self is a member of other
    pub fn is_subset(&self, other: &Self) -> bool {
        self.ordinals.iter().all(|o| other.contains(*o))
    }
}

/// Backing storage for an array
#[derive(Clone, Debug, PartialEq)]
pub enum ArrayStorage {
    /// One value per element
    Values(Vec<Value>),
    /// Packed byte storage for byte-element arrays
    Packed(Vec<u8>),
}

/// An N-dimensional array with declared per-dimension bounds
///
/// Elements are stored row-major; byte-element arrays use packed storage.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayValue {
    /// Inclusive (lower, upper) bounds per dimension
    pub bounds: SmallVec<[(i64, i64); 2]>,
    /// The declared element type
    pub elem: TypeTag,
    /// The element storage
    pub storage: ArrayStorage,
}

impl ArrayValue {
    /// Makes an array with default-initialized elements
    pub fn new(bounds: SmallVec<[(i64, i64); 2]>, elem: TypeTag) -> Self {
        let len: usize = bounds
            .iter()
            .map(|(lo, hi)| (hi - lo + 1).max(0) as usize)
            .product();
        let storage = match elem {
            TypeTag::Byte | TypeTag::UInt8 => ArrayStorage::Packed(vec![0; len]),
            _ => ArrayStorage::Values(vec![Value::default_for_type(elem); len]),
        };
        Self {
            bounds,
            elem,
            storage,
        }
    }

    /// The total number of elements
    pub fn len(&self) -> usize {
        match &self.storage {
            ArrayStorage::Values(values) => values.len(),
            ArrayStorage::Packed(bytes) => bytes.len(),
        }
    }

    /// True when the array has no elements
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Converts per-dimension indices to a row-major flat offset
    ///
    /// Each index is validated against its declared bounds.
    pub fn flatten(&self, indices: &[i64]) -> Result<usize> {
        if indices.len() != self.bounds.len() {
            return crate::runtime_error!(
                "Expected {} array indices, found {}",
                self.bounds.len(),
                indices.len()
            );
        }
        let mut flat = 0usize;
        for (&index, &(lo, hi)) in indices.iter().zip(self.bounds.iter()) {
            if index < lo || index > hi {
                return Err(Error::new(ErrorKind::IndexOutOfRange {
                    index,
                    min: lo,
                    max: hi,
                }));
            }
            let extent = (hi - lo + 1) as usize;
            flat = flat * extent + (index - lo) as usize;
        }
        Ok(flat)
    }

    /// Reads the element at a flat offset
    pub fn get(&self, flat: usize) -> Result<Value> {
        match &self.storage {
            ArrayStorage::Values(values) => values
                .get(flat)
                .cloned()
                .ok_or_else(|| array_offset_error(flat, self.len())),
            ArrayStorage::Packed(bytes) => bytes
                .get(flat)
                .map(|b| Value::Int(IntValue::with_width(IntWidth::U8, *b as i64)))
                .ok_or_else(|| array_offset_error(flat, self.len())),
        }
    }

    /// Writes the element at a flat offset
    ///
    /// Writes into packed storage truncate to a byte; out-of-range values
    /// are reported by the caller's range check before truncation.
    pub fn set(&mut self, flat: usize, value: Value) -> Result<()> {
        let len = self.len();
        match &mut self.storage {
            ArrayStorage::Values(values) => match values.get_mut(flat) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(array_offset_error(flat, len)),
            },
            ArrayStorage::Packed(bytes) => match bytes.get_mut(flat) {
                Some(slot) => {
                    let Value::Int(int) = value else {
                        return Err(unexpected_type("an integer", &value));
                    };
                    *slot = int.value as u8;
                    Ok(())
                }
                None => Err(array_offset_error(flat, len)),
            },
        }
    }
}

fn array_offset_error(flat: usize, len: usize) -> Error {
    Error::new(ErrorKind::IndexOutOfRange {
        index: flat as i64,
        min: 0,
        max: len as i64 - 1,
    })
}

/// One named field in a record
#[derive(Clone, Debug)]
pub struct FieldSlot {
    /// The field's lowered name
    pub name: Ptr<str>,
    /// The field's value
    pub value: Value,
}

/// A record: ordered named fields, optionally tagged with a class identity
///
/// Objects allocated for method dispatch reserve field slot 0 for the hidden
/// method-table reference.
#[derive(Clone, Debug, Default)]
pub struct RecordValue {
    /// The lowered class name, for object instances
    pub class: Option<Ptr<str>>,
    /// The fields, in declaration order
    pub fields: Vec<FieldSlot>,
}

impl RecordValue {
    /// Finds a field's index by name, case-insensitively
    pub fn field_index(&self, name: &str) -> Result<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::new(ErrorKind::UnknownField(name.into())))
    }
}

/// A file variable
///
/// The VM tracks the binding and element type; the I/O builtins that
/// actually open and transfer data are registered by the embedder.
#[derive(Clone, Debug, Default)]
pub struct FileValue {
    /// The bound external path, once assigned
    pub path: Option<String>,
    /// The declared element type
    pub elem: TypeTag,
    /// True between open and close
    pub open: bool,
}

/// An in-memory byte stream with a read/write position
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MemStream {
    /// The stream's contents
    pub bytes: Vec<u8>,
    /// The current read/write position
    pub position: usize,
}

impl MemStream {
    /// Writes bytes at the current position, growing the buffer as needed
    pub fn write(&mut self, bytes: &[u8]) {
        let end = self.position + bytes.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[self.position..end].copy_from_slice(bytes);
        self.position = end;
    }

    /// Reads up to `buffer.len()` bytes from the current position
    pub fn read(&mut self, buffer: &mut [u8]) -> usize {
        let available = self.bytes.len().saturating_sub(self.position);
        let count = available.min(buffer.len());
        buffer[..count].copy_from_slice(&self.bytes[self.position..self.position + count]);
        self.position += count;
        count
    }
}

/// A callable value: a routine plus its captured environment
#[derive(Clone, Debug)]
pub struct Closure {
    /// The compiled routine
    pub proc: Ptr<ProcInfo>,
    /// The shared capture environment, absent for plain routine references
    pub env: Option<Ptr<ClosureEnv>>,
}

/// The refcounted capture environment shared by a closure's instances
#[derive(Debug)]
pub struct ClosureEnv {
    /// The routine the environment was built for
    pub proc: Ptr<ProcInfo>,
    /// One cell per captured variable, in descriptor order
    pub slots: Vec<ValueCell>,
}

/// An interface-boxed receiver paired with its class's method table
#[derive(Clone, Debug)]
pub struct InterfaceValue {
    /// The boxed receiver
    pub receiver: ValueCell,
    /// The receiver class's method table
    pub vtable: Ptr<Vtable>,
    /// The receiver's lowered class identity
    pub class_name: Ptr<str>,
}

/// A runtime value
///
/// Stack pushes clone; owned payloads copy while refcounted payloads
/// (streams, closures, pointers, boxed receivers) are retained.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// The uninitialized / absent value
    #[default]
    Nil,
    /// An integer
    Int(IntValue),
    /// A real
    Real(RealValue),
    /// A boolean
    Bool(bool),
    /// A single byte character
    Char(u8),
    /// A string
    Str(VmString),
    /// An enumeration member
    Enum(EnumValue),
    /// A set of ordinals
    Set(SetValue),
    /// An array
    Array(ArrayValue),
    /// A record or object instance
    Record(RecordValue),
    /// A pointer
    Pointer(Pointer),
    /// A file variable
    File(FileValue),
    /// A shared in-memory stream
    Stream(Ptr<VmCell<MemStream>>),
    /// A callable routine with captures
    Closure(Closure),
    /// An interface-boxed receiver
    Interface(InterfaceValue),
    /// A worker thread handle
    Thread(usize),
}

impl Value {
    /// Makes a 64-bit integer value
    pub fn int(value: i64) -> Self {
        Self::Int(IntValue::new(value))
    }

    /// Makes a double-width real value
    pub fn real(value: f64) -> Self {
        Self::Real(RealValue::new(value))
    }

    /// Makes an unbounded string value
    pub fn string(s: &str) -> Self {
        Self::Str(VmString::new(s))
    }

    /// The default value for a declared type
    pub fn default_for_type(tag: TypeTag) -> Self {
        use TypeTag::*;
        if let Some(width) = IntWidth::from_tag(tag) {
            return Self::Int(IntValue::with_width(width, 0));
        }
        if let Some(width) = RealWidth::from_tag(tag) {
            return Self::Real(RealValue { width, value: 0.0 });
        }
        match tag {
            Boolean => Self::Bool(false),
            Char => Self::Char(0),
            String => Self::Str(VmString::default()),
            Enum => Self::Enum(EnumValue {
                type_name: "".into(),
                ordinal: 0,
                member_count: None,
            }),
            Set => Self::Set(SetValue::default()),
            Record | Interface => Self::Record(RecordValue::default()),
            Pointer => Self::Pointer(crate::Pointer::Nil),
            File => Self::File(FileValue::default()),
            MemoryStream => Self::Stream(Ptr::new(VmCell::from(MemStream::default()))),
            Thread => Self::Thread(0),
            _ => Self::Nil,
        }
    }

    /// The name of the value's type, for error messages
    pub fn type_as_string(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Int(_) => "integer",
            Self::Real(_) => "real",
            Self::Bool(_) => "boolean",
            Self::Char(_) => "char",
            Self::Str(_) => "string",
            Self::Enum(_) => "enum",
            Self::Set(_) => "set",
            Self::Array(_) => "array",
            Self::Record(_) => "record",
            Self::Pointer(_) => "pointer",
            Self::File(_) => "file",
            Self::Stream(_) => "memory stream",
            Self::Closure(_) => "closure",
            Self::Interface(_) => "interface",
            Self::Thread(_) => "thread",
        }
    }

    /// A copy that duplicates even refcounted payloads
    ///
    /// Used for thread argument transfer, where aliasing with the spawning
    /// thread's stack would race. Closures keep their shared environment so
    /// by-reference captures still alias intentionally.
    pub fn deep_copy(&self) -> Self {
        match self {
            Self::Stream(stream) => {
                Self::Stream(Ptr::new(VmCell::from(stream.borrow().clone())))
            }
            Self::Array(array) => {
                let storage = match &array.storage {
                    ArrayStorage::Values(values) => {
                        ArrayStorage::Values(values.iter().map(Value::deep_copy).collect())
                    }
                    packed => packed.clone(),
                };
                Self::Array(ArrayValue {
                    bounds: array.bounds.clone(),
                    elem: array.elem,
                    storage,
                })
            }
            Self::Record(record) => Self::Record(RecordValue {
                class: record.class.clone(),
                fields: record
                    .fields
                    .iter()
                    .map(|f| FieldSlot {
                        name: f.name.clone(),
                        value: f.value.deep_copy(),
                    })
                    .collect(),
            }),
            other => other.clone(),
        }
    }

    /// The value's truthiness, used by the conditional jumps
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Nil => false,
            Self::Bool(b) => *b,
            Self::Int(int) => int.value != 0,
            Self::Real(real) => real.value != 0.0,
            Self::Char(c) => *c != 0,
            Self::Str(s) => !s.is_empty(),
            Self::Pointer(p) => !matches!(p, Pointer::Nil),
            _ => true,
        }
    }

    /// The value's ordinal, for set membership and enum arithmetic
    pub fn ordinal(&self) -> Result<i64> {
        match self {
            Self::Int(int) => Ok(int.value),
            Self::Char(c) => Ok(*c as i64),
            Self::Bool(b) => Ok(*b as i64),
            Self::Enum(e) => Ok(e.ordinal),
            other => Err(unexpected_type("an ordinal value", other)),
        }
    }

    /// The value as an i64, for indices and handles
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Self::Int(int) => Ok(int.value),
            Self::Char(c) => Ok(*c as i64),
            Self::Bool(b) => Ok(*b as i64),
            other => Err(unexpected_type("an integer", other)),
        }
    }

    /// Renders the value with optional field width and precision
    ///
    /// Reals honour the precision; everything else is displayed then padded
    /// on the left to the field width.
    pub fn format(&self, width: Option<usize>, precision: Option<usize>) -> String {
        let rendered = match (self, precision) {
            (Self::Real(real), Some(precision)) => format!("{:.precision$}", real.value),
            _ => self.to_string(),
        };
        match width {
            Some(width) => format!("{rendered:>width$}"),
            None => rendered,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::real(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::string(value)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Nil, Nil) => true,
            (Int(a), Int(b)) => a.value == b.value,
            (Real(a), Real(b)) => a.value == b.value,
            (Int(a), Real(b)) | (Real(b), Int(a)) => a.value as f64 == b.value,
            (Bool(a), Bool(b)) => a == b,
            (Char(a), Char(b)) => a == b,
            (Str(a), Str(b)) => a.bytes == b.bytes,
            (Enum(a), Enum(b)) => a.type_name == b.type_name && a.ordinal == b.ordinal,
            (Set(a), Set(b)) => a == b,
            (Array(a), Array(b)) => a == b,
            (Record(a), Record(b)) => {
                a.class == b.class
                    && a.fields.len() == b.fields.len()
                    && a.fields
                        .iter()
                        .zip(b.fields.iter())
                        .all(|(x, y)| x.name == y.name && x.value == y.value)
            }
            (Pointer(a), Pointer(b)) => a == b,
            (Stream(a), Stream(b)) => Ptr::ptr_eq(a, b),
            (Thread(a), Thread(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nil => write!(f, "nil"),
            Self::Int(int) => match int.width {
                IntWidth::U64 => write!(f, "{}", int.value as u64),
                _ => write!(f, "{}", int.value),
            },
            Self::Real(real) => {
                if real.value.fract() == 0.0 && real.value.abs() < 1e15 {
                    write!(f, "{:.1}", real.value)
                } else {
                    write!(f, "{}", real.value)
                }
            }
            Self::Bool(b) => write!(f, "{b}"),
            Self::Char(c) => write!(f, "{}", *c as char),
            Self::Str(s) => write!(f, "{s}"),
            Self::Enum(e) => write!(f, "{}({})", e.type_name, e.ordinal),
            Self::Set(s) => {
                write!(f, "[")?;
                for (i, ordinal) in s.ordinals().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{ordinal}")?;
                }
                write!(f, "]")
            }
            Self::Array(a) => write!(f, "array({} elements)", a.len()),
            Self::Record(r) => match &r.class {
                Some(class) => write!(f, "object({class})"),
                None => write!(f, "record({} fields)", r.fields.len()),
            },
            Self::Pointer(Pointer::Nil) => write!(f, "nil"),
            Self::Pointer(_) => write!(f, "pointer"),
            Self::File(_) => write!(f, "file"),
            Self::Stream(_) => write!(f, "memory stream"),
            Self::Closure(c) => write!(f, "closure({})", c.proc.name),
            Self::Interface(i) => write!(f, "interface({})", i.class_name),
            Self::Thread(id) => write!(f, "thread({id})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn int_widths_wrap_and_range_check() {
        assert!(IntWidth::U8.in_range(255));
        assert!(!IntWidth::U8.in_range(256));
        assert_eq!(IntWidth::U8.wrap(256), 0);
        assert_eq!(IntWidth::I8.wrap(130), -126);
        assert_eq!(IntWidth::I16.wider(IntWidth::U16), IntWidth::I16);
        assert_eq!(IntWidth::I8.wider(IntWidth::U32), IntWidth::U32);
    }

    #[test]
    fn fixed_strings_truncate_on_assign() {
        let mut s = VmString::fixed(3);
        assert!(s.assign(b"hello"));
        assert_eq!(s.bytes, b"hel");
        assert!(!s.assign(b"ok"));
        s.set_len(3);
        assert_eq!(s.bytes, b"ok ");
    }

    #[test]
    fn set_operations() {
        let a = SetValue::from_ordinals(vec![3, 1, 2, 2]);
        let b = SetValue::from_ordinals(vec![2, 3, 4]);
        assert_eq!(a.union(&b).ordinals(), &[1, 2, 3, 4]);
        assert_eq!(a.intersection(&b).ordinals(), &[2, 3]);
        assert_eq!(a.difference(&b).ordinals(), &[1]);
        assert!(SetValue::from_ordinals(vec![2]).is_subset(&b));
        assert!(!a.is_subset(&b));
    }

    #[test]
    fn array_flattening_is_row_major() {
        let array = ArrayValue::new(smallvec![(1, 2), (1, 3)], TypeTag::Int32);
        assert_eq!(array.len(), 6);
        assert_eq!(array.flatten(&[1, 1]).unwrap(), 0);
        assert_eq!(array.flatten(&[1, 3]).unwrap(), 2);
        assert_eq!(array.flatten(&[2, 1]).unwrap(), 3);
        assert!(array.flatten(&[0, 1]).is_err());
        assert!(array.flatten(&[2, 4]).is_err());
    }

    #[test]
    fn packed_arrays_store_bytes() {
        let mut array = ArrayValue::new(smallvec![(0, 3)], TypeTag::Byte);
        assert!(matches!(array.storage, ArrayStorage::Packed(_)));
        array.set(2, Value::int(300)).unwrap();
        assert_eq!(array.get(2).unwrap(), Value::int(44));
    }

    #[test]
    fn deep_copy_duplicates_streams() {
        let stream = Ptr::new(VmCell::from(MemStream::default()));
        let value = Value::Stream(stream.clone());
        let copy = value.deep_copy();
        stream.borrow_mut().write(b"abc");
        let Value::Stream(copied) = copy else {
            unreachable!()
        };
        assert!(copied.borrow().bytes.is_empty());
    }
}
