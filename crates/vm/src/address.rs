//! The addressing subsystem
//!
//! Address-of operations produce an explicit [Address] describing a storage
//! cell, a path into the aggregate it holds, and an optional sub-value slot
//! (string characters, packed bytes, the synthetic string length). Pointers
//! wrap addresses; raw native pointers from the embedder stay opaque and are
//! never dereferenced for assignment.

use smallvec::SmallVec;

use crate::{
    Error, ErrorKind, Result, Value, ValueCell,
    value::{ArrayStorage, IntValue, IntWidth, VmString},
};

/// One step of a path from a cell into a nested aggregate
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PathSegment {
    /// A row-major flat offset into an array
    Element(usize),
    /// A field index in a record
    Field(usize),
}

/// The addressed slot within the value the path resolves to
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AddressSlot {
    /// The whole value
    Whole,
    /// One character of a string, as a zero-based byte offset
    StringChar(usize),
    /// One byte of a packed array, as a flat offset
    PackedByte(usize),
    /// The synthetic length of a string; writes truncate or space-pad
    StringLength,
}

/// The address of a storage slot
#[derive(Clone, Debug)]
pub struct Address {
    /// The cell the address points into
    pub cell: ValueCell,
    /// The path from the cell's value to the addressed aggregate
    pub path: SmallVec<[PathSegment; 2]>,
    /// The addressed slot within the resolved value
    pub slot: AddressSlot,
}

impl Address {
    /// An address of a whole cell
    pub fn whole(cell: ValueCell) -> Self {
        Self {
            cell,
            path: SmallVec::new(),
            slot: AddressSlot::Whole,
        }
    }

    /// Extends the address with a path segment
    ///
    /// Only whole-value addresses can be extended further.
    pub fn child(mut self, segment: PathSegment) -> Result<Self> {
        if self.slot != AddressSlot::Whole {
            return crate::runtime_error!("Cannot take the address of a sub-value's component");
        }
        self.path.push(segment);
        Ok(self)
    }

    /// Narrows the address to a sub-value slot
    pub fn with_slot(mut self, slot: AddressSlot) -> Self {
        self.slot = slot;
        self
    }

    /// Reads the value at the address
    ///
    /// Bounds along the path are re-validated at resolution time; the
    /// addressed aggregate may have been resized since the address was taken.
    pub fn load(&self) -> Result<Value> {
        let value = self.cell.borrow();
        let target = navigate(&value, &self.path)?;
        match self.slot {
            AddressSlot::Whole => Ok(target.clone()),
            AddressSlot::StringChar(offset) => {
                let s = expect_string(target)?;
                match s.bytes.get(offset) {
                    Some(byte) => Ok(Value::Char(*byte)),
                    None => Err(index_error(offset, s.len())),
                }
            }
            AddressSlot::PackedByte(offset) => match target {
                Value::Array(array) => array.get(offset),
                other => Err(crate::unexpected_type("a packed array", other)),
            },
            AddressSlot::StringLength => {
                let s = expect_string(target)?;
                Ok(Value::int(s.len() as i64))
            }
        }
    }

    /// Applies a reader to the whole value the address resolves to, without
    /// cloning it
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Value) -> Result<R>) -> Result<R> {
        if self.slot != AddressSlot::Whole {
            return crate::runtime_error!("Expected a whole-value address");
        }
        let value = self.cell.borrow();
        f(navigate(&value, &self.path)?)
    }

    /// Writes a value through the address
    pub fn store(&self, value: Value) -> Result<()> {
        let mut cell = self.cell.borrow_mut();
        let target = navigate_mut(&mut cell, &self.path)?;
        match self.slot {
            AddressSlot::Whole => assign_value(target, value),
            AddressSlot::StringChar(offset) => {
                let byte = char_byte(&value)?;
                let s = expect_string_mut(target)?;
                match s.bytes.get_mut(offset) {
                    Some(slot) => {
                        *slot = byte;
                        Ok(())
                    }
                    None => Err(index_error(offset, s.len())),
                }
            }
            AddressSlot::PackedByte(offset) => match target {
                Value::Array(array) => array.set(offset, coerce_byte(value)?),
                other => Err(crate::unexpected_type("a packed array", other)),
            },
            AddressSlot::StringLength => {
                let new_len = value.as_i64()?;
                let s = expect_string_mut(target)?;
                if new_len < 0 {
                    log::warn!("negative string length {new_len} clamped to 0");
                }
                s.set_len(new_len.max(0) as usize);
                Ok(())
            }
        }
    }
}

/// A pointer value
#[derive(Clone, Debug, Default)]
pub enum Pointer {
    /// The nil pointer
    #[default]
    Nil,
    /// A pointer to VM-managed storage
    Cell(Address),
    /// A raw native pointer supplied by the embedder, carried but never
    /// dereferenced for assignment
    Opaque(u64),
}

impl Pointer {
    /// Reads the pointed-to value
    pub fn load(&self) -> Result<Value> {
        match self {
            Self::Nil => Err(Error::new(ErrorKind::NilDereference)),
            Self::Cell(address) => address.load(),
            Self::Opaque(_) => crate::runtime_error!("Cannot dereference an opaque pointer"),
        }
    }

    /// Writes through the pointer
    pub fn store(&self, value: Value) -> Result<()> {
        match self {
            Self::Nil => Err(Error::new(ErrorKind::NilDereference)),
            Self::Cell(address) => address.store(value),
            Self::Opaque(_) => Err(Error::new(ErrorKind::OpaquePointerWrite)),
        }
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Nil, Self::Nil) => true,
            (Self::Cell(a), Self::Cell(b)) => {
                crate::Ptr::ptr_eq(&a.cell, &b.cell) && a.path == b.path && a.slot == b.slot
            }
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

fn navigate<'a>(mut value: &'a Value, path: &[PathSegment]) -> Result<&'a Value> {
    for segment in path {
        value = match (segment, value) {
            (PathSegment::Element(flat), Value::Array(array)) => match &array.storage {
                ArrayStorage::Values(values) => values
                    .get(*flat)
                    .ok_or_else(|| index_error(*flat, values.len()))?,
                ArrayStorage::Packed(_) => {
                    return crate::runtime_error!("Packed elements are addressed by byte");
                }
            },
            (PathSegment::Field(index), Value::Record(record)) => record
                .fields
                .get(*index)
                .map(|f| &f.value)
                .ok_or_else(|| index_error(*index, record.fields.len()))?,
            (PathSegment::Element(_), other) => {
                return Err(crate::unexpected_type("an array", other));
            }
            (PathSegment::Field(_), other) => {
                return Err(crate::unexpected_type("a record", other));
            }
        };
    }
    Ok(value)
}

fn navigate_mut<'a>(mut value: &'a mut Value, path: &[PathSegment]) -> Result<&'a mut Value> {
    for segment in path {
        value = match (segment, value) {
            (PathSegment::Element(flat), Value::Array(array)) => match &mut array.storage {
                ArrayStorage::Values(values) => {
                    let len = values.len();
                    values.get_mut(*flat).ok_or_else(|| index_error(*flat, len))?
                }
                ArrayStorage::Packed(_) => {
                    return crate::runtime_error!("Packed elements are addressed by byte");
                }
            },
            (PathSegment::Field(index), Value::Record(record)) => {
                let len = record.fields.len();
                record
                    .fields
                    .get_mut(*index)
                    .map(|f| &mut f.value)
                    .ok_or_else(|| index_error(*index, len))?
            }
            (PathSegment::Element(_), other) => {
                return Err(crate::unexpected_type("an array", other));
            }
            (PathSegment::Field(_), other) => {
                return Err(crate::unexpected_type("a record", other));
            }
        };
    }
    Ok(value)
}

/// Assigns a value into a typed storage slot
///
/// The slot's declared type is preserved: integer and real widths stick,
/// fixed strings truncate, enums keep their type identity. Out-of-range
/// narrowing is reported as a warning and the value wraps, matching the
/// range-check behaviour of narrow storage.
pub(crate) fn assign_value(target: &mut Value, value: Value) -> Result<()> {
    match (&mut *target, value) {
        (Value::Int(slot), Value::Int(int)) => {
            if !slot.width.in_range(int.value) {
                log::warn!(
                    "value {} out of range for {:?} storage, wrapping",
                    int.value,
                    slot.width
                );
            }
            slot.value = slot.width.wrap(int.value);
            Ok(())
        }
        (Value::Int(slot), Value::Char(c)) => {
            slot.value = slot.width.wrap(c as i64);
            Ok(())
        }
        (Value::Int(slot), Value::Bool(b)) => {
            slot.value = b as i64;
            Ok(())
        }
        (Value::Real(slot), Value::Real(real)) => {
            slot.value = real.value;
            Ok(())
        }
        (Value::Real(slot), Value::Int(int)) => {
            slot.value = int.value as f64;
            Ok(())
        }
        (Value::Str(slot), Value::Str(s)) => {
            if slot.assign(&s.bytes) {
                log::warn!(
                    "string of length {} truncated to fixed length {}",
                    s.len(),
                    slot.max_len.unwrap_or_default()
                );
            }
            Ok(())
        }
        (Value::Str(slot), Value::Char(c)) => {
            slot.assign(&[c]);
            Ok(())
        }
        (Value::Char(slot), Value::Char(c)) => {
            *slot = c;
            Ok(())
        }
        (Value::Char(slot), Value::Str(s)) if s.len() == 1 => {
            *slot = s.bytes[0];
            Ok(())
        }
        (Value::Char(slot), Value::Int(int)) => {
            if !IntWidth::U8.in_range(int.value) {
                log::warn!("value {} out of range for char storage, wrapping", int.value);
            }
            *slot = int.value as u8;
            Ok(())
        }
        (Value::Bool(slot), Value::Bool(b)) => {
            *slot = b;
            Ok(())
        }
        (Value::Enum(slot), Value::Enum(e)) => {
            slot.ordinal = e.ordinal;
            if slot.type_name.is_empty() {
                *slot = e;
            }
            Ok(())
        }
        (Value::Enum(slot), Value::Int(int)) => {
            if !slot.in_range(int.value) {
                log::warn!(
                    "ordinal {} out of range for enum '{}'",
                    int.value,
                    slot.type_name
                );
            }
            slot.ordinal = int.value;
            Ok(())
        }
        (Value::Int(slot), Value::Thread(id)) => {
            slot.value = id as i64;
            Ok(())
        }
        (slot, value) => {
            *slot = value;
            Ok(())
        }
    }
}

fn char_byte(value: &Value) -> Result<u8> {
    match value {
        Value::Char(c) => Ok(*c),
        Value::Str(s) if s.len() == 1 => Ok(s.bytes[0]),
        Value::Int(int) => Ok(int.value as u8),
        other => Err(crate::unexpected_type("a character", other)),
    }
}

fn coerce_byte(value: Value) -> Result<Value> {
    let v = value.as_i64()?;
    if !IntWidth::U8.in_range(v) {
        log::warn!("value {v} out of range for byte storage, truncating");
    }
    Ok(Value::Int(IntValue::with_width(IntWidth::U8, v & 0xff)))
}

fn expect_string(value: &Value) -> Result<&VmString> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(crate::unexpected_type("a string", other)),
    }
}

fn expect_string_mut(value: &mut Value) -> Result<&mut VmString> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(crate::unexpected_type("a string", other)),
    }
}

fn index_error(index: usize, len: usize) -> Error {
    Error::new(ErrorKind::IndexOutOfRange {
        index: index as i64,
        min: 0,
        max: len as i64 - 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FieldSlot, RecordValue, value_cell};

    #[test]
    fn whole_cell_round_trip() {
        let cell = value_cell(Value::int(1));
        let address = Address::whole(cell.clone());
        address.store(Value::int(42)).unwrap();
        assert_eq!(address.load().unwrap(), Value::int(42));
        assert_eq!(*cell.borrow(), Value::int(42));
    }

    #[test]
    fn field_paths_resolve() {
        let record = RecordValue {
            class: None,
            fields: vec![
                FieldSlot {
                    name: "x".into(),
                    value: Value::int(0),
                },
                FieldSlot {
                    name: "y".into(),
                    value: Value::int(0),
                },
            ],
        };
        let cell = value_cell(Value::Record(record));
        let address = Address::whole(cell.clone())
            .child(PathSegment::Field(1))
            .unwrap();
        address.store(Value::int(7)).unwrap();
        assert_eq!(address.load().unwrap(), Value::int(7));
    }

    #[test]
    fn string_char_slot_reads_and_writes() {
        let cell = value_cell(Value::string("hat"));
        let address = Address::whole(cell.clone()).with_slot(AddressSlot::StringChar(0));
        assert_eq!(address.load().unwrap(), Value::Char(b'h'));
        address.store(Value::Char(b'c')).unwrap();
        assert_eq!(*cell.borrow(), Value::string("cat"));
    }

    #[test]
    fn length_slot_truncates_and_pads() {
        let cell = value_cell(Value::string("hello"));
        let address = Address::whole(cell.clone()).with_slot(AddressSlot::StringLength);
        assert_eq!(address.load().unwrap(), Value::int(5));
        address.store(Value::int(2)).unwrap();
        assert_eq!(*cell.borrow(), Value::string("he"));
        address.store(Value::int(4)).unwrap();
        assert_eq!(*cell.borrow(), Value::string("he  "));
    }

    #[test]
    fn nil_and_opaque_pointers_reject_writes() {
        assert!(matches!(
            Pointer::Nil.store(Value::int(1)).unwrap_err().kind,
            ErrorKind::NilDereference
        ));
        assert!(matches!(
            Pointer::Opaque(0xdead).store(Value::int(1)).unwrap_err().kind,
            ErrorKind::OpaquePointerWrite
        ));
    }

    #[test]
    fn narrow_assignment_wraps() {
        let cell = value_cell(Value::Int(IntValue::with_width(IntWidth::U8, 0)));
        let address = Address::whole(cell.clone());
        address.store(Value::int(300)).unwrap();
        let Value::Int(int) = &*cell.borrow() else {
            unreachable!()
        };
        assert_eq!(int.value, 44);
        assert_eq!(int.width, IntWidth::U8);
    }
}
