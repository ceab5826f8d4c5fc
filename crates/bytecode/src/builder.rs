use crate::{BYTECODE_VERSION, Chunk, Constant, Op, TypeTag};

/// Incrementally assembles a [Chunk]
///
/// Used by the front-end code generators, and by tests that need hand-built
/// programs. Operands are emitted in the encodings documented on [Op];
/// constants are interned with deduplication.
#[derive(Default)]
pub struct ChunkBuilder {
    bytes: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Constant>,
    current_line: u32,
}

impl ChunkBuilder {
    /// Makes a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line recorded for subsequently emitted bytes
    pub fn set_line(&mut self, line: u32) -> &mut Self {
        self.current_line = line;
        self
    }

    /// The offset of the next byte to be emitted
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    /// Emits an opcode byte
    pub fn op(&mut self, op: Op) -> &mut Self {
        self.byte(op as u8)
    }

    /// Emits a raw byte
    pub fn byte(&mut self, byte: u8) -> &mut Self {
        self.bytes.push(byte);
        self.lines.push(self.current_line);
        self
    }

    /// Emits a big-endian u16
    pub fn u16(&mut self, value: u16) -> &mut Self {
        let [hi, lo] = value.to_be_bytes();
        self.byte(hi).byte(lo)
    }

    /// Emits a signed byte
    pub fn i8(&mut self, value: i8) -> &mut Self {
        self.byte(value as u8)
    }

    /// Emits a signed 16-bit value, two's complement
    pub fn i16(&mut self, value: i16) -> &mut Self {
        self.u16(value as u16)
    }

    /// Interns a constant, returning its pool index
    pub fn constant(&mut self, constant: Constant) -> u16 {
        if let Some(index) = self.constants.iter().position(|c| *c == constant) {
            return index as u16;
        }
        let index = self.constants.len();
        assert!(index <= u16::MAX as usize, "constant pool overflow");
        self.constants.push(constant);
        index as u16
    }

    /// Interns a string constant
    pub fn str_constant(&mut self, s: &str) -> u16 {
        self.constant(Constant::Str(s.into()))
    }

    /// Interns an integer constant
    pub fn int_constant(&mut self, n: i64) -> u16 {
        self.constant(Constant::Int(n))
    }

    /// Emits a push of the given constant, choosing the 8- or 16-bit encoding
    pub fn push_constant(&mut self, constant: Constant) -> &mut Self {
        let index = self.constant(constant);
        if index <= u8::MAX as u16 {
            self.op(Op::Constant).byte(index as u8)
        } else {
            self.op(Op::Constant16).u16(index)
        }
    }

    /// Emits a push of an integer constant
    pub fn push_int(&mut self, n: i64) -> &mut Self {
        match n {
            0 => self.op(Op::Const0),
            1 => self.op(Op::Const1),
            -128..=127 => {
                let n = n as i8;
                self.op(Op::PushInt8).i8(n)
            }
            _ => self.push_constant(Constant::Int(n)),
        }
    }

    /// Emits a push of a real constant
    pub fn push_real(&mut self, x: f64) -> &mut Self {
        self.push_constant(Constant::Real(x))
    }

    /// Emits a push of a string constant
    pub fn push_str(&mut self, s: &str) -> &mut Self {
        self.push_constant(Constant::Str(s.into()))
    }

    /// Emits a push of a char constant
    pub fn push_char(&mut self, c: u8) -> &mut Self {
        self.push_constant(Constant::Char(c))
    }

    // Global accessors pick the narrow or wide opcode based on the name's pool index.
    fn global_op(&mut self, name: &str, narrow: Op, wide: Op) -> &mut Self {
        let index = self.str_constant(name);
        if index <= u8::MAX as u16 {
            self.op(narrow).byte(index as u8)
        } else {
            self.op(wide).u16(index)
        }
    }

    /// Emits a global load
    pub fn get_global(&mut self, name: &str) -> &mut Self {
        self.global_op(name, Op::GetGlobal, Op::GetGlobal16)
    }

    /// Emits a global store
    pub fn set_global(&mut self, name: &str) -> &mut Self {
        self.global_op(name, Op::SetGlobal, Op::SetGlobal16)
    }

    /// Emits a push of a global's address
    pub fn get_global_address(&mut self, name: &str) -> &mut Self {
        self.global_op(name, Op::GetGlobalAddress, Op::GetGlobalAddress16)
    }

    /// Emits a scalar global definition
    pub fn define_global(&mut self, name: &str, tag: TypeTag) -> &mut Self {
        let type_name = self.str_constant("");
        self.global_op(name, Op::DefineGlobal, Op::DefineGlobal16)
            .byte(tag as u8)
            .u16(type_name)
    }

    /// Emits a fixed-length string global definition (a length of 0 means dynamic)
    pub fn define_string_global(&mut self, name: &str, max_len: i64) -> &mut Self {
        let type_name = self.str_constant("");
        let len = self.int_constant(max_len);
        self.global_op(name, Op::DefineGlobal, Op::DefineGlobal16)
            .byte(TypeTag::String as u8)
            .u16(type_name)
            .u16(len)
    }

    /// Emits an array global definition with the given per-dimension bounds
    pub fn define_array_global(
        &mut self,
        name: &str,
        bounds: &[(i64, i64)],
        elem: TypeTag,
    ) -> &mut Self {
        let bound_indices: Vec<(u16, u16)> = bounds
            .iter()
            .map(|&(lower, upper)| (self.int_constant(lower), self.int_constant(upper)))
            .collect();
        let elem_name = self.str_constant("");
        self.global_op(name, Op::DefineGlobal, Op::DefineGlobal16)
            .byte(TypeTag::Array as u8)
            .byte(bounds.len() as u8);
        for (lower, upper) in bound_indices {
            self.u16(lower).u16(upper);
        }
        self.byte(elem as u8).u16(elem_name)
    }

    /// Emits a forward jump with a placeholder offset, returning the patch position
    pub fn jump(&mut self, op: Op) -> usize {
        self.op(op);
        let position = self.position();
        self.u16(0xffff);
        position
    }

    /// Patches a forward jump to land at the current position
    ///
    /// The offset is relative to the first byte after the operand.
    pub fn patch_jump(&mut self, position: usize) {
        let offset = self.position() as i64 - (position as i64 + 2);
        assert!(
            i16::try_from(offset).is_ok(),
            "jump offset out of range: {offset}"
        );
        let [hi, lo] = (offset as i16).to_be_bytes();
        self.bytes[position] = hi;
        self.bytes[position + 1] = lo;
    }

    /// Emits a backwards jump to the given target position
    pub fn loop_back(&mut self, target: usize) -> &mut Self {
        self.op(Op::Jump);
        let offset = target as i64 - (self.position() as i64 + 2);
        assert!(i16::try_from(offset).is_ok(), "loop offset out of range");
        self.i16(offset as i16)
    }

    /// Emits a direct call to a compiled routine
    pub fn call(&mut self, name: &str, entry: u16, arg_count: u8) -> &mut Self {
        let name = self.str_constant(name);
        self.op(Op::Call).u16(name).u16(entry).byte(arg_count)
    }

    /// Emits a builtin call by name
    pub fn call_builtin(&mut self, name: &str, arg_count: u8) -> &mut Self {
        let name = self.str_constant(name);
        self.op(Op::CallBuiltin).u16(name).byte(arg_count)
    }

    /// Finishes the build, producing a chunk targeting the current bytecode version
    pub fn finish(self) -> Chunk {
        Chunk::new(BYTECODE_VERSION, self.bytes, self.constants, self.lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_deduplicated() {
        let mut builder = ChunkBuilder::new();
        let a = builder.str_constant("x");
        let b = builder.str_constant("x");
        let c = builder.int_constant(42);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn jump_patching() {
        let mut builder = ChunkBuilder::new();
        builder.op(Op::ConstTrue);
        let jump = builder.jump(Op::JumpIfFalse);
        builder.op(Op::Const0).op(Op::Pop);
        builder.patch_jump(jump);
        let chunk = builder.finish();

        let offset = i16::from_be_bytes([chunk.bytes[jump], chunk.bytes[jump + 1]]);
        // Lands just past the Const0/Pop pair
        assert_eq!(offset, 2);
    }

    #[test]
    fn lines_track_bytes() {
        let mut builder = ChunkBuilder::new();
        builder.set_line(10).op(Op::Const0);
        builder.set_line(11).op(Op::Pop);
        let chunk = builder.finish();
        assert_eq!(chunk.line_for(0), 10);
        assert_eq!(chunk.line_for(1), 11);
    }
}
