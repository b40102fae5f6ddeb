use strum_macros::{Display, FromRepr};

use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
pub enum OpCode {
    Constant,
    Null,
    True,
    False,
    Pop,
    Duplicate,

    GetLocal,
    SetLocal,
    GetUpvalue,
    SetUpvalue,
    DefineGlobal,
    GetGlobal,
    SetGlobal,

    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,
    Not,

    Jump,
    JumpIfFalse,
    JumpIfTrue,
    Loop,

    Call,
    Invoke,
    Closure,
    Capture,
    CloseUpvalue,
    Return,
    Yield,
    Throw,

    Class,
    Inherit,
    Mixin,
    Method,
    GetProperty,
    SetProperty,
    GetSuper,
    Freeze,
    GetIndex,
    SetIndex,

    Test,
    Build,
}

impl OpCode {
    #[inline(always)]
    pub fn from_byte(byte: u8) -> Option<Self> {
        OpCode::from_repr(byte)
    }

    #[inline(always)]
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Number of operand bytes that follow the opcode byte.
    pub fn operand_count(self) -> usize {
        match self {
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::DefineGlobal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::Call
            | OpCode::Method
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper => 1,
            OpCode::Jump
            | OpCode::JumpIfFalse
            | OpCode::JumpIfTrue
            | OpCode::Loop
            | OpCode::Invoke
            | OpCode::Closure
            | OpCode::Capture
            | OpCode::Build => 2,
            OpCode::Class | OpCode::Test => 3,
            _ => 0,
        }
    }
}

/// Sub-operations carried by the first operand of `OpCode::Test`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
pub enum TestOpCode {
    SetStart,
    CaseAddress,
    CaseStart,
    CaseEnd,
    SetEnd,
}

/// Sub-operations carried by the first operand of `OpCode::Build`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
pub enum BuildOpCode {
    Bind,
    Queue,
}

/// Operand value of `OpCode::Class` when the class has no field initializers.
pub const NO_INIT_CHAIN: u16 = u16::MAX;

pub type ValueArray = Vec<Value>;

#[derive(Debug, Default)]
pub struct Chunk {
    pub name: String,
    pub code: Vec<u8>,
    pub lines: Vec<usize>,
    pub constants: ValueArray,
}

impl Chunk {
    pub fn new(name: &str) -> Chunk {
        Chunk {
            name: name.to_string(),
            ..Chunk::default()
        }
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Index of an equal constant already in the pool. Only strings and
    /// numbers are shared; reference values always get their own slot.
    pub fn find_constant(&self, value: &Value) -> Option<usize> {
        match value {
            Value::Double(_) | Value::String(_) => self.constants.iter().position(|c| c.same_constant(value)),
            _ => None,
        }
    }

    #[inline(always)]
    pub fn read_byte(&self, offset: usize) -> Option<u8> {
        self.code.get(offset).copied()
    }

    #[inline(always)]
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let high = self.read_byte(offset)? as u16;
        let low = self.read_byte(offset + 1)? as u16;
        Some((high << 8) | low)
    }

    pub fn write_u16_at(&mut self, offset: usize, value: u16) {
        self.code[offset] = ((value >> 8) & 0xff) as u8;
        self.code[offset + 1] = (value & 0xff) as u8;
    }

    pub fn get_constant(&self, index: usize) -> Option<&Value> {
        self.constants.get(index)
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip_through_byte() {
        assert_eq!(OpCode::from_byte(OpCode::Build.to_byte()), Some(OpCode::Build));
        assert_eq!(OpCode::from_byte(250), None);
        assert_eq!(OpCode::Class.to_string(), "Class");
    }

    #[test]
    fn test_u16_write_read_order() {
        let mut chunk = Chunk::new("test");
        chunk.write(0, 1);
        chunk.write(0, 1);
        chunk.write_u16_at(0, 0x1234);
        assert_eq!(chunk.code, vec![0x12, 0x34]);
        assert_eq!(chunk.read_u16(0), Some(0x1234));
        assert_eq!(chunk.read_u16(1), None);
    }

    #[test]
    fn test_constants_are_shared_for_numbers() {
        let mut chunk = Chunk::new("test");
        let index = chunk.add_constant(Value::Double(2.0));
        assert_eq!(chunk.find_constant(&Value::Double(2.0)), Some(index));
        assert_eq!(chunk.find_constant(&Value::Double(3.0)), None);
    }
}
