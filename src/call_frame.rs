use std::rc::Rc;

use crate::{chunk::Chunk, objects::object_closure::Closure};

pub struct CallFrame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    /// Operand-stack index of slot 0 (the callee, receiver or instance).
    pub stack_base: usize,
}

impl CallFrame {
    pub fn new(closure: Rc<Closure>, ip: usize, stack_base: usize) -> Self {
        CallFrame { closure, ip, stack_base }
    }

    #[inline(always)]
    pub fn chunk(&self) -> &Chunk {
        &self.closure.chunk
    }

    #[inline(always)]
    pub fn read_byte(&mut self) -> Option<u8> {
        let byte = self.closure.chunk.read_byte(self.ip)?;
        self.ip += 1;
        Some(byte)
    }

    #[inline(always)]
    pub fn read_u16(&mut self) -> Option<u16> {
        let short = self.closure.chunk.read_u16(self.ip)?;
        self.ip += 2;
        Some(short)
    }
}
