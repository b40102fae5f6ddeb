use std::rc::Rc;

use crate::{chunk::Chunk, objects::object_upvalue::UpvalueRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

pub struct Closure {
    pub chunk: Rc<Chunk>,
    pub upvalues: Vec<UpvalueRef>,
    pub arity: u8,
    pub kind: FunctionType,
}

impl Closure {
    /// The capture-free closure stored in a constant pool; `OpCode::Closure`
    /// instantiates it with real upvalue cells.
    pub fn prototype(chunk: Rc<Chunk>, arity: u8, kind: FunctionType) -> Self {
        Closure {
            chunk,
            upvalues: vec![],
            arity,
            kind,
        }
    }

    pub fn with_upvalues(prototype: &Closure, upvalues: Vec<UpvalueRef>) -> Self {
        Closure {
            chunk: Rc::clone(&prototype.chunk),
            upvalues,
            arity: prototype.arity,
            kind: prototype.kind,
        }
    }

    pub fn name(&self) -> &str {
        &self.chunk.name
    }
}
