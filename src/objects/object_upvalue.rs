use std::{cell::RefCell, rc::Rc};

use crate::value::Value;

/// A captured variable. Starts `Open`, aliasing a live operand-stack slot, and
/// moves to `Closed` exactly once when the owning frame is popped.
#[derive(Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

pub type UpvalueRef = Rc<RefCell<Upvalue>>;

impl Upvalue {
    pub fn new(slot: usize) -> UpvalueRef {
        Rc::new(RefCell::new(Upvalue::Open(slot)))
    }

    pub fn open_slot(&self) -> Option<usize> {
        match self {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        }
    }

    pub fn close(&mut self, value: Value) {
        debug_assert!(matches!(self, Upvalue::Open(_)), "upvalue closed twice");
        *self = Upvalue::Closed(value);
    }
}
