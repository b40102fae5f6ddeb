use std::{any::Any, cell::RefCell};

use crate::{
    error::{Fault, RuntimeErrorKind},
    value::Value,
};

/// Opaque host-side value. Indexing is opt-in.
pub trait HostObject {
    fn type_name(&self) -> &str;

    fn as_any(&self) -> &dyn Any;

    fn len(&self) -> Option<usize> {
        None
    }

    fn get_index(&self, _index: &Value) -> Result<Value, Fault> {
        Err(Fault::new(
            RuntimeErrorKind::TypeMismatch,
            format!("'{}' does not support indexing.", self.type_name()),
        ))
    }

    fn set_index(&self, _index: &Value, _value: Value) -> Result<(), Fault> {
        Err(Fault::new(
            RuntimeErrorKind::TypeMismatch,
            format!("'{}' does not support indexing.", self.type_name()),
        ))
    }
}

#[derive(Default)]
pub struct ListObject {
    pub items: RefCell<Vec<Value>>,
}

impl ListObject {
    fn slot(&self, index: &Value) -> Result<usize, Fault> {
        let len = self.items.borrow().len();
        match index {
            Value::Double(n) if n.fract() == 0.0 && *n >= 0.0 && (*n as usize) < len => Ok(*n as usize),
            Value::Double(n) => Err(Fault::new(
                RuntimeErrorKind::IndexOutOfRange,
                format!("Index {} out of range for List of length {}.", n, len),
            )),
            other => Err(Fault::new(
                RuntimeErrorKind::TypeMismatch,
                format!("List index must be a Double, got '{}'.", other.type_name()),
            )),
        }
    }

    pub fn push(&self, value: Value) {
        self.items.borrow_mut().push(value);
    }
}

impl HostObject for ListObject {
    fn type_name(&self) -> &str {
        "List"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn len(&self) -> Option<usize> {
        Some(self.items.borrow().len())
    }

    fn get_index(&self, index: &Value) -> Result<Value, Fault> {
        let slot = self.slot(index)?;
        Ok(self.items.borrow()[slot].clone())
    }

    fn set_index(&self, index: &Value, value: Value) -> Result<(), Fault> {
        let slot = self.slot(index)?;
        self.items.borrow_mut()[slot] = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_index_bounds() {
        let list = ListObject::default();
        list.push(Value::Double(4.0));
        assert!(matches!(list.get_index(&Value::Double(0.0)), Ok(Value::Double(n)) if n == 4.0));
        let fault = list.get_index(&Value::Double(1.0)).unwrap_err();
        assert_eq!(fault.kind, RuntimeErrorKind::IndexOutOfRange);
        assert!(list.set_index(&Value::Double(0.0), Value::Null).is_ok());
        assert_eq!(list.len(), Some(1));
    }
}
