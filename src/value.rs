use std::{fmt, rc::Rc};

use crate::objects::{
    object_class::ClassRef,
    object_closure::Closure,
    object_host::HostObject,
    object_instance::{BoundMethod, InstanceRef},
    object_native_function::NativeFunction,
    object_string::HashedString,
};

#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Double(f64),
    String(HashedString),
    Closure(Rc<Closure>),
    Class(ClassRef),
    Instance(InstanceRef),
    BoundMethod(Rc<BoundMethod>),
    NativeFunction(Rc<NativeFunction>),
    /// Methods merged by a mixin, invoked in order with the same arguments.
    Combined(Rc<[Value]>),
    HostObject(Rc<dyn HostObject>),
}

impl Value {
    pub fn string(text: &str) -> Value {
        Value::String(HashedString::new(text))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Double(_) => "Double",
            Value::String(_) => "String",
            Value::Closure(_) => "Closure",
            Value::Class(_) => "Class",
            Value::Instance(_) => "Instance",
            Value::BoundMethod(_) => "BoundMethod",
            Value::NativeFunction(_) => "NativeFunction",
            Value::Combined(_) => "CombinedClosures",
            Value::HostObject(_) => "HostObject",
        }
    }

    pub fn is_falsey(&self) -> bool {
        matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Whether two constants can share one pool slot.
    pub fn same_constant(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }

    /// Merges `added` after `existing`, flattening earlier combinations.
    pub fn combine(existing: &Value, added: &Value) -> Value {
        let mut list: Vec<Value> = match existing {
            Value::Combined(items) => items.to_vec(),
            other => vec![other.clone()],
        };
        match added {
            Value::Combined(items) => list.extend(items.iter().cloned()),
            other => list.push(other.clone()),
        }
        Value::Combined(list.into())
    }
}

/// Reference types compare by identity, strings by hash then text.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::Class(a), Value::Class(b)) => Rc::ptr_eq(a, b),
            (Value::Instance(a), Value::Instance(b)) => Rc::ptr_eq(a, b),
            (Value::BoundMethod(a), Value::BoundMethod(b)) => Rc::ptr_eq(a, b),
            (Value::NativeFunction(a), Value::NativeFunction(b)) => Rc::ptr_eq(a, b),
            (Value::Combined(a), Value::Combined(b)) => Rc::ptr_eq(a, b),
            (Value::HostObject(a), Value::HostObject(b)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Double(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::string(value)
    }
}

pub fn format_number(number: f64) -> String {
    if number.fract() == 0.0 && number.abs() < 1e15 {
        format!("{}", number as i64)
    } else {
        let formatted = format!("{:.10}", number);
        formatted.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Double(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Closure(closure) => {
                if closure.name().is_empty() {
                    write!(f, "<closure>")
                } else {
                    write!(f, "<closure {}>", closure.name())
                }
            }
            Value::Class(class) => write!(f, "<class {}>", class.borrow().name),
            Value::Instance(instance) => write!(f, "<inst {}>", instance.borrow().class_name()),
            Value::BoundMethod(bound) => write!(f, "<boundMeth {}>", bound.method),
            Value::NativeFunction(native) => write!(f, "<native fn {}>", native.name),
            Value::Combined(list) => write!(f, "<combined x{}>", list.len()),
            Value::HostObject(host) => write!(f, "<{}>", host.type_name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            other => write!(f, "{}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_formatting() {
        assert_eq!(format_number(7.0), "7");
        assert_eq!(format_number(-2.5), "-2.5");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
    }

    #[test]
    fn test_string_equality_is_by_content() {
        assert!(Value::string("abc") == Value::string("abc"));
        assert!(Value::string("abc") != Value::string("abd"));
        assert!(Value::Double(1.0) != Value::Bool(true));
    }

    #[test]
    fn test_falsey() {
        assert!(Value::Null.is_falsey());
        assert!(Value::Bool(false).is_falsey());
        assert!(!Value::Double(0.0).is_falsey());
        assert!(!Value::string("").is_falsey());
    }

    #[test]
    fn test_combine_flattens() {
        let a = Value::Double(1.0);
        let b = Value::Double(2.0);
        let c = Value::Double(3.0);
        let ab = Value::combine(&a, &b);
        match Value::combine(&ab, &c) {
            Value::Combined(list) => assert_eq!(list.len(), 3),
            _ => panic!("expected combined"),
        }
    }
}
