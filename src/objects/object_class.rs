use std::{cell::RefCell, rc::Rc};

use crate::{
    chunk::OpCode,
    error::Fault,
    objects::{object_closure::Closure, object_string::HashedString},
    table::Table,
    value::Value,
};

pub type ClassRef = Rc<RefCell<Class>>;

/// Operator-overload slots, indexed by the opcode they intercept.
pub const OVERLOAD_NAMES: [(&str, OpCode); 8] = [
    ("_add", OpCode::Add),
    ("_sub", OpCode::Subtract),
    ("_mul", OpCode::Multiply),
    ("_div", OpCode::Divide),
    ("_mod", OpCode::Modulo),
    ("_eq", OpCode::Equal),
    ("_ls", OpCode::Less),
    ("_gr", OpCode::Greater),
];

fn overload_slot_for_name(name: &str) -> Option<usize> {
    OVERLOAD_NAMES.iter().position(|(n, _)| *n == name)
}

fn overload_slot_for_op(op: OpCode) -> Option<usize> {
    OVERLOAD_NAMES.iter().position(|(_, o)| *o == op)
}

/// A field-initializer entry point: code inside `closure`'s chunk starting at
/// `offset`, run with the new instance in slot 0.
#[derive(Clone)]
pub struct InitChainFragment {
    pub closure: Rc<Closure>,
    pub offset: usize,
}

pub struct Class {
    pub name: String,
    pub methods: Table,
    overloads: [Option<Value>; OVERLOAD_NAMES.len()],
    pub superclass: Option<ClassRef>,
    pub init_chains: Vec<InitChainFragment>,
    /// Static fields; a class is itself an instance.
    pub fields: Table,
    pub frozen: bool,
}

impl Class {
    pub fn new(name: &str) -> Self {
        Class {
            name: name.to_string(),
            methods: Table::new(),
            overloads: Default::default(),
            superclass: None,
            init_chains: vec![],
            fields: Table::new(),
            frozen: false,
        }
    }

    pub fn into_ref(self) -> ClassRef {
        Rc::new(RefCell::new(self))
    }

    pub fn find_method(&self, name: &HashedString) -> Option<Value> {
        self.methods.get(name).cloned()
    }

    pub fn initializer(&self) -> Option<Value> {
        self.methods.find("init")
    }

    pub fn overload(&self, op: OpCode) -> Option<Value> {
        overload_slot_for_op(op).and_then(|slot| self.overloads[slot].clone())
    }

    /// Registers or replaces a method (last write wins).
    pub fn add_method(&mut self, name: HashedString, method: Value) {
        if let Some(slot) = overload_slot_for_name(name.as_str()) {
            self.overloads[slot] = Some(method.clone());
        }
        self.methods.insert(name, method);
    }

    /// Registers a method contributed by a mixin. An existing same-named
    /// method is kept and the two run in sequence, original first.
    pub fn mix_method(&mut self, name: HashedString, method: Value) {
        let combined = match self.methods.get(&name) {
            Some(existing) => Value::combine(existing, &method),
            None => method,
        };
        self.add_method(name, combined);
    }

    /// Copies the superclass's methods and prepends its init chain.
    pub fn inherit_from(&mut self, superclass: &ClassRef) {
        {
            let parent = superclass.borrow();
            for (name, method) in parent.methods.iter() {
                self.add_method(name.clone(), method.clone());
            }
            let mut chains = parent.init_chains.clone();
            chains.append(&mut self.init_chains);
            self.init_chains = chains;
        }
        self.superclass = Some(Rc::clone(superclass));
    }

    /// Combines the mixin's methods into this class and appends its init
    /// chain after everything already registered.
    pub fn mixin_from(&mut self, mixin: &Class) {
        for (name, method) in mixin.methods.iter() {
            self.mix_method(name.clone(), method.clone());
        }
        self.init_chains.extend(mixin.init_chains.iter().cloned());
    }

    pub fn set_field(&mut self, name: HashedString, value: Value) -> Result<(), Fault> {
        self.fields.set_checked(self.frozen, &self.name, name, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::object_native_function::{NativeCallResult, NativeFunction};

    fn native(name: &str) -> Value {
        Value::NativeFunction(Rc::new(NativeFunction::new(name, None, |_vm, _argc| Ok(NativeCallResult::Void))))
    }

    #[test]
    fn test_overload_slot_follows_method_name() {
        let mut class = Class::new("Vec2");
        assert!(class.overload(OpCode::Add).is_none());
        class.add_method("_add".into(), native("add"));
        assert!(class.overload(OpCode::Add).is_some());
        assert!(class.overload(OpCode::Subtract).is_none());
    }

    #[test]
    fn test_mixin_combines_existing_method() {
        let mut host = Class::new("Host");
        host.add_method("Tick".into(), native("a"));
        let mut mixin = Class::new("Mix");
        mixin.add_method("Tick".into(), native("b"));
        mixin.add_method("Other".into(), native("c"));

        host.mixin_from(&mixin);
        match host.find_method(&"Tick".into()) {
            Some(Value::Combined(list)) => assert_eq!(list.len(), 2),
            _ => panic!("expected combined method"),
        }
        assert!(matches!(host.find_method(&"Other".into()), Some(Value::NativeFunction(_))));
    }

    #[test]
    fn test_frozen_class_rejects_new_static() {
        let mut class = Class::new("Frozen");
        class.set_field("a".into(), Value::Double(1.0)).unwrap();
        class.frozen = true;
        assert!(class.set_field("a".into(), Value::Double(2.0)).is_ok());
        let fault = class.set_field("b".into(), Value::Null).unwrap_err();
        assert_eq!(fault.kind, crate::error::RuntimeErrorKind::FreezeViolation);
    }
}
