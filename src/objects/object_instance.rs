use std::{cell::RefCell, rc::Rc};

use crate::{
    error::Fault,
    objects::{object_class::ClassRef, object_string::HashedString},
    table::Table,
    value::Value,
};

pub type InstanceRef = Rc<RefCell<Instance>>;

pub struct Instance {
    pub class: ClassRef,
    pub fields: Table,
    pub frozen: bool,
}

impl Instance {
    pub fn new(class: ClassRef) -> InstanceRef {
        Rc::new(RefCell::new(Instance {
            class,
            fields: Table::new(),
            frozen: false,
        }))
    }

    pub fn class_name(&self) -> String {
        self.class.borrow().name.clone()
    }

    pub fn set_field(&mut self, name: HashedString, value: Value) -> Result<(), Fault> {
        let owner = self.class_name();
        self.fields.set_checked(self.frozen, &owner, name, value)
    }

    /// Same class, fresh field table, unfrozen.
    pub fn duplicate(&self) -> InstanceRef {
        Rc::new(RefCell::new(Instance {
            class: Rc::clone(&self.class),
            fields: self.fields.clone(),
            frozen: false,
        }))
    }
}

pub struct BoundMethod {
    pub receiver: Value,
    pub method: Value,
}
