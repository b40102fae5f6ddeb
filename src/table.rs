use std::hash::BuildHasherDefault;

use indexmap::IndexMap;
use rustc_hash::FxHasher;

use crate::{
    error::{Fault, RuntimeErrorKind},
    objects::object_string::HashedString,
    value::Value,
};

type Entries = IndexMap<HashedString, Value, BuildHasherDefault<FxHasher>>;

/// Hashed-name to value map, iterated in insertion order.
#[derive(Clone, Default)]
pub struct Table {
    entries: Entries,
}

impl Table {
    pub fn new() -> Table {
        Table::default()
    }

    pub fn insert(&mut self, key: HashedString, value: Value) -> Option<Value> {
        self.entries.insert(key, value)
    }

    pub fn get(&self, key: &HashedString) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn get_mut(&mut self, key: &HashedString) -> Option<&mut Value> {
        self.entries.get_mut(key)
    }

    pub fn find(&self, key: &str) -> Option<Value> {
        self.entries.get(&HashedString::new(key)).cloned()
    }

    pub fn contains(&self, key: &HashedString) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &HashedString) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HashedString, &Value)> {
        self.entries.iter()
    }

    /// Assignment that honours a freeze flag: existing keys may change, new
    /// keys are refused once frozen.
    pub fn set_checked(&mut self, frozen: bool, owner: &str, key: HashedString, value: Value) -> Result<(), Fault> {
        match self.entries.get_mut(&key) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None if frozen => Err(Fault::new(
                RuntimeErrorKind::FreezeViolation,
                format!("Attempted to create a new entry '{}' via SetField on a frozen object '{}'.", key, owner),
            )),
            None => {
                self.entries.insert(key, value);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_is_kept() {
        let mut table = Table::new();
        for name in ["c", "a", "b"] {
            table.insert(name.into(), Value::Null);
        }
        let keys: Vec<&str> = table.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_set_checked_on_frozen_table() {
        let mut table = Table::new();
        table.set_checked(false, "obj", "a".into(), Value::Double(1.0)).unwrap();
        assert!(table.set_checked(true, "obj", "a".into(), Value::Double(2.0)).is_ok());
        assert!(matches!(table.find("a"), Some(Value::Double(n)) if n == 2.0));
        let fault = table.set_checked(true, "obj", "b".into(), Value::Null).unwrap_err();
        assert_eq!(fault.kind, RuntimeErrorKind::FreezeViolation);
        assert_eq!(table.len(), 1);
    }
}
