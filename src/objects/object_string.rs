use std::{
    fmt,
    hash::{Hash, Hasher},
    rc::Rc,
};

use rustc_hash::FxHasher;

/// Immutable string with its hash computed once at creation. Table lookups
/// compare the hash first and only fall back to the text on a hash hit.
#[derive(Clone)]
pub struct HashedString {
    text: Rc<str>,
    hash: u64,
}

impl HashedString {
    pub fn new(text: &str) -> Self {
        let mut hasher = FxHasher::default();
        text.hash(&mut hasher);
        HashedString {
            text: Rc::from(text),
            hash: hasher.finish(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn hash_value(&self) -> u64 {
        self.hash
    }
}

impl PartialEq for HashedString {
    fn eq(&self, other: &HashedString) -> bool {
        self.hash == other.hash && (Rc::ptr_eq(&self.text, &other.text) || self.text == other.text)
    }
}

impl Eq for HashedString {}

impl Hash for HashedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl From<&str> for HashedString {
    fn from(text: &str) -> Self {
        HashedString::new(text)
    }
}

impl fmt::Display for HashedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for HashedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_text_equal_hash() {
        let a = HashedString::new("field");
        let b = HashedString::new("field");
        assert_eq!(a.hash_value(), b.hash_value());
        assert!(a == b);
        assert!(a != HashedString::new("other"));
    }
}
