//! Per-session property bag.
//!
//! Handlers often need to remember something about a device between packages
//! (a firmware version, a negotiated setting, a counter).  The bag maps string
//! keys to values of any `'static` type.
//!
//! # Type mismatches
//!
//! Every value keeps its concrete type.  Asking for a key with a different
//! type than the one stored returns `None`, exactly as if the key were absent.
//! It is not an error.  Storing `42u8` and reading it back as `Option<u8>` or
//! `u16` therefore yields `None`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

type Value = Box<dyn Any + Send + Sync>;

/// String-keyed, type-tagged values attached to a session.
///
/// Safe to share between the receive loop, the handle loop, and whatever else
/// holds the session.
#[derive(Default)]
pub struct PropertyBag {
    entries: RwLock<HashMap<String, Value>>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing whatever was there (of any type).
    pub fn insert<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Box::new(value));
    }

    /// Returns a clone of the value under `key` if it is present *and* of type `T`.
    pub fn get<T>(&self, key: &str) -> Option<T>
    where
        T: Any + Clone,
    {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Runs `f` against the value under `key` without cloning it.
    ///
    /// `f` is not called when the key is absent or holds another type.
    pub fn with<T, R>(&self, key: &str, f: impl FnOnce(&T) -> R) -> Option<R>
    where
        T: Any,
    {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(|v| v.downcast_ref::<T>()).map(f)
    }

    /// Removes `key` and returns its value if it was of type `T`.
    ///
    /// A value of another type is left in place.
    pub fn remove<T>(&self, key: &str) -> Option<T>
    where
        T: Any,
    {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if !entries.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        entries
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|b| *b)
    }

    /// True when `key` is present, regardless of the stored type.
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for PropertyBag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_set().entries(entries.keys()).finish()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_then_get_returns_value() {
        let bag = PropertyBag::new();
        bag.insert("firmware", "1.2.3".to_string());

        assert_eq!(bag.get::<String>("firmware").as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_get_with_mismatched_type_behaves_as_absent() {
        // Arrange: store a u8
        let bag = PropertyBag::new();
        bag.insert("level", 7u8);

        // Act / Assert: neither a wider integer nor Option<u8> matches
        assert_eq!(bag.get::<u16>("level"), None);
        assert_eq!(bag.get::<Option<u8>>("level"), None);
        assert_eq!(bag.get::<u8>("level"), Some(7));
    }

    #[test]
    fn test_missing_key_returns_none() {
        let bag = PropertyBag::new();
        assert_eq!(bag.get::<u32>("nope"), None);
        assert!(!bag.contains_key("nope"));
    }

    #[test]
    fn test_insert_overwrites_value_of_other_type() {
        let bag = PropertyBag::new();
        bag.insert("k", 1u32);
        bag.insert("k", "text".to_string());

        assert_eq!(bag.get::<u32>("k"), None);
        assert_eq!(bag.get::<String>("k").as_deref(), Some("text"));
        assert_eq!(bag.len(), 1);
    }

    #[test]
    fn test_remove_with_wrong_type_keeps_entry() {
        let bag = PropertyBag::new();
        bag.insert("k", 5i64);

        assert_eq!(bag.remove::<i32>("k"), None);
        assert!(bag.contains_key("k"));
        assert_eq!(bag.remove::<i64>("k"), Some(5));
        assert!(bag.is_empty());
    }

    #[test]
    fn test_with_borrows_without_clone() {
        let bag = PropertyBag::new();
        bag.insert("list", vec![1, 2, 3]);

        let total = bag.with::<Vec<i32>, i32>("list", |v| v.iter().sum());

        assert_eq!(total, Some(6));
    }
}
