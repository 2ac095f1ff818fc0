//! Strongly typed replacement for the "any-typed" metadata bag threaded
//! through the source implementation's Execution Context (`spec.md` §9,
//! "Dynamic interface bags").

use std::time::Duration;

/// A metadata value. Closed union rather than `Box<dyn Any>` so accessors
/// can be total functions instead of fallible downcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
    Duration(Duration),
    Map(MetadataMap),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<Duration> for Value {
    fn from(v: Duration) -> Self {
        Value::Duration(v)
    }
}

/// Insertion-order-preserving label→value map.
///
/// The source threads a plain hash map through Execution Context; per
/// `spec.md` §9 the contract is "insertion order if the target provides
/// it". A `Vec` of pairs gives us that for free at the scale these maps
/// actually reach (a handful of hook-set entries per operation), without
/// reaching for an external ordered-map crate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataMap {
    entries: Vec<(String, Value)>,
}

impl MetadataMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or overwrites `key`. Overwriting keeps the original
    /// insertion position, matching the least-surprising reading of
    /// "insertion order" for a map that supports updates.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.get(key) {
            Some(Value::Str(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(Value::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order() {
        let mut m = MetadataMap::new();
        m.insert("b", 2i64);
        m.insert("a", 1i64);
        let keys: Vec<_> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
    }

    #[test]
    fn overwrite_keeps_position() {
        let mut m = MetadataMap::new();
        m.insert("a", 1i64);
        m.insert("b", 2i64);
        m.insert("a", 99i64);
        let keys: Vec<_> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(m.get_i64("a"), Some(99));
    }

    #[test]
    fn typed_accessors_return_none_on_mismatch() {
        let mut m = MetadataMap::new();
        m.insert("count", 3i64);
        assert_eq!(m.get_str("count"), None);
        assert_eq!(m.get_i64("count"), Some(3));
    }
}
