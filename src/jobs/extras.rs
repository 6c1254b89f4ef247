//! # Typed key/value payload carried by a work description.
//!
//! [`Extras`] keeps its entries ordered by key so that the persisted form is
//! stable across writes. Equality treats doubles by bit pattern, so a value
//! that went through disk compares equal to the one that was written.

use std::collections::BTreeMap;

/// A single typed extra value.
#[derive(Debug, Clone)]
pub enum ExtraValue {
    /// 32-bit signed integer.
    Int(i32),
    /// 64-bit signed integer.
    Long(i64),
    /// IEEE-754 double.
    Double(f64),
    /// UTF-8 string.
    Str(String),
}

impl ExtraValue {
    /// Stable type tag used by the persisted form.
    pub fn type_tag(&self) -> &'static str {
        match self {
            ExtraValue::Int(_) => "int",
            ExtraValue::Long(_) => "long",
            ExtraValue::Double(_) => "double",
            ExtraValue::Str(_) => "string",
        }
    }
}

impl PartialEq for ExtraValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExtraValue::Int(a), ExtraValue::Int(b)) => a == b,
            (ExtraValue::Long(a), ExtraValue::Long(b)) => a == b,
            (ExtraValue::Double(a), ExtraValue::Double(b)) => a.to_bits() == b.to_bits(),
            (ExtraValue::Str(a), ExtraValue::Str(b)) => a == b,
            _ => false,
        }
    }
}

/// Ordered, string-keyed map of [`ExtraValue`]s.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extras {
    entries: BTreeMap<String, ExtraValue>,
}

impl Extras {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, returning the previous one for the key.
    pub fn put(&mut self, key: impl Into<String>, value: ExtraValue) -> Option<ExtraValue> {
        self.entries.insert(key.into(), value)
    }

    /// Builder-style insert of an `Int`.
    pub fn with_int(mut self, key: impl Into<String>, v: i32) -> Self {
        self.put(key, ExtraValue::Int(v));
        self
    }

    /// Builder-style insert of a `Long`.
    pub fn with_long(mut self, key: impl Into<String>, v: i64) -> Self {
        self.put(key, ExtraValue::Long(v));
        self
    }

    /// Builder-style insert of a `Double`.
    pub fn with_double(mut self, key: impl Into<String>, v: f64) -> Self {
        self.put(key, ExtraValue::Double(v));
        self
    }

    /// Builder-style insert of a `Str`.
    pub fn with_string(mut self, key: impl Into<String>, v: impl Into<String>) -> Self {
        self.put(key, ExtraValue::Str(v.into()));
        self
    }

    pub fn get(&self, key: &str) -> Option<&ExtraValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ExtraValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_compare_by_bits() {
        assert_eq!(ExtraValue::Double(f64::NAN), ExtraValue::Double(f64::NAN));
        assert_ne!(ExtraValue::Double(0.0), ExtraValue::Double(-0.0));
        assert_ne!(ExtraValue::Int(1), ExtraValue::Long(1));
    }

    #[test]
    fn iteration_is_key_ordered() {
        let extras = Extras::new()
            .with_string("zeta", "z")
            .with_int("alpha", 1)
            .with_long("mid", 2);
        let keys: Vec<&str> = extras.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["alpha", "mid", "zeta"]);
    }
}
