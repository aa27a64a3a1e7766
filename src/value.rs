//! Channel value cell.
//!
//! Channels carry either an integer or the null value. Null is a real state
//! (nothing selected, no task running), not an error: combinators forward it
//! and the timeline writer renders it as an empty sample.

use std::fmt;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Value {
    #[default]
    Null,
    Int(i64),
}

impl Value {
    pub fn is_null(self) -> bool {
        matches!(self, Value::Null)
    }

    /// Integer contents, if any.
    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Null => None,
            Value::Int(v) => Some(v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        match v {
            None => Value::Null,
            Some(v) => Value::Int(v),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Int(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_roundtrip() {
        let v = Value::from(42);
        assert_eq!(v.as_int(), Some(42));
        assert!(!v.is_null());
    }

    #[test]
    fn null_renders_empty_of_content() {
        assert_eq!(Value::Null.as_int(), None);
        assert_eq!(Value::Null.to_string(), "null");
        assert_eq!(Value::from(None), Value::Null);
    }
}
