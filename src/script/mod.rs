//! Script-side values and the Lua bridge.
//!
//! [`ScriptValue`] is the closed set of values the marshaling engine
//! produces and consumes. It is deliberately independent of the VM so that
//! conversions can be reasoned about (and tested) without one; [`lua`] moves
//! values between this model and live Lua values.

pub(crate) mod lua;
pub(crate) mod sandbox;
mod tuple;

pub use tuple::{TupleState, TupleValue};

use bytes::Bytes;
use std::collections::BTreeMap;
use std::fmt;

/// Table key. Integer keys sort before string keys.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScriptKey {
    /// Integer key.
    Integer(i64),
    /// String key.
    String(String),
}

impl From<i64> for ScriptKey {
    fn from(i: i64) -> Self {
        ScriptKey::Integer(i)
    }
}

impl From<i32> for ScriptKey {
    fn from(i: i32) -> Self {
        ScriptKey::Integer(i as i64)
    }
}

impl From<&str> for ScriptKey {
    fn from(s: &str) -> Self {
        ScriptKey::String(s.to_string())
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptKey::Integer(i) => write!(f, "{}", i),
            ScriptKey::String(s) => f.write_str(s),
        }
    }
}

/// Script table.
pub type ScriptTable = BTreeMap<ScriptKey, ScriptValue>;

impl From<&str> for ScriptValue {
    fn from(s: &str) -> Self {
        ScriptValue::String(Bytes::copy_from_slice(s.as_bytes()))
    }
}

/// A value on the script side of the boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptValue {
    /// nil
    Nil,
    /// boolean
    Boolean(bool),
    /// integer
    Integer(i64),
    /// float
    Number(f64),
    /// byte string
    String(Bytes),
    /// table
    Table(ScriptTable),
    /// row object
    Tuple(TupleValue),
    /// cursor, by portal name
    Cursor(String),
}

impl ScriptValue {
    /// Creates a string value.
    pub fn string(s: impl Into<String>) -> Self {
        ScriptValue::String(Bytes::from(s.into()))
    }

    /// Creates a table from key/value pairs.
    pub fn table<K: Into<ScriptKey>>(entries: impl IntoIterator<Item = (K, ScriptValue)>) -> Self {
        ScriptValue::Table(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Creates a sequence table with keys 1..=n.
    pub fn sequence(values: impl IntoIterator<Item = ScriptValue>) -> Self {
        ScriptValue::Table(
            values.into_iter().enumerate().map(|(i, v)| (ScriptKey::Integer(i as i64 + 1), v)).collect(),
        )
    }

    /// Lua type name of the value.
    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptValue::Nil => "nil",
            ScriptValue::Boolean(_) => "boolean",
            ScriptValue::Integer(_) | ScriptValue::Number(_) => "number",
            ScriptValue::String(_) => "string",
            ScriptValue::Table(_) => "table",
            ScriptValue::Tuple(_) => "tuple",
            ScriptValue::Cursor(_) => "cursor",
        }
    }

    /// The string contents, when this is a valid UTF-8 string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScriptValue::String(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }

    /// True for nil.
    pub fn is_nil(&self) -> bool {
        matches!(self, ScriptValue::Nil)
    }
}
