/*!
 * Core data types for DomoFlow.
 *
 * This module defines the value model shared by every device layer: the
 * dynamically typed [`Value`] carried by device attributes and wire
 * payloads, the [`AttrKind`] naming an attribute's declared base type, and
 * the [`Sid`] identifier used to address and route devices.
 */
use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The stable unique identifier of a device instance.
///
/// A `Sid` is assigned by the vendor (a MAC-derived id, a Zigbee friendly
/// name, a lamp serial) and never changes for the lifetime of the device.
/// It is the routing key for gateway demultiplexing and watcher reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid(String);

impl Sid {
    /// Create a sid from a string
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_string())
    }

    /// Get the string representation of the sid
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Sid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Sid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The declared base type of a device attribute.
///
/// The kind fixes the attribute's zero value, which drives one-shot write
/// semantics and default query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrKind {
    /// String attribute
    Str,
    /// Integer attribute
    Int,
    /// Boolean attribute
    Bool,
    /// Floating-point attribute
    Float,
    /// List attribute
    List,
    /// Map attribute
    Map,
}

impl AttrKind {
    /// The zero value of this kind: `""`, `0`, `false`, `0.0`, `[]` or `{}`
    pub fn zero(&self) -> Value {
        match self {
            AttrKind::Str => Value::Str(String::new()),
            AttrKind::Int => Value::Int(0),
            AttrKind::Bool => Value::Bool(false),
            AttrKind::Float => Value::Float(0.0),
            AttrKind::List => Value::List(Vec::new()),
            AttrKind::Map => Value::Map(HashMap::new()),
        }
    }
}

/// A dynamically typed value carried by device attributes and vendor
/// payloads.
///
/// Serialized untagged, so vendor JSON maps directly onto values and back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    Str(String),
    /// List of values
    List(Vec<Value>),
    /// Map of string keys to values
    Map(HashMap<String, Value>),
}

impl Value {
    /// Check if the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if the value is its kind's zero value.
    ///
    /// Null, `false`, `0`, `0.0`, the empty string, the empty list and the
    /// empty map are all zero. One-shot attributes accept a write only
    /// while their current value is zero.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::Str(s) => s.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
        }
    }

    /// The kind of this value, or `None` for null
    pub fn kind(&self) -> Option<AttrKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(AttrKind::Bool),
            Value::Int(_) => Some(AttrKind::Int),
            Value::Float(_) => Some(AttrKind::Float),
            Value::Str(_) => Some(AttrKind::Str),
            Value::List(_) => Some(AttrKind::List),
            Value::Map(_) => Some(AttrKind::Map),
        }
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if *f == (*f as i64) as f64 => Some(*f as i64),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get a list value
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Try to get a map value
    pub fn as_map(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i as i64)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f as f64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(l: Vec<Value>) -> Self {
        Value::List(l)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(m: HashMap<String, Value>) -> Self {
        Value::Map(m)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::Float(f) => serde_json::Value::from(f),
            Value::Str(s) => serde_json::Value::String(s),
            Value::List(l) => {
                serde_json::Value::Array(l.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(m) => serde_json::Value::Object(
                m.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// An untyped map of attribute or wire field names to values
pub type ValueMap = HashMap<String, Value>;

/// Convert a JSON object into a [`ValueMap`]; non-object input yields an
/// empty map
pub fn value_map_from_json(v: serde_json::Value) -> ValueMap {
    match v {
        serde_json::Value::Object(o) => o.into_iter().map(|(k, v)| (k, Value::from(v))).collect(),
        _ => ValueMap::new(),
    }
}
