//! Message model
//!
//! A message is a mapping from field names to nested values. Field maps are
//! `BTreeMap`s so that serialization is deterministic: the same message
//! always encodes to the same bytes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key holding the message type name.
pub const TYPE_KEY: &str = "type";
/// Key holding the server API version the message was produced for.
pub const API_KEY: &str = "api";
/// Key holding the producer's timestamp, when it sets one.
pub const TIMESTAMP_KEY: &str = "timestamp";

/// A field value: scalars, nested mappings and sequences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the variant, used in schema diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
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

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

/// An outbound message. Always carries a `type` once built through
/// [`Message::new`]; the store fills in `api` when it is absent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Message(BTreeMap<String, Value>);

impl Message {
    /// Create a message of the given type with no other fields.
    pub fn new(message_type: impl Into<String>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(TYPE_KEY.to_string(), Value::Str(message_type.into()));
        Self(fields)
    }

    /// Wrap an existing field map as-is. The map may lack a `type`; such a
    /// message is rejected on admission.
    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        Self(fields)
    }

    /// Builder-style field setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn message_type(&self) -> Option<&str> {
        self.0.get(TYPE_KEY).and_then(Value::as_str)
    }

    pub fn api(&self) -> Option<&str> {
        self.0.get(API_KEY).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.0
    }

    pub fn into_fields(self) -> BTreeMap<String, Value> {
        self.0
    }
}
