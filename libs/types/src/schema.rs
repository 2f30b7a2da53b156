//! Message schemas and the schema registry
//!
//! Each message type registers a [`MessageSchema`] describing its fields.
//! Coercion normalizes compatible representations (integers given for a
//! float field, UTF-8 bytes given for a text field) and rejects anything
//! else, so the store only ever persists well-formed messages.

use crate::errors::SchemaError;
use crate::message::{Message, Value, API_KEY, TIMESTAMP_KEY, TYPE_KEY};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Shape of a single field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldSchema {
    /// Accept any value unchanged.
    Any,
    Bool,
    Int,
    /// Floats; integers are widened.
    Float,
    /// Text; valid UTF-8 bytes are converted.
    Unicode,
    Bytes,
    List(Box<FieldSchema>),
    /// Mapping with arbitrary string keys and uniform values.
    Map(Box<FieldSchema>),
    /// Mapping with a fixed set of keys.
    Record {
        fields: BTreeMap<String, FieldSchema>,
        optional: BTreeSet<String>,
    },
}

impl FieldSchema {
    pub fn list(inner: FieldSchema) -> Self {
        FieldSchema::List(Box::new(inner))
    }

    pub fn map(inner: FieldSchema) -> Self {
        FieldSchema::Map(Box::new(inner))
    }

    /// Nested record where every listed field is required.
    pub fn record<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, FieldSchema)>,
        K: Into<String>,
    {
        FieldSchema::Record {
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            optional: BTreeSet::new(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldSchema::Any => "any",
            FieldSchema::Bool => "bool",
            FieldSchema::Int => "int",
            FieldSchema::Float => "float",
            FieldSchema::Unicode => "string",
            FieldSchema::Bytes => "bytes",
            FieldSchema::List(_) => "list",
            FieldSchema::Map(_) | FieldSchema::Record { .. } => "map",
        }
    }

    /// Coerce `value` to this shape. `path` names the field for errors.
    pub fn coerce(&self, message_type: &str, path: &str, value: Value) -> Result<Value, SchemaError> {
        let invalid = |found: &Value| SchemaError::InvalidField {
            message_type: message_type.to_string(),
            path: path.to_string(),
            expected: self.name(),
            found: found.kind(),
        };

        match (self, value) {
            (FieldSchema::Any, v) => Ok(v),
            (FieldSchema::Bool, v @ Value::Bool(_)) => Ok(v),
            (FieldSchema::Int, v @ Value::Int(_)) => Ok(v),
            (FieldSchema::Float, v @ Value::Float(_)) => Ok(v),
            (FieldSchema::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (FieldSchema::Unicode, v @ Value::Str(_)) => Ok(v),
            (FieldSchema::Unicode, Value::Bytes(bytes)) => match String::from_utf8(bytes) {
                Ok(s) => Ok(Value::Str(s)),
                Err(e) => Err(invalid(&Value::Bytes(e.into_bytes()))),
            },
            (FieldSchema::Bytes, v @ Value::Bytes(_)) => Ok(v),
            (FieldSchema::List(inner), Value::List(items)) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| inner.coerce(message_type, &format!("{}[{}]", path, i), item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::List),
            (FieldSchema::Map(inner), Value::Map(entries)) => entries
                .into_iter()
                .map(|(k, v)| {
                    let child = format!("{}.{}", path, k);
                    inner.coerce(message_type, &child, v).map(|v| (k, v))
                })
                .collect::<Result<BTreeMap<_, _>, _>>()
                .map(Value::Map),
            (FieldSchema::Record { fields, optional }, Value::Map(entries)) => {
                coerce_fields(message_type, path, fields, optional, &[], entries).map(Value::Map)
            }
            (_, other) => Err(invalid(&other)),
        }
    }
}

/// Shared key-dictionary coercion for top-level messages and nested records.
fn coerce_fields(
    message_type: &str,
    prefix: &str,
    fields: &BTreeMap<String, FieldSchema>,
    optional: &BTreeSet<String>,
    implicit: &[&str],
    mut entries: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, Value>, SchemaError> {
    let qualify = |name: &str| {
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", prefix, name)
        }
    };

    if let Some(unknown) = entries
        .keys()
        .find(|k| !fields.contains_key(*k) && !implicit.contains(&k.as_str()))
    {
        return Err(SchemaError::UnknownField {
            message_type: message_type.to_string(),
            field: qualify(unknown),
        });
    }

    let mut out = BTreeMap::new();
    for (name, schema) in fields {
        match entries.remove(name) {
            Some(value) => {
                out.insert(name.clone(), schema.coerce(message_type, &qualify(name), value)?);
            }
            None if optional.contains(name) => {}
            None => {
                return Err(SchemaError::MissingField {
                    message_type: message_type.to_string(),
                    field: qualify(name),
                })
            }
        }
    }
    // Whatever remains is one of the implicit keys.
    out.extend(entries);
    Ok(out)
}

/// Schema of one message type.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSchema {
    message_type: String,
    fields: BTreeMap<String, FieldSchema>,
    optional: BTreeSet<String>,
}

impl MessageSchema {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            fields: BTreeMap::new(),
            optional: BTreeSet::new(),
        }
    }

    /// Add a required field.
    pub fn field(mut self, name: impl Into<String>, schema: FieldSchema) -> Self {
        self.fields.insert(name.into(), schema);
        self
    }

    /// Add a field that may be omitted.
    pub fn optional(mut self, name: impl Into<String>, schema: FieldSchema) -> Self {
        let name = name.into();
        self.optional.insert(name.clone());
        self.fields.insert(name, schema);
        self
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Validate and normalize `message`.
    ///
    /// `type`, `api` and `timestamp` are always allowed; `api` must be text
    /// and `timestamp` a number when present.
    pub fn coerce(&self, message: Message) -> Result<Message, SchemaError> {
        match message.message_type() {
            None => return Err(SchemaError::MissingType),
            Some(found) if found != self.message_type => {
                return Err(SchemaError::TypeMismatch {
                    expected: self.message_type.clone(),
                    found: found.to_string(),
                })
            }
            Some(_) => {}
        }

        let mut fields = coerce_fields(
            &self.message_type,
            "",
            &self.fields,
            &self.optional,
            &[TYPE_KEY, API_KEY, TIMESTAMP_KEY],
            message.into_fields(),
        )?;

        if let Some(api) = fields.remove(API_KEY) {
            let api = FieldSchema::Unicode.coerce(&self.message_type, API_KEY, api)?;
            fields.insert(API_KEY.to_string(), api);
        }
        if let Some(ts) = fields.remove(TIMESTAMP_KEY) {
            let ts = FieldSchema::Float.coerce(&self.message_type, TIMESTAMP_KEY, ts)?;
            fields.insert(TIMESTAMP_KEY.to_string(), ts);
        }

        Ok(Message::from_fields(fields))
    }
}

/// Lookup table from message type to schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, MessageSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the schema for its message type.
    pub fn register(&mut self, schema: MessageSchema) {
        self.schemas.insert(schema.message_type.clone(), schema);
    }

    pub fn get(&self, message_type: &str) -> Option<&MessageSchema> {
        self.schemas.get(message_type)
    }

    pub fn contains(&self, message_type: &str) -> bool {
        self.schemas.contains_key(message_type)
    }

    /// Coerce a message with the schema registered for its type.
    pub fn coerce(&self, message: Message) -> Result<Message, SchemaError> {
        let message_type = message.message_type().ok_or(SchemaError::MissingType)?;
        let schema = self
            .schemas
            .get(message_type)
            .ok_or_else(|| SchemaError::UnknownType {
                message_type: message_type.to_string(),
            })?;
        schema.coerce(message)
    }
}

impl FromIterator<MessageSchema> for SchemaRegistry {
    fn from_iter<T: IntoIterator<Item = MessageSchema>>(iter: T) -> Self {
        let mut registry = Self::new();
        for schema in iter {
            registry.register(schema);
        }
        registry
    }
}
