//! Error types for message admission
//!
//! Schema failures are reported before anything touches the disk, so a
//! rejected message is never partially stored.

use thiserror::Error;

/// Rejection of a message by the schema registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaError {
    #[error("Message has no 'type' field")]
    MissingType,

    #[error("Unknown message type: {message_type}")]
    UnknownType { message_type: String },

    #[error("Schema for '{expected}' cannot coerce message of type '{found}'")]
    TypeMismatch { expected: String, found: String },

    #[error("Message '{message_type}' is missing required field '{field}'")]
    MissingField { message_type: String, field: String },

    #[error("Message '{message_type}' has unexpected field '{field}'")]
    UnknownField { message_type: String, field: String },

    #[error("Message '{message_type}' field '{path}': expected {expected}, got {found}")]
    InvalidField {
        message_type: String,
        path: String,
        expected: &'static str,
        found: &'static str,
    },
}
