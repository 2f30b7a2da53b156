//! Types library for the durable outbound message queue
//!
//! Defines the message model shared by message producers and the store:
//! what a message is, how it is identified once accepted, and how its
//! fields are validated before admission.
//!
//! # Modules
//! - `ids`: Message identifiers (MessageId)
//! - `message`: Message and field value types
//! - `schema`: Per-type schemas and the schema registry
//! - `errors`: Admission error taxonomy

pub mod ids;
pub mod message;
pub mod schema;
pub mod errors;
