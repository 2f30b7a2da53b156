//! Outbound Message Store
//!
//! Durable, ordered queue of messages waiting to be delivered to the
//! management server, plus the arithmetic that keeps local delivery state in
//! step with the server's cumulative acknowledgements.
//!
//! - [`store::MessageStore`]: sharded on-disk records with HELD/BROKEN
//!   lifecycle flags and a pending offset.
//! - [`reconcile::reconcile`]: pure sequence reconciliation.
//! - [`exchange::ExchangeDriver`]: one send/acknowledge round over a
//!   pluggable transport, with delayed deletion.

pub mod clock;
pub mod config;
pub mod exchange;
pub mod layout;
pub mod metadata;
pub mod reconcile;
pub mod record;
pub mod store;

pub use config::{ExchangeConfig, StoreConfig};
pub use reconcile::{reconcile, Outcome, Reconciliation};
pub use store::{MessageStore, StoreError};
