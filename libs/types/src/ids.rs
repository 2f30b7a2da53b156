//! Identifier types for queued messages
//!
//! Message identifiers use UUID v7 so that ids assigned by one store are
//! time-sortable and never collide across store instances.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::{NoContext, Timestamp, Uuid};

/// Store-assigned identifier of an accepted message.
///
/// The id is written into the record itself, so it stays stable while the
/// record is renamed for flag changes or moved when it is unheld.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new MessageId with current timestamp
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Create a MessageId whose time component is `nanos` since the Unix
    /// epoch, so ids follow the store's clock. Times before the epoch clamp
    /// to it.
    pub fn at_unix_nanos(nanos: i64) -> Self {
        let nanos = u64::try_from(nanos).unwrap_or(0);
        let ts = Timestamp::from_unix(
            NoContext,
            nanos / 1_000_000_000,
            (nanos % 1_000_000_000) as u32,
        );
        Self(Uuid::new_v7(ts))
    }

    /// Unix time in milliseconds encoded in the id.
    pub fn unix_millis(&self) -> Option<u64> {
        self.0.get_timestamp().map(|ts| {
            let (secs, nanos) = ts.to_unix();
            secs * 1_000 + u64::from(nanos) / 1_000_000
        })
    }

    /// Create from existing UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Rebuild an id from its 16 raw bytes, as stored in a record frame.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get inner UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
