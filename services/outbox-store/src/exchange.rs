//! Exchange Driver: one send/acknowledge round with the peer
//!
//! Pulls a batch of pending messages, hands it to a [`Transport`], and feeds
//! the peer's cumulative acknowledgement back into the store.
//!
//! Deletion of acknowledged records waits for a streak of successful
//! exchanges. A record acknowledged in one round is deleted no earlier than
//! the next successful round, so a single bogus acknowledgement cannot
//! destroy messages the peer never stored.

use crate::config::ExchangeConfig;
use crate::reconcile::Reconciliation;
use crate::store::{MessageStore, StoreError};
use outbox_types::message::Message;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Peer rejected exchange: {0}")]
    Rejected(String),
}

#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

// ── Wire Types ──────────────────────────────────────────────────────

/// What one exchange sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    /// Sequence number of the first message in `messages`.
    pub sequence: u64,
    /// Next server message we expect.
    pub server_sequence: u64,
    pub exchange_token: Option<String>,
    pub messages: Vec<Message>,
}

/// What the peer answers. Absent fields mean "no change".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeResponse {
    /// Cumulative acknowledgement: next sequence the peer expects.
    pub next_expected_sequence: Option<u64>,
    /// New accepted-types set, when the peer changed it.
    pub accepted_types: Option<Vec<String>>,
    pub server_uuid: Option<String>,
    pub next_exchange_token: Option<String>,
    /// Server messages delivered in this response.
    pub server_message_count: u64,
}

/// Carries exchange requests to the peer.
pub trait Transport {
    fn exchange(&mut self, request: &ExchangeRequest) -> Result<ExchangeResponse, TransportError>;
}

/// Summary of a successful exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeReport {
    pub sent: usize,
    pub deleted: usize,
    /// `None` when the peer sent no acknowledgement.
    pub reconciliation: Option<Reconciliation>,
}

// ── Driver ──────────────────────────────────────────────────────────

pub struct ExchangeDriver<T: Transport> {
    store: MessageStore,
    transport: T,
    config: ExchangeConfig,
    streak: u32,
}

impl<T: Transport> ExchangeDriver<T> {
    pub fn new(store: MessageStore, transport: T, config: ExchangeConfig) -> Self {
        Self {
            store,
            transport,
            config,
            streak: 0,
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut MessageStore {
        &mut self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consecutive successful exchanges so far.
    pub fn streak(&self) -> u32 {
        self.streak
    }

    pub fn into_parts(self) -> (MessageStore, T) {
        (self.store, self.transport)
    }

    /// Run one exchange round.
    pub fn exchange_once(&mut self) -> Result<ExchangeReport, ExchangeError> {
        let messages = self.store.get_pending(Some(self.config.batch_size))?;
        let request = ExchangeRequest {
            sequence: self.store.get_sequence(),
            server_sequence: self.store.get_server_sequence(),
            exchange_token: self.store.get_exchange_token(),
            messages,
        };
        let sent = request.messages.len();
        debug!(sequence = request.sequence, sent, "Starting exchange");

        let response = match self.transport.exchange(&request) {
            Ok(response) => response,
            Err(e) => {
                self.streak = 0;
                error!(error = %e, sequence = request.sequence, "Exchange failed");
                return Err(e.into());
            }
        };
        self.streak = self.streak.saturating_add(1);

        if let Some(uuid) = response.server_uuid.as_deref() {
            let previous = self.store.get_server_uuid();
            if previous.as_deref() != Some(uuid) {
                info!(?previous, server_uuid = uuid, "Server UUID changed");
                self.store.set_server_uuid(Some(uuid));
            }
        }

        // Records before the current offset were acknowledged by an
        // earlier round; only drop them once this round confirms progress.
        let advanced = response
            .next_expected_sequence
            .is_some_and(|next| next > request.sequence);
        let deleted = if advanced && self.streak >= self.config.deletion_streak {
            self.store.delete_old_messages()?
        } else {
            0
        };

        let reconciliation = match response.next_expected_sequence {
            Some(next) => Some(self.store.got_next_expected(next)?),
            None => {
                warn!(sequence = request.sequence, "Exchange response carried no acknowledgement");
                None
            }
        };

        if let Some(types) = response.accepted_types {
            self.store.set_accepted_types(types)?;
        }
        self.store
            .set_exchange_token(response.next_exchange_token.as_deref());
        if response.server_message_count > 0 {
            let next = self
                .store
                .get_server_sequence()
                .saturating_add(response.server_message_count);
            self.store.set_server_sequence(next);
        }
        self.store.commit()?;

        debug!(
            sent,
            deleted,
            sequence = self.store.get_sequence(),
            pending_offset = self.store.get_pending_offset(),
            streak = self.streak,
            "Exchange completed"
        );
        Ok(ExchangeReport {
            sent,
            deleted,
            reconciliation,
        })
    }
}
