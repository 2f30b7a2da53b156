//! Message Store: durable, ordered queue of outbound messages
//!
//! Records live in numbered shard directories (see [`crate::layout`]).
//! Lifecycle flags are part of the filename, so reclassifying a record is
//! a single rename. New records are written to a temp file and renamed into
//! place, so a crash leaves at most a stray `.tmp` file that every
//! enumeration ignores.
//!
//! Delivery state is two counters kept in the metadata collaborator:
//! - `sequence`: positions the peer has cumulatively acknowledged.
//! - `pending_offset`: unflagged resident records before the next one to
//!   send.
//!
//! HELD and BROKEN records never count toward `pending_offset` and are
//! never delivered. Reads that discover a corrupt record quarantine it as
//! BROKEN instead of failing; only filesystem errors propagate.

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::layout::{RecordEntry, RecordFlags, RecordKey, ShardLayout};
use crate::metadata::{MetadataError, MetadataStore};
use crate::reconcile::{reconcile, Outcome, Reconciliation};
use crate::record::{self, DecodeError, EncodeError, RecordFrame};
use outbox_types::errors::SchemaError;
use outbox_types::ids::MessageId;
use outbox_types::message::{Message, API_KEY};
use outbox_types::schema::{MessageSchema, SchemaRegistry};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const ACCEPTED_TYPES_KEY: &str = "accepted-types";
pub const SEQUENCE_KEY: &str = "sequence";
pub const PENDING_OFFSET_KEY: &str = "pending_offset";
pub const SERVER_SEQUENCE_KEY: &str = "server_sequence";
pub const SERVER_UUID_KEY: &str = "server_uuid";
pub const EXCHANGE_TOKEN_KEY: &str = "exchange_token";

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),
}

// ── Records ─────────────────────────────────────────────────────────

/// A decoded record.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: MessageId,
    pub key: RecordKey,
    pub written_at: i64,
    pub message: Message,
}

/// Diagnostic view of one record, decoded without side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordReport {
    pub entry: RecordEntry,
    pub decoded: Result<StoredRecord, DecodeError>,
}

/// What `reprocess_holding` changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReprocessSummary {
    pub held: usize,
    pub unheld: usize,
    pub quarantined: usize,
}

/// First phase of a read: what to do with each scanned record.
enum Classified {
    Deliver(StoredRecord),
    Hold(RecordEntry),
    Quarantine(RecordEntry, DecodeError),
}

enum HoldingAction {
    Hold(RecordEntry),
    Unhold(RecordEntry),
    Quarantine {
        entry: RecordEntry,
        error: DecodeError,
        before_pointer: bool,
    },
}

// ── Message Store ───────────────────────────────────────────────────

/// Durable outbound message queue for a single producer and a single
/// exchange loop.
pub struct MessageStore {
    config: StoreConfig,
    layout: ShardLayout,
    schemas: SchemaRegistry,
    metadata: Box<dyn MetadataStore>,
    clock: Arc<dyn Clock>,
}

impl MessageStore {
    /// Open (or create) a store using the wall clock.
    pub fn open(
        config: StoreConfig,
        metadata: Box<dyn MetadataStore>,
    ) -> Result<Self, StoreError> {
        Self::with_clock(config, metadata, Arc::new(SystemClock))
    }

    /// Open (or create) a store with an injected clock.
    pub fn with_clock(
        config: StoreConfig,
        metadata: Box<dyn MetadataStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.dir)?;
        let layout = ShardLayout::new(&config.dir, config.shard_capacity);
        let store = Self {
            config,
            layout,
            schemas: SchemaRegistry::new(),
            metadata,
            clock,
        };
        info!(
            dir = %store.config.dir.display(),
            shard_capacity = store.config.shard_capacity,
            sequence = store.get_sequence(),
            pending_offset = store.get_pending_offset(),
            "Message store opened"
        );
        Ok(store)
    }

    /// Replace the schema registry wholesale.
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    /// Register the schema applied to messages of its type.
    pub fn add_schema(&mut self, schema: MessageSchema) {
        self.schemas.register(schema);
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn metadata(&self) -> &dyn MetadataStore {
        self.metadata.as_ref()
    }

    /// Flush session state to stable storage.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        self.metadata.commit()?;
        Ok(())
    }

    // ── Session State ───────────────────────────────────────────────

    fn get_u64(&self, key: &str) -> u64 {
        self.metadata
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
    }

    fn set_optional_string(&mut self, key: &str, value: Option<&str>) {
        match value {
            Some(v) => self.metadata.set(key, JsonValue::from(v)),
            None => self.metadata.remove(key),
        }
    }

    /// Delivery positions the peer has acknowledged.
    pub fn get_sequence(&self) -> u64 {
        self.get_u64(SEQUENCE_KEY)
    }

    pub fn set_sequence(&mut self, number: u64) {
        self.metadata.set(SEQUENCE_KEY, JsonValue::from(number));
    }

    /// Next sequence we will ask the peer to send us.
    pub fn get_server_sequence(&self) -> u64 {
        self.get_u64(SERVER_SEQUENCE_KEY)
    }

    pub fn set_server_sequence(&mut self, number: u64) {
        self.metadata.set(SERVER_SEQUENCE_KEY, JsonValue::from(number));
    }

    pub fn get_pending_offset(&self) -> u64 {
        self.get_u64(PENDING_OFFSET_KEY)
    }

    pub fn set_pending_offset(&mut self, offset: u64) {
        self.metadata.set(PENDING_OFFSET_KEY, JsonValue::from(offset));
    }

    pub fn add_pending_offset(&mut self, delta: u64) {
        let offset = self.get_pending_offset().saturating_add(delta);
        self.set_pending_offset(offset);
    }

    pub fn get_server_uuid(&self) -> Option<String> {
        self.get_string(SERVER_UUID_KEY)
    }

    pub fn set_server_uuid(&mut self, uuid: Option<&str>) {
        self.set_optional_string(SERVER_UUID_KEY, uuid);
    }

    /// Authentication token for the next exchange.
    pub fn get_exchange_token(&self) -> Option<String> {
        self.get_string(EXCHANGE_TOKEN_KEY)
    }

    pub fn set_exchange_token(&mut self, token: Option<&str>) {
        self.set_optional_string(EXCHANGE_TOKEN_KEY, token);
    }

    /// Accepted message types, sorted.
    pub fn get_accepted_types(&self) -> Vec<String> {
        self.metadata
            .get(ACCEPTED_TYPES_KEY)
            .and_then(|v| serde_json::from_value::<Vec<String>>(v).ok())
            .unwrap_or_default()
    }

    pub fn accepts(&self, message_type: &str) -> bool {
        self.get_accepted_types().iter().any(|t| t == message_type)
    }

    fn accepted_set(&self) -> BTreeSet<String> {
        self.get_accepted_types().into_iter().collect()
    }

    /// Replace the set of types the peer accepts, then re-evaluate which
    /// records are held.
    pub fn set_accepted_types<I, S>(&mut self, types: I) -> Result<ReprocessSummary, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let types: BTreeSet<String> = types.into_iter().map(Into::into).collect();
        let types: Vec<String> = types.into_iter().collect();
        info!(accepted_types = ?types, "Accepted message types changed");
        self.metadata
            .set(ACCEPTED_TYPES_KEY, JsonValue::from(types));
        self.reprocess_holding()
    }

    // ── Writing ─────────────────────────────────────────────────────

    /// Validate, stamp and persist a message. Returns its id.
    ///
    /// Messages of a type the peer does not accept are stored HELD.
    pub fn add(&mut self, message: Message) -> Result<MessageId, StoreError> {
        let mut message = self.schemas.coerce(message)?;
        if !message.contains_key(API_KEY) {
            message.insert(API_KEY, self.config.api.clone());
        }

        let written_at = self.clock.now_nanos();
        let id = MessageId::at_unix_nanos(written_at);
        let frame = RecordFrame::new(id, written_at, &message)?;
        let flags = if self.accepts(&frame.message_type) {
            RecordFlags::NONE
        } else {
            RecordFlags::HELD
        };

        let key = self.layout.next_key()?;
        self.write_record(key, flags, &frame.to_bytes())?;

        debug!(
            %id,
            %key,
            message_type = %frame.message_type,
            held = flags.held,
            "Message added"
        );
        Ok(id)
    }

    /// Write through a temp file, then rename into place.
    fn write_record(&self, key: RecordKey, flags: RecordFlags, data: &[u8]) -> io::Result<()> {
        let tmp_path = self.layout.tmp_path(key);
        let result = (|| {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            if self.config.sync_writes {
                file.sync_all()?;
            }
            fs::rename(&tmp_path, self.layout.record_path(key, flags))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }

    // ── Reading ─────────────────────────────────────────────────────

    fn load(&self, entry: &RecordEntry) -> io::Result<Result<StoredRecord, DecodeError>> {
        let data = fs::read(&entry.path)?;
        Ok(record::decode(&data).map(|(frame, message)| StoredRecord {
            id: frame.id,
            key: entry.key,
            written_at: frame.written_at,
            message,
        }))
    }

    fn quarantine(&self, entry: &RecordEntry, error: &DecodeError) -> io::Result<()> {
        warn!(
            key = %entry.key,
            path = %entry.path.display(),
            error = %error,
            "Quarantining undecodable record"
        );
        self.layout.set_flags(entry, entry.flags.with_broken(true))?;
        Ok(())
    }

    /// Pending records in delivery order, up to `limit`.
    ///
    /// Records found undecodable are flagged BROKEN and records whose type
    /// is no longer accepted are flagged HELD; neither consumes a slot.
    pub fn get_pending_records(
        &mut self,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let offset = usize::try_from(self.get_pending_offset()).unwrap_or(usize::MAX);
        let accepted = self.accepted_set();

        // Classify first, then apply flag changes.
        let mut plan = Vec::new();
        let mut delivered = 0usize;
        let candidates = self
            .layout
            .walk()?
            .into_iter()
            .filter(|e| e.flags.is_unflagged())
            .skip(offset);
        for entry in candidates {
            if limit.is_some_and(|max| delivered >= max) {
                break;
            }
            match self.load(&entry)? {
                Err(error) => plan.push(Classified::Quarantine(entry, error)),
                Ok(record) => {
                    let accepted_type = record
                        .message
                        .message_type()
                        .is_some_and(|t| accepted.contains(t));
                    if accepted_type {
                        delivered += 1;
                        plan.push(Classified::Deliver(record));
                    } else {
                        plan.push(Classified::Hold(entry));
                    }
                }
            }
        }

        let mut records = Vec::with_capacity(delivered);
        for item in plan {
            match item {
                Classified::Deliver(record) => records.push(record),
                Classified::Hold(entry) => {
                    debug!(key = %entry.key, "Holding record of unaccepted type");
                    self.layout.set_flags(&entry, entry.flags.with_held(true))?;
                }
                Classified::Quarantine(entry, error) => self.quarantine(&entry, &error)?,
            }
        }
        Ok(records)
    }

    /// Pending messages in delivery order, up to `limit`.
    pub fn get_pending(&mut self, limit: Option<usize>) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .get_pending_records(limit)?
            .into_iter()
            .map(|r| r.message)
            .collect())
    }

    /// Unflagged records currently resident.
    pub fn buffered_count(&self) -> Result<u64, StoreError> {
        Ok(self
            .layout
            .walk()?
            .iter()
            .filter(|e| e.flags.is_unflagged())
            .count() as u64)
    }

    /// Unflagged records at or after the pending offset.
    pub fn count_pending(&self) -> Result<u64, StoreError> {
        Ok(self
            .buffered_count()?
            .saturating_sub(self.get_pending_offset()))
    }

    /// Whether `id` is still waiting for delivery: HELD, or unflagged and
    /// at/after the pending offset.
    pub fn is_pending(&mut self, id: MessageId) -> Result<bool, StoreError> {
        let offset = self.get_pending_offset();
        let mut index = 0u64;
        for entry in self.layout.walk()? {
            if entry.flags.broken {
                continue;
            }
            let counted = entry.flags.is_unflagged();
            if entry.flags.held || index >= offset {
                match self.load(&entry)? {
                    Ok(record) if record.id == id => return Ok(true),
                    Ok(_) => {}
                    Err(error) => {
                        // At or after the pointer, so the offset is unaffected.
                        self.quarantine(&entry, &error)?;
                        continue;
                    }
                }
            }
            if counted {
                index += 1;
            }
        }
        Ok(false)
    }

    // ── Holding ─────────────────────────────────────────────────────

    /// Unhold records whose type is now accepted and hold unsent records
    /// whose type no longer is.
    ///
    /// Unheld records are moved to the current write position, keeping
    /// their relative order. Records already before the pending offset are
    /// never held.
    pub fn reprocess_holding(&mut self) -> Result<ReprocessSummary, StoreError> {
        let pending_offset = self.get_pending_offset();
        let accepted = self.accepted_set();

        let mut offset = 0u64;
        let mut actions = Vec::new();
        for entry in self.layout.walk()? {
            if entry.flags.broken {
                continue;
            }
            match self.load(&entry)? {
                Err(error) => {
                    let before_pointer = !entry.flags.held && offset < pending_offset;
                    if !entry.flags.held {
                        offset += 1;
                    }
                    actions.push(HoldingAction::Quarantine {
                        entry,
                        error,
                        before_pointer,
                    });
                }
                Ok(record) => {
                    let accepted_type = record
                        .message
                        .message_type()
                        .is_some_and(|t| accepted.contains(t));
                    if entry.flags.held {
                        if accepted_type {
                            actions.push(HoldingAction::Unhold(entry));
                        }
                    } else {
                        if !accepted_type && offset >= pending_offset {
                            actions.push(HoldingAction::Hold(entry));
                        }
                        offset += 1;
                    }
                }
            }
        }

        let mut summary = ReprocessSummary::default();
        let mut lost_before_pointer = 0u64;
        for action in actions {
            match action {
                HoldingAction::Hold(entry) => {
                    debug!(key = %entry.key, "Holding record of unaccepted type");
                    self.layout.set_flags(&entry, entry.flags.with_held(true))?;
                    summary.held += 1;
                }
                HoldingAction::Unhold(entry) => {
                    let key = self.layout.next_key()?;
                    let target = self.layout.record_path(key, entry.flags.with_held(false));
                    fs::rename(&entry.path, &target)?;
                    debug!(from = %entry.key, to = %key, "Unheld record");
                    summary.unheld += 1;
                }
                HoldingAction::Quarantine {
                    entry,
                    error,
                    before_pointer,
                } => {
                    self.quarantine(&entry, &error)?;
                    if before_pointer {
                        lost_before_pointer += 1;
                    }
                    summary.quarantined += 1;
                }
            }
        }

        // Keep the pointer on the same next record.
        if lost_before_pointer > 0 {
            self.set_pending_offset(pending_offset.saturating_sub(lost_before_pointer));
        }

        if summary != ReprocessSummary::default() {
            info!(
                held = summary.held,
                unheld = summary.unheld,
                quarantined = summary.quarantined,
                "Reprocessed held messages"
            );
        }
        Ok(summary)
    }

    // ── Deletion ────────────────────────────────────────────────────

    /// Remove every unflagged record before the pending offset, and any
    /// shard left empty. The offset then points at the same next record,
    /// now the first unflagged one. Returns the number of records removed.
    ///
    /// The reset offset is committed before anything is unlinked: a crash
    /// part way through can only cause resends, never skip unsent records.
    pub fn delete_old_messages(&mut self) -> Result<usize, StoreError> {
        let offset = self.get_pending_offset();
        if offset == 0 {
            return Ok(0);
        }
        let take = usize::try_from(offset).unwrap_or(usize::MAX);
        let victims: Vec<RecordEntry> = self
            .layout
            .walk()?
            .into_iter()
            .filter(|e| e.flags.is_unflagged())
            .take(take)
            .collect();

        self.set_pending_offset(0);
        self.metadata.commit()?;

        let mut removed = 0usize;
        let mut shards = BTreeSet::new();
        for entry in &victims {
            if let Err(e) = fs::remove_file(&entry.path) {
                // Survivors stay acknowledged.
                let survivors = (victims.len() - removed) as u64;
                self.set_pending_offset(survivors);
                self.metadata.commit()?;
                return Err(e.into());
            }
            removed += 1;
            shards.insert(entry.key.shard);
        }

        for shard in shards {
            if self.layout.remove_shard_if_empty(shard)? {
                debug!(shard, "Removed empty shard");
            }
        }

        info!(removed, "Deleted acknowledged messages");
        Ok(removed)
    }

    /// Remove every record regardless of flags and reset the offset.
    pub fn delete_all_messages(&mut self) -> Result<(), StoreError> {
        self.set_pending_offset(0);
        self.metadata.commit()?;
        for shard in self.layout.shards()? {
            fs::remove_dir_all(self.layout.shard_path(shard))?;
        }
        info!("Deleted all messages");
        Ok(())
    }

    // ── Reconciliation ──────────────────────────────────────────────

    /// Store the result of a reconciliation.
    pub fn apply_reconciliation(&mut self, reconciliation: &Reconciliation) {
        self.set_sequence(reconciliation.sequence);
        self.set_pending_offset(reconciliation.pending_offset);
    }

    /// Reconcile with the peer's next-expected sequence and apply it.
    pub fn got_next_expected(&mut self, peer_next_expected: u64) -> Result<Reconciliation, StoreError> {
        let sequence = self.get_sequence();
        let pending_offset = self.get_pending_offset();
        let buffered = self.buffered_count()?;
        let result = reconcile(sequence, pending_offset, buffered, peer_next_expected);

        match result.outcome {
            Outcome::Unchanged | Outcome::Advanced { .. } => {}
            Outcome::Overshot { excess, .. } => warn!(
                sequence,
                peer_next_expected,
                excess,
                "Peer acknowledged more messages than were sent"
            ),
            Outcome::Rewound { resend } => warn!(
                sequence,
                peer_next_expected,
                resend,
                "Peer lost messages; resending"
            ),
            Outcome::Ancient { unrecoverable } => warn!(
                sequence,
                peer_next_expected,
                unrecoverable,
                "Peer lost messages older than the buffer"
            ),
        }

        self.apply_reconciliation(&result);
        Ok(result)
    }

    // ── Diagnostics ─────────────────────────────────────────────────

    /// Every resident record, including HELD and BROKEN, in ordinal order.
    pub fn list_records(&self) -> Result<Vec<RecordEntry>, StoreError> {
        Ok(self.layout.walk()?)
    }

    /// Decode one record without reclassifying it.
    pub fn read_record(&self, key: RecordKey) -> Result<Option<RecordReport>, StoreError> {
        let records = match self.layout.records_in(key.shard) {
            Ok(records) => records,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(entry) = records.into_iter().find(|e| e.key == key) else {
            return Ok(None);
        };
        let decoded = self.load(&entry)?;
        Ok(Some(RecordReport { entry, decoded }))
    }
}

// ── Tests ───────────────────────────────────────────────────────────
