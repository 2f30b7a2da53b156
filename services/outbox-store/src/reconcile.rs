//! Sequence reconciliation
//!
//! Translates the peer's cumulative acknowledgement into new local
//! `(sequence, pending_offset)` state. Pure: no I/O, no store access.
//!
//! ```text
//! buffered:  D E F G H I J
//!
//! sequence 4, offset 0     ^ next to send is D
//! peer expects 9 (+5)  ->  sequence 9, offset 5, next is I
//! peer expects 6 (-3)  ->  sequence 6, offset 2, next is F
//! ```
//!
//! When the peer's report is older than anything still buffered the
//! offset clamps to zero: everything still held is resent and anything
//! older is unrecoverable.

/// Classification of one reconciliation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Peer reported exactly what we already believed.
    Unchanged,
    /// Peer acknowledged `acknowledged` more messages.
    Advanced { acknowledged: u64 },
    /// Peer acknowledged more than we had buffered; the offset was clamped
    /// to "caught up" and `excess` positions were ignored.
    Overshot { acknowledged: u64, excess: u64 },
    /// Peer lost `resend` messages that are still buffered.
    Rewound { resend: u64 },
    /// Peer lost more than we can resend; `unrecoverable` of the lost
    /// messages are gone for good.
    Ancient { unrecoverable: u64 },
}

/// Result of [`reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub sequence: u64,
    pub pending_offset: u64,
    pub outcome: Outcome,
}

impl Reconciliation {
    pub fn as_pair(&self) -> (u64, u64) {
        (self.sequence, self.pending_offset)
    }

    /// True when the peer lost messages we believed delivered.
    pub fn is_regression(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Rewound { .. } | Outcome::Ancient { .. }
        )
    }
}

/// Reconcile local delivery state with the peer's next-expected sequence.
///
/// `buffered_count` is the number of unflagged records currently resident
/// in the store.
pub fn reconcile(
    local_sequence: u64,
    local_pending_offset: u64,
    buffered_count: u64,
    peer_next_expected: u64,
) -> Reconciliation {
    let outcome;
    let pending_offset;

    if peer_next_expected >= local_sequence {
        let delta = peer_next_expected - local_sequence;
        let target = local_pending_offset.saturating_add(delta);
        pending_offset = target.min(buffered_count);
        outcome = if delta == 0 {
            Outcome::Unchanged
        } else if target > buffered_count {
            Outcome::Overshot {
                acknowledged: delta,
                excess: target - buffered_count,
            }
        } else {
            Outcome::Advanced {
                acknowledged: delta,
            }
        };
    } else {
        let lost = local_sequence - peer_next_expected;
        let resendable = local_pending_offset.min(buffered_count);
        if lost > resendable {
            pending_offset = 0;
            outcome = Outcome::Ancient {
                unrecoverable: lost - resendable,
            };
        } else {
            pending_offset = (local_pending_offset - lost).min(buffered_count);
            outcome = Outcome::Rewound { resend: lost };
        }
    }

    Reconciliation {
        sequence: peer_next_expected,
        pending_offset,
        outcome,
    }
}
