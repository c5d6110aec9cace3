use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::Currency;
use crate::wallet::WalletId;

/// Dense, store-assigned ledger entry identifier.
pub type EntryId = i64;

/// Which storage tier an entry currently lives in. Entries move
/// hot -> warm -> cold; they are never copied back, only forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Hot,
    Warm,
    Cold,
}

/// `Debit`/`Credit` are ordinary signed entries; `Ledger` marks a
/// synthetic checkpoint row the archive pass writes to carry forward a
/// zero-sum balance summary once the originals are archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Debit,
    Credit,
    Ledger,
}

/// `HOLD` -> one of `{SETTLED, RELEASED, CANCELLED}`. `Refunded` marks an
/// entry whose group has since been at least partially reversed by a
/// refund. Entries never change their own `status` field once written
/// (rows are append-only); `Settled`/`Released`/`Cancelled` entries are
/// brand new rows emitted alongside the original `Hold` row, not that
/// row mutated in place. `Refunded` is likewise written directly at
/// refund time rather than reached by transitioning any prior row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryStatus {
    Hold,
    Settled,
    Released,
    Cancelled,
    Refunded,
}

impl EntryStatus {
    /// Whether `next` is a legal status for a *newly appended* entry that
    /// offsets/settles an existing `Hold` row. Since rows never mutate,
    /// this governs what the group engine is allowed to emit, not an
    /// in-place state change.
    pub fn can_transition_to(self, next: EntryStatus) -> bool {
        matches!(
            (self, next),
            (EntryStatus::Hold, EntryStatus::Settled)
                | (EntryStatus::Hold, EntryStatus::Released)
                | (EntryStatus::Hold, EntryStatus::Cancelled)
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryStatus::Hold => "HOLD",
            EntryStatus::Settled => "SETTLED",
            EntryStatus::Released => "RELEASED",
            EntryStatus::Cancelled => "CANCELLED",
            EntryStatus::Refunded => "REFUNDED",
        };
        write!(f, "{s}")
    }
}

/// Who caused an entry or refund to exist, kept for the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitiatorKind {
    System,
    User,
    Merchant,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub wallet_id: WalletId,
    pub group_id: Uuid,
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub amount_minor_units: i64,
    pub currency: Currency,
    pub tier: Tier,
    pub initiator_kind: InitiatorKind,
    pub initiator_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Set when the row is copied into warm (the date of that daily
    /// snapshot) or, for a synthetic checkpoint, the archive cutoff date
    /// it summarizes. Always `None` while the row lives in hot.
    pub snapshot_date: Option<NaiveDate>,
}

pub struct NewEntry {
    pub wallet_id: WalletId,
    pub group_id: Uuid,
    pub entry_type: EntryType,
    pub status: EntryStatus,
    pub amount_minor_units: i64,
    pub currency: Currency,
    pub initiator_kind: InitiatorKind,
    pub initiator_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_transitions_are_exactly_the_three_terminal_states() {
        assert!(EntryStatus::Hold.can_transition_to(EntryStatus::Settled));
        assert!(EntryStatus::Hold.can_transition_to(EntryStatus::Released));
        assert!(EntryStatus::Hold.can_transition_to(EntryStatus::Cancelled));
        assert!(!EntryStatus::Hold.can_transition_to(EntryStatus::Hold));
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!EntryStatus::Settled.can_transition_to(EntryStatus::Released));
        assert!(!EntryStatus::Released.can_transition_to(EntryStatus::Settled));
        assert!(!EntryStatus::Cancelled.can_transition_to(EntryStatus::Settled));
    }
}
