use std::fmt;
use uuid::Uuid;

use crate::entry::EntryId;
use crate::wallet::WalletId;

/// The full error taxonomy surfaced by every engine in this crate.
///
/// Variants are grouped the way callers are expected to handle them: not
/// found vs. bad input vs. a precondition the caller can react to vs. a
/// conflict vs. something the store itself could not do. Engines never
/// collapse these into a single opaque variant — callers that need to
/// distinguish "insufficient funds" from "wallet does not exist" can match
/// on the variant directly.
#[derive(Debug)]
pub enum LedgerError {
    // --- not found ---
    WalletNotFound(WalletId),
    GroupNotFound(Uuid),
    SettlementNotFound(Uuid),
    RefundNotFound(Uuid),
    RefundReserveNotFound(Uuid),
    EntryNotFound(EntryId),

    // --- invalid argument ---
    InvalidAmount,
    InvalidOwnership(String),
    CurrencyMismatch { expected: String, actual: String },

    // --- precondition ---
    InsufficientFunds,
    ReconciliationError(String),
    InvalidStateTransition { from: String, to: String },
    OrderNotSettled,
    /// The order's group is still `IN_PROGRESS` (a HOLD, not yet
    /// settled); spec.md §4.6 directs the caller to cancel the order
    /// instead of requesting a refund against it.
    UseCancelInstead,
    AlreadyRefunded,
    RefundExceedsNet { requested: i64, available: i64 },
    RefundWindowExpired,
    BelowMinimum { amount: i64, minimum: i64 },
    NoUnsettledGroups,

    // --- conflict ---
    IdempotencyConflict(String),
    DoubleSettlement(Uuid),

    // --- internal ---
    StoreUnavailable(String),
    InvariantViolation(String),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WalletNotFound(id) => write!(f, "wallet not found: {id}"),
            Self::GroupNotFound(id) => write!(f, "transaction group not found: {id}"),
            Self::SettlementNotFound(id) => write!(f, "settlement not found: {id}"),
            Self::RefundNotFound(id) => write!(f, "refund not found: {id}"),
            Self::RefundReserveNotFound(id) => write!(f, "refund reserve not found: {id}"),
            Self::EntryNotFound(id) => write!(f, "ledger entry not found: {id}"),
            Self::InvalidAmount => write!(f, "invalid amount"),
            Self::InvalidOwnership(msg) => write!(f, "invalid ownership: {msg}"),
            Self::CurrencyMismatch { expected, actual } => {
                write!(f, "currency mismatch: expected {expected}, got {actual}")
            }
            Self::InsufficientFunds => write!(f, "insufficient funds"),
            Self::ReconciliationError(msg) => write!(f, "reconciliation error: {msg}"),
            Self::InvalidStateTransition { from, to } => {
                write!(f, "invalid state transition: {from} -> {to}")
            }
            Self::OrderNotSettled => write!(f, "order not settled"),
            Self::UseCancelInstead => write!(f, "order is still in progress; cancel it instead of refunding"),
            Self::AlreadyRefunded => write!(f, "already refunded"),
            Self::RefundExceedsNet { requested, available } => write!(
                f,
                "refund of {requested} exceeds available net amount of {available}"
            ),
            Self::RefundWindowExpired => write!(f, "refund window expired"),
            Self::BelowMinimum { amount, minimum } => {
                write!(f, "amount {amount} is below minimum {minimum}")
            }
            Self::NoUnsettledGroups => write!(f, "no unsettled groups for merchant"),
            Self::IdempotencyConflict(key) => write!(f, "idempotency conflict for key {key}"),
            Self::DoubleSettlement(id) => write!(f, "group {id} is already linked to a settlement"),
            Self::StoreUnavailable(msg) => write!(f, "store unavailable: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => LedgerError::StoreUnavailable("row not found".into()),
            other => LedgerError::StoreUnavailable(other.to_string()),
        }
    }
}
