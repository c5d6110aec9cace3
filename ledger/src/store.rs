use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::entry::{EntryId, LedgerEntry, NewEntry, Tier};
use crate::error::LedgerError;
use crate::group::{GroupStatus, TransactionGroup};
use crate::refund::{NewRefund, NewRefundReserve, Refund, RefundReserve, RefundReserveStatus, RefundStatus};
use crate::settlement::{NewSettlement, Settlement, SettlementStatus};
use crate::wallet::{NewWallet, Wallet, WalletId, WalletType};

/// Storage port for wallets (spec.md §9's `WalletStore`).
#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn insert_wallet(&self, wallet: NewWallet) -> Result<Wallet, LedgerError>;
    async fn get_wallet(&self, id: WalletId) -> Result<Wallet, LedgerError>;
    /// Looks up a USER or MERCHANT wallet by its owner id. Unlike system
    /// wallets, these are never lazily created here — a settlement or
    /// transfer referencing an owner id that has no wallet yet is a
    /// caller error, not an auto-provisioning opportunity.
    async fn find_by_owner(
        &self,
        wallet_type: WalletType,
        owner_id: &str,
    ) -> Result<Option<Wallet>, LedgerError>;
    async fn find_system_wallet(
        &self,
        wallet_type: WalletType,
        description: &str,
    ) -> Result<Option<Wallet>, LedgerError>;
    /// Inserts a system wallet unless one already exists for
    /// `(wallet_type, description)`, in which case the existing row is
    /// returned. Must be race-safe: two concurrent first-uses resolve to
    /// the same row.
    async fn insert_or_get_system_wallet(&self, wallet: NewWallet) -> Result<Wallet, LedgerError>;
    /// Takes a row lock on the wallet, to be held for the remainder of
    /// the caller's logical operation (balance check + entry append).
    async fn lock_for_update(&self, id: WalletId) -> Result<Wallet, LedgerError>;
}

/// Storage port for ledger entries (spec.md §9's `EntryStore`).
#[async_trait]
pub trait EntryStore: Send + Sync {
    async fn append_entries(&self, entries: Vec<NewEntry>) -> Result<Vec<LedgerEntry>, LedgerError>;
    async fn entries_for_group(&self, group_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError>;
    async fn entries_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// `totalBalance`, spec.md §4.2: sum of entries whose status is
    /// `SETTLED`, `RELEASED`, `CANCELLED`, `REFUNDED`, or the synthetic
    /// `LEDGER` checkpoint credit, across hot + warm. Cold-tier rows are
    /// excluded here — a `LEDGER` checkpoint in warm already carries
    /// forward the amount of whatever it archived to cold, so reading
    /// both would double-count (see DESIGN.md).
    async fn total_balance(&self, wallet_id: WalletId) -> Result<i64, LedgerError>;

    /// `heldDebit`, gated per the rule in DESIGN.md: sums `HOLD`
    /// negative-amount entries on the wallet whose owning group's
    /// current status is not `SETTLED`.
    async fn held_debit(&self, wallet_id: WalletId) -> Result<i64, LedgerError>;

    /// Sum of `amount` over entries of `group_id` with status ∈
    /// `{HOLD, SETTLED}` — the zero-sum precondition `settleGroup` checks.
    async fn group_hold_settle_sum(&self, group_id: Uuid) -> Result<i64, LedgerError>;

    /// Entries belonging to groups whose status is `SETTLED`, for the
    /// daily snapshot (hot -> warm). Bounded by `limit` so the sweep runs
    /// in bounded batches.
    async fn hot_entries_ready_for_snapshot(
        &self,
        wallet_id: WalletId,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Moves `entries` (by id) from hot to warm verbatim, deleting the
    /// hot rows. Only DELETE path the snapshot engine is allowed to use.
    async fn move_to_warm(&self, entry_ids: &[EntryId]) -> Result<(), LedgerError>;

    /// Non-checkpoint warm rows for `wallet_id` with snapshot date before
    /// `cutoff`, for the archive pass.
    async fn warm_entries_before(
        &self,
        wallet_id: WalletId,
        cutoff: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Inserts a synthetic `LEDGER` checkpoint row into warm and returns
    /// its id.
    async fn insert_checkpoint(
        &self,
        wallet_id: WalletId,
        amount: i64,
        snapshot_date: NaiveDate,
    ) -> Result<EntryId, LedgerError>;

    /// Copies `entries` verbatim into cold and deletes them from warm.
    async fn archive_to_cold(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError>;

    /// Records `(checkpoint_id, original_entry_id)` pairs in the
    /// forensic tracking table.
    async fn record_archive_trace(
        &self,
        checkpoint_id: EntryId,
        original_entry_ids: &[EntryId],
    ) -> Result<(), LedgerError>;

    /// Sum of every entry in the system, across all three tiers, broken
    /// down by status, for `systemReconciliation`.
    async fn reconcile_system(&self) -> Result<Vec<(String, i64)>, LedgerError>;

    /// Sum of every entry for a single tier — used to assert `Tier`
    /// invariants in tests without pulling the whole system total.
    async fn sum_by_tier(&self, tier: Tier) -> Result<i64, LedgerError>;
}

/// Storage port for transaction groups (spec.md §9's `GroupStore`).
#[async_trait]
pub trait GroupStore: Send + Sync {
    async fn create_group(
        &self,
        id: Uuid,
        idempotency_key_hash: Option<String>,
        merchant_id: Option<String>,
        buyer_id: Option<String>,
        reason: Option<String>,
    ) -> Result<TransactionGroup, LedgerError>;
    async fn find_by_idempotency_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<TransactionGroup>, LedgerError>;
    async fn get_group(&self, id: Uuid) -> Result<TransactionGroup, LedgerError>;
    /// Compare-and-swap the group's status. Returns `InvalidStateTransition`
    /// if the group's current status is not `expected`.
    async fn transition(
        &self,
        id: Uuid,
        expected: GroupStatus,
        next: GroupStatus,
    ) -> Result<TransactionGroup, LedgerError>;
    /// Bounded page of `IN_PROGRESS` groups older than `older_than`, for
    /// the stale-group cancellation sweep.
    async fn stale_groups(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<TransactionGroup>, LedgerError>;
}

/// Storage port for settlements (spec.md §9's `SettlementStore`).
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Settlement>, LedgerError>;
    async fn insert(&self, settlement: NewSettlement) -> Result<Settlement, LedgerError>;
    async fn mark_completed(
        &self,
        id: Uuid,
        settled_at: DateTime<Utc>,
    ) -> Result<Settlement, LedgerError>;
    async fn mark_failed(&self, id: Uuid) -> Result<Settlement, LedgerError>;
    async fn get(&self, id: Uuid) -> Result<Settlement, LedgerError>;
    async fn list_for_merchant(
        &self,
        merchant_id: &str,
        page: i64,
        size: i64,
    ) -> Result<Vec<Settlement>, LedgerError>;
    /// Groups attributed to `merchant_id` with no row in the settlement
    /// link table yet.
    async fn unsettled_groups_for_merchant(
        &self,
        merchant_id: &str,
    ) -> Result<Vec<Uuid>, LedgerError>;
    /// Inserts a settlement-to-group link. Fails with `DoubleSettlement`
    /// if `group_id` is already linked to a settlement (unique
    /// constraint is the concurrency gate).
    async fn link_group(
        &self,
        settlement_id: Uuid,
        group_id: Uuid,
        amount: i64,
    ) -> Result<(), LedgerError>;
    #[allow(dead_code)]
    async fn settlement_status(&self, id: Uuid) -> Result<SettlementStatus, LedgerError>;
    /// Resolves the settlement, if any, that `group_id` has been linked to
    /// through `link_group`. Used to find a refund's reserve and to gate
    /// the post-settlement refund window.
    async fn settlement_for_group(&self, group_id: Uuid) -> Result<Option<Uuid>, LedgerError>;
}

/// Storage port for refunds and refund reserves (spec.md §9's
/// `RefundStore`).
#[async_trait]
pub trait RefundStore: Send + Sync {
    async fn insert_reserve(&self, reserve: NewRefundReserve) -> Result<RefundReserve, LedgerError>;
    async fn get_reserve(&self, id: Uuid) -> Result<RefundReserve, LedgerError>;
    async fn reserve_for_settlement(
        &self,
        settlement_id: Uuid,
    ) -> Result<Option<RefundReserve>, LedgerError>;
    async fn consume_reserve(&self, id: Uuid, amount: i64) -> Result<RefundReserve, LedgerError>;
    async fn set_reserve_status(
        &self,
        id: Uuid,
        status: RefundReserveStatus,
        released_at: Option<DateTime<Utc>>,
    ) -> Result<RefundReserve, LedgerError>;
    async fn expired_reserves(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<RefundReserve>, LedgerError>;

    async fn find_refund_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Refund>, LedgerError>;
    async fn insert_refund(&self, refund: NewRefund) -> Result<Refund, LedgerError>;
    async fn get_refund(&self, id: Uuid) -> Result<Refund, LedgerError>;
    async fn set_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        refund_group_id: Option<Uuid>,
        processed_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Refund, LedgerError>;
    async fn refunds_for_order(&self, order_group_id: Uuid) -> Result<Vec<Refund>, LedgerError>;
    async fn completed_refund_total(&self, order_group_id: Uuid) -> Result<i64, LedgerError>;
    async fn has_full_refund(&self, order_group_id: Uuid) -> Result<bool, LedgerError>;
    async fn list_for_merchant(
        &self,
        merchant_id: &str,
        page: i64,
        size: i64,
    ) -> Result<Vec<Refund>, LedgerError>;
    /// Bounded page of `PENDING_FUNDS` refunds, for the retry sweep.
    async fn pending_funds_page(&self, limit: i64) -> Result<Vec<Refund>, LedgerError>;
    /// `PENDING_FUNDS` refunds whose `expires_at` has passed.
    async fn expired_pending_funds(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Refund>, LedgerError>;
}
