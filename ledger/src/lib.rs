// ledger/src/lib.rs
pub mod adapters;
pub mod config;
pub mod currency;
pub mod entry;
pub mod error;
pub mod group;
pub mod money;
pub mod ports;
pub mod reconciliation;
pub mod refund;
pub mod settlement;
pub mod snapshot;
pub mod store;
pub mod wallet;

pub use config::{LedgerConfig, ReserveSource};
pub use currency::Currency;
pub use entry::{EntryId, EntryStatus, EntryType, InitiatorKind, LedgerEntry, Tier};
pub use error::LedgerError;
pub use group::{GroupEngine, GroupStatus, Party, TransactionGroup};
pub use money::Money;
pub use ports::{Clock, FixedClock, IdGenerator, SystemClock, UuidV7Generator};
pub use reconciliation::Reconciliation;
pub use refund::{
    Refund, RefundEngine, RefundInitiator, RefundReserve, RefundReserveStatus, RefundStatus, RefundType,
};
pub use settlement::{Settlement, SettlementEngine, SettlementPreview, SettlementStatus};
pub use snapshot::SnapshotArchiveEngine;
pub use wallet::{OwnerKind, Wallet, WalletId, WalletRegistry, WalletType};

use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

use store::{EntryStore, GroupStore, RefundStore, SettlementStore, WalletStore};

/// Composition root: wires one backing store (something implementing all
/// five storage ports) into the six engines named in spec.md §9, and
/// exposes the programmatic API surface of spec.md §6 as inherent methods.
///
/// There is no DI framework here, only explicit construction: the
/// constructor takes one `Arc`-shareable store plus a clock and id
/// generator, clones the store handle once per port trait object, and
/// builds each engine on top. Swapping [`adapters::MemoryStore`] for
/// [`adapters::PostgresStore`] (or any future adapter implementing the
/// five traits) requires no change below this constructor.
pub struct Ledger {
    wallets: Arc<WalletRegistry>,
    groups: Arc<GroupEngine>,
    settlements: Arc<SettlementEngine>,
    refunds: Arc<RefundEngine>,
    snapshot: Arc<SnapshotArchiveEngine>,
    reconciliation: Arc<Reconciliation>,
}

impl Ledger {
    pub fn new<S>(store: S, clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>, config: LedgerConfig) -> Self
    where
        S: WalletStore + EntryStore + GroupStore + SettlementStore + RefundStore + Clone + 'static,
    {
        let wallet_store: Arc<dyn WalletStore> = Arc::new(store.clone());
        let entry_store: Arc<dyn EntryStore> = Arc::new(store.clone());
        let group_store: Arc<dyn GroupStore> = Arc::new(store.clone());
        let settlement_store: Arc<dyn SettlementStore> = Arc::new(store.clone());
        let refund_store: Arc<dyn RefundStore> = Arc::new(store);

        let wallets = Arc::new(WalletRegistry::new(wallet_store.clone()));
        let groups = Arc::new(GroupEngine::new(
            group_store.clone(),
            entry_store.clone(),
            wallet_store,
            clock.clone(),
            ids.clone(),
        ));
        let settlements = Arc::new(SettlementEngine::new(
            settlement_store.clone(),
            groups.clone(),
            wallets.clone(),
            clock.clone(),
            ids.clone(),
            config.clone(),
        ));
        let refunds = Arc::new(RefundEngine::new(
            refund_store.clone(),
            group_store,
            settlement_store,
            groups.clone(),
            wallets.clone(),
            clock,
            ids,
            config,
        ));
        let snapshot = Arc::new(SnapshotArchiveEngine::new(entry_store.clone()));
        let reconciliation = Arc::new(Reconciliation::new(entry_store, groups.clone()));

        Self {
            wallets,
            groups,
            settlements,
            refunds,
            snapshot,
            reconciliation,
        }
    }

    pub fn wallets(&self) -> &Arc<WalletRegistry> {
        &self.wallets
    }

    pub fn groups(&self) -> &Arc<GroupEngine> {
        &self.groups
    }

    pub fn settlements(&self) -> &Arc<SettlementEngine> {
        &self.settlements
    }

    pub fn refunds(&self) -> &Arc<RefundEngine> {
        &self.refunds
    }

    pub fn snapshot(&self) -> &Arc<SnapshotArchiveEngine> {
        &self.snapshot
    }

    pub fn reconciliation(&self) -> &Arc<Reconciliation> {
        &self.reconciliation
    }

    // --- Wallet (spec.md §6) ---

    pub async fn create_wallet(
        &self,
        wallet_type: WalletType,
        owner_kind: OwnerKind,
        owner_id: String,
        currency: Currency,
        description: String,
    ) -> Result<WalletId, LedgerError> {
        Ok(self
            .wallets
            .open_wallet(wallet_type, owner_kind, owner_id, currency, description)
            .await?
            .id)
    }

    pub async fn get_wallet(&self, id: WalletId) -> Result<Wallet, LedgerError> {
        self.wallets.get_wallet(id).await
    }

    pub async fn get_available_balance(&self, id: WalletId) -> Result<i64, LedgerError> {
        let total = self.groups.entry_store().total_balance(id).await?;
        let held = self.groups.entry_store().held_debit(id).await?;
        Ok(total - held)
    }

    pub async fn get_total_balance(&self, id: WalletId) -> Result<i64, LedgerError> {
        self.groups.entry_store().total_balance(id).await
    }

    // --- Group (spec.md §6) ---

    pub async fn create_group(&self, idempotency_key: Option<&str>) -> Result<Uuid, LedgerError> {
        Ok(self.groups.create_group(idempotency_key, None, None, None).await?.id)
    }

    pub async fn settle(&self, group_id: Uuid) -> Result<TransactionGroup, LedgerError> {
        self.groups.settle_group(group_id).await
    }

    pub async fn release(&self, group_id: Uuid, _reason: Option<String>) -> Result<TransactionGroup, LedgerError> {
        self.groups.release_group(group_id).await
    }

    pub async fn cancel(&self, group_id: Uuid, _reason: Option<String>) -> Result<TransactionGroup, LedgerError> {
        self.groups.cancel_group(group_id).await
    }

    pub async fn get_group_status(&self, group_id: Uuid) -> Result<GroupStatus, LedgerError> {
        Ok(self.groups.get_group(group_id).await?.status)
    }

    pub async fn list_group_entries(&self, group_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.groups.list_group_entries(group_id).await
    }

    // --- Settlement (spec.md §6) ---

    pub async fn calculate_settlement(&self, merchant_id: &str) -> Result<SettlementPreview, LedgerError> {
        self.settlements.calculate(merchant_id).await
    }

    /// `executeSettlement(merchant)` plus the best-effort reserve creation
    /// of spec.md §4.4 step 9. Reserve creation failure never fails the
    /// settlement itself — a payout that already completed must not be
    /// rolled back because its follow-up bookkeeping step failed.
    pub async fn execute_settlement(&self, merchant_id: &str) -> Result<Settlement, LedgerError> {
        let settlement = self.settlements.execute(merchant_id).await?;
        if settlement.status == SettlementStatus::Completed {
            let _ = self.refunds.create_reserve_for_settlement(&settlement).await;
        }
        Ok(settlement)
    }

    pub async fn get_settlement(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        self.settlements.get(id).await
    }

    pub async fn list_settlements(
        &self,
        merchant_id: &str,
        page: i64,
        size: i64,
    ) -> Result<Vec<Settlement>, LedgerError> {
        self.settlements.list_for_merchant(merchant_id, page, size).await
    }

    // --- Refund (spec.md §6) ---

    #[allow(clippy::too_many_arguments)]
    pub async fn create_refund(
        &self,
        order_id: Uuid,
        amount: i64,
        reason: Option<String>,
        initiator: RefundInitiator,
        refund_type: RefundType,
        idempotency_key: Option<&str>,
    ) -> Result<Refund, LedgerError> {
        self.refunds
            .create_refund(order_id, amount, reason, initiator, refund_type, idempotency_key)
            .await
    }

    pub async fn get_refund(&self, id: Uuid) -> Result<Refund, LedgerError> {
        self.refunds.get(id).await
    }

    pub async fn list_refunds_by_order(&self, order_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        self.refunds.list_for_order(order_id).await
    }

    pub async fn list_refunds(&self, merchant_id: &str, page: i64, size: i64) -> Result<Vec<Refund>, LedgerError> {
        self.refunds.list_for_merchant(merchant_id, page, size).await
    }

    // --- Snapshot / archive (spec.md §6) ---

    pub async fn capture_daily_snapshot(&self, wallet: WalletId) -> Result<usize, LedgerError> {
        self.snapshot.capture_daily_snapshot(wallet, 500).await
    }

    pub async fn archive_old_snapshots(&self, wallet: WalletId, cutoff: NaiveDate) -> Result<Option<i64>, LedgerError> {
        self.snapshot.archive_old_snapshots(wallet, cutoff).await
    }

    // --- Reconciliation (spec.md §6) ---

    pub async fn system_reconciliation(&self) -> Result<std::collections::HashMap<String, i64>, LedgerError> {
        self.reconciliation.system_reconciliation().await
    }

    pub async fn group_reconciliation(&self, group_id: Uuid) -> Result<i64, LedgerError> {
        self.reconciliation.group_reconciliation(group_id).await
    }
}
