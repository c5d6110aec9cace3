use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use uuid::Uuid;

use crate::entry::{EntryId, EntryStatus, EntryType, InitiatorKind, LedgerEntry, NewEntry, Tier};
use crate::error::LedgerError;
use crate::group::{GroupStatus, TransactionGroup};
use crate::refund::{
    NewRefund, NewRefundReserve, Refund, RefundReserve, RefundReserveStatus, RefundStatus, RefundType,
};
use crate::settlement::{NewSettlement, Settlement, SettlementStatus};
use crate::store::{EntryStore, GroupStore, RefundStore, SettlementStore, WalletStore};
use crate::wallet::{NewWallet, Wallet, WalletId, WalletType};

#[derive(Default)]
struct Inner {
    wallets: HashMap<WalletId, Wallet>,
    next_wallet_id: WalletId,
    wallet_owner_index: HashMap<(WalletType, String), WalletId>,
    wallet_system_index: HashMap<(WalletType, String), WalletId>,

    // Three genuinely separate tables, matching the three authoritative
    // tables of the tiered storage model: a row is moved hot -> warm ->
    // cold by copying it into the next map and removing it from the
    // last, never by mutating a `tier` field in place.
    hot: HashMap<EntryId, LedgerEntry>,
    warm: HashMap<EntryId, LedgerEntry>,
    cold: HashMap<EntryId, LedgerEntry>,
    next_entry_id: EntryId,

    groups: HashMap<Uuid, TransactionGroup>,
    group_idem_index: HashMap<String, Uuid>,

    settlements: HashMap<Uuid, Settlement>,
    settlement_idem_index: HashMap<String, Uuid>,
    settlement_links: HashMap<Uuid, (Uuid, i64)>,

    reserves: HashMap<Uuid, RefundReserve>,
    reserve_by_settlement: HashMap<Uuid, Uuid>,

    refunds: HashMap<Uuid, Refund>,
    refund_idem_index: HashMap<String, Uuid>,

    archive_trace: Vec<(EntryId, EntryId)>,
}

/// In-memory implementation of every store port, for tests. A single
/// `Mutex<Inner>` backs all five traits so a compound check-then-write
/// sequence (balance check + HOLD insert, idempotency lookup + insert)
/// observes one consistent snapshot; every method here finishes its work
/// synchronously before returning, so the lock is never held across an
/// `.await` point.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: std::sync::Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn insert_wallet(&self, wallet: NewWallet) -> Result<Wallet, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_wallet_id += 1;
        let id = inner.next_wallet_id;
        let row = Wallet {
            id,
            wallet_type: wallet.wallet_type,
            owner_kind: wallet.owner_kind,
            owner_id: wallet.owner_id.clone(),
            currency: wallet.currency,
            description: wallet.description,
            created_at: Utc::now(),
        };
        if let Some(owner_id) = &wallet.owner_id {
            inner
                .wallet_owner_index
                .insert((wallet.wallet_type, owner_id.clone()), id);
        }
        inner.wallets.insert(id, row.clone());
        Ok(row)
    }

    async fn get_wallet(&self, id: WalletId) -> Result<Wallet, LedgerError> {
        let inner = self.inner.lock().unwrap();
        inner.wallets.get(&id).cloned().ok_or(LedgerError::WalletNotFound(id))
    }

    async fn find_by_owner(
        &self,
        wallet_type: WalletType,
        owner_id: &str,
    ) -> Result<Option<Wallet>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .wallet_owner_index
            .get(&(wallet_type, owner_id.to_string()))
            .and_then(|id| inner.wallets.get(id))
            .cloned())
    }

    async fn find_system_wallet(
        &self,
        wallet_type: WalletType,
        description: &str,
    ) -> Result<Option<Wallet>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .wallet_system_index
            .get(&(wallet_type, description.to_string()))
            .and_then(|id| inner.wallets.get(id))
            .cloned())
    }

    async fn insert_or_get_system_wallet(&self, wallet: NewWallet) -> Result<Wallet, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (wallet.wallet_type, wallet.description.clone());
        if let Some(id) = inner.wallet_system_index.get(&key) {
            return Ok(inner.wallets.get(id).cloned().unwrap());
        }
        inner.next_wallet_id += 1;
        let id = inner.next_wallet_id;
        let row = Wallet {
            id,
            wallet_type: wallet.wallet_type,
            owner_kind: wallet.owner_kind,
            owner_id: wallet.owner_id,
            currency: wallet.currency,
            description: wallet.description,
            created_at: Utc::now(),
        };
        inner.wallet_system_index.insert(key, id);
        inner.wallets.insert(id, row.clone());
        Ok(row)
    }

    async fn lock_for_update(&self, id: WalletId) -> Result<Wallet, LedgerError> {
        self.get_wallet(id).await
    }
}

fn finalizes_balance(status: EntryStatus) -> bool {
    matches!(
        status,
        EntryStatus::Settled | EntryStatus::Released | EntryStatus::Cancelled | EntryStatus::Refunded
    )
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn append_entries(&self, entries: Vec<NewEntry>) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let mut out = Vec::with_capacity(entries.len());
        for ne in entries {
            inner.next_entry_id += 1;
            let id = inner.next_entry_id;
            let row = LedgerEntry {
                id,
                wallet_id: ne.wallet_id,
                group_id: ne.group_id,
                entry_type: ne.entry_type,
                status: ne.status,
                amount_minor_units: ne.amount_minor_units,
                currency: ne.currency,
                tier: Tier::Hot,
                initiator_kind: ne.initiator_kind,
                initiator_id: ne.initiator_id,
                ip_address: ne.ip_address,
                user_agent: ne.user_agent,
                metadata: ne.metadata,
                created_at: Utc::now(),
                settled_at: if finalizes_balance(ne.status) { Some(Utc::now()) } else { None },
                snapshot_date: None,
            };
            inner.hot.insert(id, row.clone());
            out.push(row);
        }
        Ok(out)
    }

    async fn entries_for_group(&self, group_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(all_tiers(&inner).filter(|e| e.group_id == group_id).cloned().collect())
    }

    async fn entries_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(all_tiers(&inner).filter(|e| e.wallet_id == wallet_id).cloned().collect())
    }

    async fn total_balance(&self, wallet_id: WalletId) -> Result<i64, LedgerError> {
        let inner = self.inner.lock().unwrap();
        // Cold-tier rows are excluded: once an entry is archived, the
        // `LEDGER` checkpoint written alongside it in warm already carries
        // its amount forward, so cold only needs to be read for forensic
        // lookups, never for balance derivation (see DESIGN.md).
        Ok(inner
            .hot
            .values()
            .chain(inner.warm.values())
            .filter(|e| e.wallet_id == wallet_id && finalizes_balance(e.status))
            .map(|e| e.amount_minor_units)
            .sum())
    }

    async fn held_debit(&self, wallet_id: WalletId) -> Result<i64, LedgerError> {
        let inner = self.inner.lock().unwrap();
        // HOLD rows never leave hot (spec.md §3), so only hot needs scanning.
        let sum: i64 = inner
            .hot
            .values()
            .filter(|e| e.wallet_id == wallet_id && e.status == EntryStatus::Hold && e.amount_minor_units < 0)
            .filter(|e| {
                inner
                    .groups
                    .get(&e.group_id)
                    .map(|g| g.status != GroupStatus::Settled)
                    .unwrap_or(true)
            })
            .map(|e| e.amount_minor_units)
            .sum();
        Ok(sum.abs())
    }

    async fn group_hold_settle_sum(&self, group_id: Uuid) -> Result<i64, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hot
            .values()
            .chain(inner.warm.values())
            .filter(|e| e.group_id == group_id && matches!(e.status, EntryStatus::Hold | EntryStatus::Settled))
            .map(|e| e.amount_minor_units)
            .sum())
    }

    async fn hot_entries_ready_for_snapshot(
        &self,
        wallet_id: WalletId,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .hot
            .values()
            .filter(|e| {
                e.wallet_id == wallet_id
                    && inner
                        .groups
                        .get(&e.group_id)
                        .map(|g| g.status.is_terminal())
                        .unwrap_or(false)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.id);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    /// Copies `entry_ids` out of hot into warm and deletes the hot rows —
    /// never an in-place field mutation, since hot rejects UPDATEs the
    /// same way the real store's trigger does.
    async fn move_to_warm(&self, entry_ids: &[EntryId]) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let today = Utc::now().date_naive();
        for id in entry_ids {
            if let Some(mut entry) = inner.hot.remove(id) {
                entry.tier = Tier::Warm;
                entry.snapshot_date = Some(today);
                inner.warm.insert(*id, entry);
            }
        }
        Ok(())
    }

    async fn warm_entries_before(
        &self,
        wallet_id: WalletId,
        cutoff: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .warm
            .values()
            .filter(|e| {
                e.wallet_id == wallet_id
                    && e.entry_type != EntryType::Ledger
                    && e.snapshot_date.map(|d| d < cutoff).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn insert_checkpoint(
        &self,
        wallet_id: WalletId,
        amount: i64,
        snapshot_date: NaiveDate,
    ) -> Result<EntryId, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let currency = inner
            .wallets
            .get(&wallet_id)
            .map(|w| w.currency.clone())
            .ok_or(LedgerError::WalletNotFound(wallet_id))?;
        inner.next_entry_id += 1;
        let id = inner.next_entry_id;
        let row = LedgerEntry {
            id,
            wallet_id,
            group_id: Uuid::now_v7(),
            entry_type: EntryType::Ledger,
            status: EntryStatus::Settled,
            amount_minor_units: amount,
            currency,
            tier: Tier::Warm,
            initiator_kind: InitiatorKind::System,
            initiator_id: None,
            ip_address: None,
            user_agent: None,
            metadata: None,
            created_at: Utc::now(),
            settled_at: Some(Utc::now()),
            snapshot_date: Some(snapshot_date),
        };
        inner.warm.insert(id, row);
        Ok(id)
    }

    /// Copies `entries` into cold and deletes them from warm — the same
    /// copy-then-delete discipline as [`Self::move_to_warm`].
    async fn archive_to_cold(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        for entry in entries {
            if let Some(mut row) = inner.warm.remove(&entry.id) {
                row.tier = Tier::Cold;
                inner.cold.insert(entry.id, row);
            }
        }
        Ok(())
    }

    async fn record_archive_trace(
        &self,
        checkpoint_id: EntryId,
        original_entry_ids: &[EntryId],
    ) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        for original in original_entry_ids {
            inner.archive_trace.push((checkpoint_id, *original));
        }
        Ok(())
    }

    async fn reconcile_system(&self) -> Result<Vec<(String, i64)>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut totals: HashMap<String, i64> = HashMap::new();
        for entry in inner.hot.values().chain(inner.warm.values()) {
            *totals.entry(entry.status.to_string()).or_insert(0) += entry.amount_minor_units;
        }
        Ok(totals.into_iter().collect())
    }

    async fn sum_by_tier(&self, tier: Tier) -> Result<i64, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let map = match tier {
            Tier::Hot => &inner.hot,
            Tier::Warm => &inner.warm,
            Tier::Cold => &inner.cold,
        };
        Ok(map.values().map(|e| e.amount_minor_units).sum())
    }
}

fn all_tiers(inner: &Inner) -> impl Iterator<Item = &LedgerEntry> {
    inner.hot.values().chain(inner.warm.values()).chain(inner.cold.values())
}

#[async_trait]
impl GroupStore for MemoryStore {
    async fn create_group(
        &self,
        id: Uuid,
        idempotency_key_hash: Option<String>,
        merchant_id: Option<String>,
        buyer_id: Option<String>,
        reason: Option<String>,
    ) -> Result<TransactionGroup, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let row = TransactionGroup {
            id,
            status: GroupStatus::InProgress,
            merchant_id,
            buyer_id,
            reason,
            idempotency_key_hash: idempotency_key_hash.clone(),
            created_at: Utc::now(),
        };
        if let Some(hash) = idempotency_key_hash {
            inner.group_idem_index.insert(hash, id);
        }
        inner.groups.insert(id, row.clone());
        Ok(row)
    }

    async fn find_by_idempotency_key(&self, key_hash: &str) -> Result<Option<TransactionGroup>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.group_idem_index.get(key_hash).and_then(|id| inner.groups.get(id)).cloned())
    }

    async fn get_group(&self, id: Uuid) -> Result<TransactionGroup, LedgerError> {
        let inner = self.inner.lock().unwrap();
        inner.groups.get(&id).cloned().ok_or(LedgerError::GroupNotFound(id))
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: GroupStatus,
        next: GroupStatus,
    ) -> Result<TransactionGroup, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let group = inner.groups.get_mut(&id).ok_or(LedgerError::GroupNotFound(id))?;
        if group.status != expected {
            return Err(LedgerError::InvalidStateTransition {
                from: group.status.to_string(),
                to: next.to_string(),
            });
        }
        group.status = next;
        Ok(group.clone())
    }

    async fn stale_groups(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<TransactionGroup>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .groups
            .values()
            .filter(|g| g.status == GroupStatus::InProgress && g.created_at < older_than)
            .cloned()
            .collect();
        rows.sort_by_key(|g| g.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl SettlementStore for MemoryStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Settlement>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.settlement_idem_index.get(key).and_then(|id| inner.settlements.get(id)).cloned())
    }

    async fn insert(&self, settlement: NewSettlement) -> Result<Settlement, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let id = settlement.id;
        let row = Settlement {
            id,
            merchant_id: settlement.merchant_id,
            total: settlement.total,
            fee: settlement.fee,
            net: settlement.net,
            commission_rate: settlement.commission_rate,
            group_count: settlement.group_count,
            status: SettlementStatus::Pending,
            currency: settlement.currency,
            created_at: Utc::now(),
            settled_at: None,
            settlement_group_id: Some(settlement.settlement_group_id),
            idempotency_key_hash: Some(settlement.idempotency_key_hash.clone()),
        };
        inner.settlement_idem_index.insert(settlement.idempotency_key_hash, id);
        inner.settlements.insert(id, row.clone());
        Ok(row)
    }

    async fn mark_completed(&self, id: Uuid, settled_at: DateTime<Utc>) -> Result<Settlement, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.settlements.get_mut(&id).ok_or(LedgerError::SettlementNotFound(id))?;
        row.status = SettlementStatus::Completed;
        row.settled_at = Some(settled_at);
        Ok(row.clone())
    }

    async fn mark_failed(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.settlements.get_mut(&id).ok_or(LedgerError::SettlementNotFound(id))?;
        row.status = SettlementStatus::Failed;
        Ok(row.clone())
    }

    async fn get(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        let inner = self.inner.lock().unwrap();
        inner.settlements.get(&id).cloned().ok_or(LedgerError::SettlementNotFound(id))
    }

    async fn list_for_merchant(&self, merchant_id: &str, page: i64, size: i64) -> Result<Vec<Settlement>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner.settlements.values().filter(|s| s.merchant_id == merchant_id).cloned().collect();
        rows.sort_by_key(|s| s.created_at);
        let start = (page.max(0) * size.max(0)) as usize;
        Ok(rows.into_iter().skip(start).take(size.max(0) as usize).collect())
    }

    async fn unsettled_groups_for_merchant(&self, merchant_id: &str) -> Result<Vec<Uuid>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .groups
            .values()
            .filter(|g| {
                g.merchant_id.as_deref() == Some(merchant_id)
                    && g.status == GroupStatus::InProgress
                    && !inner.settlement_links.contains_key(&g.id)
            })
            .map(|g| g.id)
            .collect())
    }

    async fn link_group(&self, settlement_id: Uuid, group_id: Uuid, amount: i64) -> Result<(), LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.settlement_links.contains_key(&group_id) {
            return Err(LedgerError::DoubleSettlement(group_id));
        }
        inner.settlement_links.insert(group_id, (settlement_id, amount));
        Ok(())
    }

    async fn settlement_status(&self, id: Uuid) -> Result<SettlementStatus, LedgerError> {
        let inner = self.inner.lock().unwrap();
        inner.settlements.get(&id).map(|s| s.status).ok_or(LedgerError::SettlementNotFound(id))
    }

    async fn settlement_for_group(&self, group_id: Uuid) -> Result<Option<Uuid>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.settlement_links.get(&group_id).map(|(settlement_id, _)| *settlement_id))
    }
}

#[async_trait]
impl RefundStore for MemoryStore {
    async fn insert_reserve(&self, reserve: NewRefundReserve) -> Result<RefundReserve, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let id = reserve.id;
        let row = RefundReserve {
            id,
            settlement_id: reserve.settlement_id,
            merchant_id: reserve.merchant_id,
            reserve_wallet_id: reserve.reserve_wallet_id,
            reserved: reserve.reserved,
            used: 0,
            reserve_group_id: reserve.reserve_group_id,
            status: RefundReserveStatus::Active,
            currency: reserve.currency,
            created_at: Utc::now(),
            expires_at: reserve.expires_at,
            released_at: None,
        };
        inner.reserve_by_settlement.insert(reserve.settlement_id, id);
        inner.reserves.insert(id, row.clone());
        Ok(row)
    }

    async fn get_reserve(&self, id: Uuid) -> Result<RefundReserve, LedgerError> {
        let inner = self.inner.lock().unwrap();
        inner.reserves.get(&id).cloned().ok_or(LedgerError::RefundReserveNotFound(id))
    }

    async fn reserve_for_settlement(&self, settlement_id: Uuid) -> Result<Option<RefundReserve>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .reserve_by_settlement
            .get(&settlement_id)
            .and_then(|id| inner.reserves.get(id))
            .cloned())
    }

    async fn consume_reserve(&self, id: Uuid, amount: i64) -> Result<RefundReserve, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.reserves.get_mut(&id).ok_or(LedgerError::RefundReserveNotFound(id))?;
        row.used += amount;
        row.status = if row.used >= row.reserved {
            RefundReserveStatus::FullyUsed
        } else {
            RefundReserveStatus::PartiallyUsed
        };
        Ok(row.clone())
    }

    async fn set_reserve_status(
        &self,
        id: Uuid,
        status: RefundReserveStatus,
        released_at: Option<DateTime<Utc>>,
    ) -> Result<RefundReserve, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.reserves.get_mut(&id).ok_or(LedgerError::RefundReserveNotFound(id))?;
        row.status = status;
        if released_at.is_some() {
            row.released_at = released_at;
        }
        Ok(row.clone())
    }

    async fn expired_reserves(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RefundReserve>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .reserves
            .values()
            .filter(|r| {
                matches!(r.status, RefundReserveStatus::Active | RefundReserveStatus::PartiallyUsed)
                    && r.expires_at <= now
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.expires_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn find_refund_by_idempotency_key(&self, key: &str) -> Result<Option<Refund>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.refund_idem_index.get(key).and_then(|id| inner.refunds.get(id)).cloned())
    }

    async fn insert_refund(&self, refund: NewRefund) -> Result<Refund, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let id = refund.id;
        let row = Refund {
            id,
            order_group_id: refund.order_group_id,
            settlement_id: refund.settlement_id,
            merchant_id: refund.merchant_id,
            merchant_wallet_id: refund.merchant_wallet_id,
            buyer_id: refund.buyer_id,
            buyer_wallet_id: refund.buyer_wallet_id,
            amount: refund.amount,
            original_amount: refund.original_amount,
            reason: refund.reason,
            status: RefundStatus::Pending,
            initiator: refund.initiator,
            refund_group_id: None,
            idempotency_key_hash: refund.idempotency_key_hash.clone(),
            refund_type: refund.refund_type,
            currency: refund.currency,
            created_at: Utc::now(),
            processed_at: None,
            expires_at: None,
        };
        if let Some(hash) = refund.idempotency_key_hash {
            inner.refund_idem_index.insert(hash, id);
        }
        inner.refunds.insert(id, row.clone());
        Ok(row)
    }

    async fn get_refund(&self, id: Uuid) -> Result<Refund, LedgerError> {
        let inner = self.inner.lock().unwrap();
        inner.refunds.get(&id).cloned().ok_or(LedgerError::RefundNotFound(id))
    }

    async fn set_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        refund_group_id: Option<Uuid>,
        processed_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Refund, LedgerError> {
        let mut inner = self.inner.lock().unwrap();
        let row = inner.refunds.get_mut(&id).ok_or(LedgerError::RefundNotFound(id))?;
        row.status = status;
        if refund_group_id.is_some() {
            row.refund_group_id = refund_group_id;
        }
        if processed_at.is_some() {
            row.processed_at = processed_at;
        }
        if expires_at.is_some() {
            row.expires_at = expires_at;
        }
        Ok(row.clone())
    }

    async fn refunds_for_order(&self, order_group_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.refunds.values().filter(|r| r.order_group_id == order_group_id).cloned().collect())
    }

    async fn completed_refund_total(&self, order_group_id: Uuid) -> Result<i64, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .refunds
            .values()
            .filter(|r| r.order_group_id == order_group_id && r.status == RefundStatus::Completed)
            .map(|r| r.amount)
            .sum())
    }

    async fn has_full_refund(&self, order_group_id: Uuid) -> Result<bool, LedgerError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.refunds.values().any(|r| {
            r.order_group_id == order_group_id
                && r.refund_type == RefundType::Full
                && !matches!(r.status, RefundStatus::Rejected | RefundStatus::Failed | RefundStatus::Expired)
        }))
    }

    async fn list_for_merchant(&self, merchant_id: &str, page: i64, size: i64) -> Result<Vec<Refund>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner.refunds.values().filter(|r| r.merchant_id == merchant_id).cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        let start = (page.max(0) * size.max(0)) as usize;
        Ok(rows.into_iter().skip(start).take(size.max(0) as usize).collect())
    }

    async fn pending_funds_page(&self, limit: i64) -> Result<Vec<Refund>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner.refunds.values().filter(|r| r.status == RefundStatus::PendingFunds).cloned().collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn expired_pending_funds(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Refund>, LedgerError> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<_> = inner
            .refunds
            .values()
            .filter(|r| r.status == RefundStatus::PendingFunds && r.expires_at.map(|e| e <= now).unwrap_or(false))
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;
    use crate::wallet::OwnerKind;

    #[tokio::test]
    async fn insert_or_get_system_wallet_is_idempotent() {
        let store = MemoryStore::new();
        let a = store
            .insert_or_get_system_wallet(NewWallet {
                wallet_type: WalletType::Escrow,
                owner_kind: OwnerKind::System,
                owner_id: None,
                currency: Currency::parse("USD").unwrap(),
                description: "escrow".into(),
            })
            .await
            .unwrap();
        let b = store
            .insert_or_get_system_wallet(NewWallet {
                wallet_type: WalletType::Escrow,
                owner_kind: OwnerKind::System,
                owner_id: None,
                currency: Currency::parse("USD").unwrap(),
                description: "escrow".into(),
            })
            .await
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn double_settlement_link_rejected() {
        let store = MemoryStore::new();
        let group_id = Uuid::now_v7();
        SettlementStore::link_group(&store, Uuid::now_v7(), group_id, 100).await.unwrap();
        let err = SettlementStore::link_group(&store, Uuid::now_v7(), group_id, 100).await.unwrap_err();
        assert!(matches!(err, LedgerError::DoubleSettlement(_)));
    }

    #[tokio::test]
    async fn wallet_not_found_for_unknown_id() {
        let store = MemoryStore::new();
        let err = store.get_wallet(999).await.unwrap_err();
        assert!(matches!(err, LedgerError::WalletNotFound(999)));
    }
}
