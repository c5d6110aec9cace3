use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Days, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{LedgerConfig, ReserveSource};
use crate::currency::Currency;
use crate::entry::InitiatorKind;
use crate::error::LedgerError;
use crate::group::{GroupEngine, Party};
use crate::money::apply_reserve;
use crate::ports::{Clock, IdGenerator};
use crate::settlement::Settlement;
use crate::store::{GroupStore, RefundStore, SettlementStore};
use crate::wallet::{WalletId, WalletRegistry, WalletType};

/// `ACTIVE` -> `PARTIALLY_USED` (first consumption) -> `FULLY_USED`
/// (`available` reaches zero), or `ACTIVE`/`PARTIALLY_USED` -> `RELEASED`
/// after expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundReserveStatus {
    Active,
    PartiallyUsed,
    FullyUsed,
    Released,
}

impl fmt::Display for RefundReserveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefundReserveStatus::Active => "ACTIVE",
            RefundReserveStatus::PartiallyUsed => "PARTIALLY_USED",
            RefundReserveStatus::FullyUsed => "FULLY_USED",
            RefundReserveStatus::Released => "RELEASED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReserve {
    pub id: Uuid,
    pub settlement_id: Uuid,
    pub merchant_id: String,
    pub reserve_wallet_id: WalletId,
    pub reserved: i64,
    pub used: i64,
    pub reserve_group_id: Uuid,
    pub status: RefundReserveStatus,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub released_at: Option<DateTime<Utc>>,
}

impl RefundReserve {
    pub fn available(&self) -> i64 {
        self.reserved - self.used
    }
}

pub struct NewRefundReserve {
    pub id: Uuid,
    pub settlement_id: Uuid,
    pub merchant_id: String,
    pub reserve_wallet_id: WalletId,
    pub reserved: i64,
    pub reserve_group_id: Uuid,
    pub currency: Currency,
    pub expires_at: DateTime<Utc>,
}

/// spec.md §4.6's initiator taxonomy, distinct from the broader audit-trail
/// `InitiatorKind` used on ledger entries (no `USER` variant: a buyer never
/// directly requests a refund in this model, only a merchant/admin/system
/// process does).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundInitiator {
    System,
    Merchant,
    Admin,
}

impl From<RefundInitiator> for InitiatorKind {
    fn from(value: RefundInitiator) -> Self {
        match value {
            RefundInitiator::System => InitiatorKind::System,
            RefundInitiator::Merchant => InitiatorKind::Merchant,
            RefundInitiator::Admin => InitiatorKind::Admin,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundType {
    Full,
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundStatus {
    Pending,
    PendingFunds,
    Processing,
    Completed,
    Rejected,
    Failed,
    Expired,
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::PendingFunds => "PENDING_FUNDS",
            RefundStatus::Processing => "PROCESSING",
            RefundStatus::Completed => "COMPLETED",
            RefundStatus::Rejected => "REJECTED",
            RefundStatus::Failed => "FAILED",
            RefundStatus::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Refund {
    pub id: Uuid,
    pub order_group_id: Uuid,
    pub settlement_id: Option<Uuid>,
    pub merchant_id: String,
    pub merchant_wallet_id: WalletId,
    pub buyer_id: String,
    pub buyer_wallet_id: WalletId,
    pub amount: i64,
    pub original_amount: i64,
    pub reason: Option<String>,
    pub status: RefundStatus,
    pub initiator: RefundInitiator,
    pub refund_group_id: Option<Uuid>,
    pub idempotency_key_hash: Option<String>,
    pub refund_type: RefundType,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

pub struct NewRefund {
    pub id: Uuid,
    pub order_group_id: Uuid,
    pub settlement_id: Option<Uuid>,
    pub merchant_id: String,
    pub merchant_wallet_id: WalletId,
    pub buyer_id: String,
    pub buyer_wallet_id: WalletId,
    pub amount: i64,
    pub original_amount: i64,
    pub reason: Option<String>,
    pub initiator: RefundInitiator,
    pub idempotency_key_hash: Option<String>,
    pub refund_type: RefundType,
    pub currency: Currency,
}

/// Post-settlement returns, spec.md §4.5/§4.6.
pub struct RefundEngine {
    refunds: Arc<dyn RefundStore>,
    groups_store: Arc<dyn GroupStore>,
    settlements: Arc<dyn SettlementStore>,
    groups: Arc<GroupEngine>,
    wallets: Arc<WalletRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: LedgerConfig,
}

impl RefundEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        refunds: Arc<dyn RefundStore>,
        groups_store: Arc<dyn GroupStore>,
        settlements: Arc<dyn SettlementStore>,
        groups: Arc<GroupEngine>,
        wallets: Arc<WalletRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            refunds,
            groups_store,
            settlements,
            groups,
            wallets,
            clock,
            ids,
            config,
        }
    }

    /// Called (best-effort) right after a settlement completes. Moves
    /// `reserved = round(net * reserveRate, HALF_UP)` out of the
    /// configured source wallet into the dedicated reserve wallet as an
    /// immediately-settled transfer, so the reserve wallet's balance is a
    /// real, queryable number rather than a standing hold. Returns `None`
    /// when the reserve feature is disabled or the computed amount is
    /// zero.
    pub async fn create_reserve_for_settlement(
        &self,
        settlement: &Settlement,
    ) -> Result<Option<RefundReserve>, LedgerError> {
        if !self.config.reserve_enabled {
            return Ok(None);
        }
        let reserved = apply_reserve(settlement.net, self.config.reserve_rate);
        if reserved <= 0 {
            return Ok(None);
        }

        let currency = settlement.currency.clone();
        let reserve_wallet = self
            .wallets
            .system_wallet(WalletType::System, currency.clone(), "refund_reserve")
            .await?;
        let source = match self.config.reserve_source {
            ReserveSource::Escrow => {
                self.wallets
                    .system_wallet(WalletType::Escrow, currency.clone(), "escrow")
                    .await?
            }
            ReserveSource::MerchantBalance => {
                self.wallets
                    .wallet_for_owner(WalletType::Merchant, &settlement.merchant_id)
                    .await?
            }
        };

        let source_party = Party::new(source.id, currency.clone(), InitiatorKind::System);
        let reserve_party = Party::new(reserve_wallet.id, currency.clone(), InitiatorKind::System);
        let idem = format!("reserve_{}", settlement.id);
        let group = self
            .groups
            .direct_transfer(
                &source_party,
                &reserve_party,
                reserved,
                Some(&idem),
                Some(format!("refund reserve for settlement {}", settlement.id)),
            )
            .await?;

        let expires_at = self
            .clock
            .now()
            .checked_add_days(Days::new(self.config.reserve_hold_days.max(0) as u64))
            .unwrap_or_else(|| self.clock.now());

        let reserve = self
            .refunds
            .insert_reserve(NewRefundReserve {
                id: self.ids.new_id(),
                settlement_id: settlement.id,
                merchant_id: settlement.merchant_id.clone(),
                reserve_wallet_id: reserve_wallet.id,
                reserved,
                reserve_group_id: group.id,
                currency,
                expires_at,
            })
            .await?;
        metrics::counter!("ledger.reserves.created").increment(1);
        Ok(Some(reserve))
    }

    /// `createRefund(orderId, amount, reason, initiator, idempotencyKey?)`.
    pub async fn create_refund(
        &self,
        order_group_id: Uuid,
        amount: i64,
        reason: Option<String>,
        initiator: RefundInitiator,
        refund_type: RefundType,
        idempotency_key: Option<&str>,
    ) -> Result<Refund, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        let key_hash = idempotency_key.map(hash_key);
        if let Some(ref hash) = key_hash {
            if let Some(existing) = self.refunds.find_refund_by_idempotency_key(hash).await? {
                return Ok(existing);
            }
        }

        let order = self.groups_store.get_group(order_group_id).await?;
        use crate::group::GroupStatus;
        match order.status {
            GroupStatus::Settled => {}
            GroupStatus::InProgress => return Err(LedgerError::UseCancelInstead),
            GroupStatus::Released | GroupStatus::Cancelled => {
                return Err(LedgerError::OrderNotSettled)
            }
        }

        let merchant_id = order
            .merchant_id
            .clone()
            .ok_or_else(|| LedgerError::InvalidOwnership("order has no merchant".into()))?;
        let buyer_id = order
            .buyer_id
            .clone()
            .ok_or_else(|| LedgerError::InvalidOwnership("order has no buyer".into()))?;

        let entries = self.groups.list_group_entries(order_group_id).await?;
        let currency = entries
            .first()
            .map(|e| e.currency.clone())
            .ok_or_else(|| LedgerError::InvariantViolation("order has no entries".into()))?;

        let merchant_wallet = self.wallets.wallet_for_owner(WalletType::Merchant, &merchant_id).await?;
        let buyer_wallet = self.wallets.wallet_for_owner(WalletType::User, &buyer_id).await?;
        merchant_wallet.currency.matches(&buyer_wallet.currency)?;

        if refund_type == RefundType::Full && self.refunds.has_full_refund(order_group_id).await? {
            return Err(LedgerError::AlreadyRefunded);
        }

        // The order's own group only carries a settlement link once a
        // merchant payout has actually run `executeSettlement` over it
        // (`settlement_transaction_group`). An order refunded before its
        // merchant ever settles draws on no reserve and is not subject to
        // the post-settlement refund window.
        let settlement_id = self.settlements.settlement_for_group(order_group_id).await?;
        if let Some(settlement_id) = settlement_id {
            let settlement = self.settlements.get(settlement_id).await?;
            if let Some(settled_at) = settlement.settled_at {
                let window_end = settled_at
                    .checked_add_days(Days::new(self.config.refund_window_days.max(0) as u64))
                    .unwrap_or(settled_at);
                if self.clock.now() > window_end {
                    return Err(LedgerError::RefundWindowExpired);
                }
            }
        }

        // `net(order)`: the settled credit the merchant actually received,
        // i.e. the sum of positive SETTLED credit entries on the merchant
        // wallet within this order's group.
        let net: i64 = entries
            .iter()
            .filter(|e| {
                e.wallet_id == merchant_wallet.id
                    && e.amount_minor_units > 0
                    && matches!(e.status, crate::entry::EntryStatus::Settled)
            })
            .map(|e| e.amount_minor_units)
            .sum();
        let already_refunded = self.refunds.completed_refund_total(order_group_id).await?;
        let remaining = net - already_refunded;
        if amount > remaining {
            return Err(LedgerError::RefundExceedsNet {
                requested: amount,
                available: remaining,
            });
        }

        let new_refund = NewRefund {
            id: self.ids.new_id(),
            order_group_id,
            settlement_id,
            merchant_id: merchant_id.clone(),
            merchant_wallet_id: merchant_wallet.id,
            buyer_id,
            buyer_wallet_id: buyer_wallet.id,
            amount,
            original_amount: net,
            reason,
            initiator,
            idempotency_key_hash: key_hash,
            refund_type,
            currency: currency.clone(),
        };
        let refund = self.refunds.insert_refund(new_refund).await?;
        self.attempt_execute(refund).await
    }

    /// Attempts to move the refund from `PENDING`/`PENDING_FUNDS` to
    /// `COMPLETED`. Falls back to `PENDING_FUNDS` with an expiry if the
    /// merchant currently lacks available balance.
    async fn attempt_execute(&self, refund: Refund) -> Result<Refund, LedgerError> {
        let merchant_wallet = self.wallets.get_wallet(refund.merchant_wallet_id).await?;
        let total = self.groups.entry_store().total_balance(merchant_wallet.id).await?;
        let held = self.groups.entry_store().held_debit(merchant_wallet.id).await?;
        let available = total - held;

        if available < refund.amount {
            // How long a refund may sit in PENDING_FUNDS waiting on
            // merchant balance is a separate question from how long after
            // settlement a refund may be requested at all; reuses
            // `reserve_hold_days` (a reserve's own hold horizon) as the
            // grace period rather than `refund_window_days`, which gates
            // refund *creation* in `create_refund`.
            let expires_at = self
                .clock
                .now()
                .checked_add_days(Days::new(self.config.reserve_hold_days.max(0) as u64))
                .unwrap_or_else(|| self.clock.now());
            let updated = self
                .refunds
                .set_refund_status(refund.id, RefundStatus::PendingFunds, None, None, Some(expires_at))
                .await?;
            return Ok(updated);
        }

        self.execute_transfer(refund).await
    }

    async fn execute_transfer(&self, refund: Refund) -> Result<Refund, LedgerError> {
        let merchant_party = Party::new(
            refund.merchant_wallet_id,
            refund.currency.clone(),
            refund.initiator.into(),
        );
        let buyer_party = Party::new(refund.buyer_wallet_id, refund.currency.clone(), InitiatorKind::System);
        let idem = format!("refund_{}", refund.id);
        let group = self
            .groups
            .direct_transfer_with_status(
                &merchant_party,
                &buyer_party,
                refund.amount,
                crate::entry::EntryStatus::Refunded,
                Some(&idem),
                refund.reason.clone(),
            )
            .await?;

        if let Some(settlement_id) = refund.settlement_id {
            if let Some(reserve) = self.refunds.reserve_for_settlement(settlement_id).await? {
                self.consume_reserve(&reserve, refund.amount).await?;
            }
        }

        let updated = self
            .refunds
            .set_refund_status(
                refund.id,
                RefundStatus::Completed,
                Some(group.id),
                Some(self.clock.now()),
                None,
            )
            .await?;
        metrics::counter!("ledger.refunds.completed").increment(1);
        Ok(updated)
    }

    async fn consume_reserve(&self, reserve: &RefundReserve, amount: i64) -> Result<RefundReserve, LedgerError> {
        let consumed = amount.min(reserve.available());
        if consumed <= 0 {
            return Ok(reserve.clone());
        }
        self.refunds.consume_reserve(reserve.id, consumed).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Refund, LedgerError> {
        self.refunds.get_refund(id).await
    }

    pub async fn list_for_order(&self, order_group_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        self.refunds.refunds_for_order(order_group_id).await
    }

    pub async fn list_for_merchant(
        &self,
        merchant_id: &str,
        page: i64,
        size: i64,
    ) -> Result<Vec<Refund>, LedgerError> {
        self.refunds.list_for_merchant(merchant_id, page, size).await
    }

    /// Bounded retry sweep for `PENDING_FUNDS` refunds whose merchant
    /// balance may now be sufficient.
    pub async fn retry_pending_funds_page(&self, limit: i64) -> Result<usize, LedgerError> {
        let pending = self.refunds.pending_funds_page(limit).await?;
        let mut retried = 0;
        for refund in pending {
            if self.attempt_execute(refund).await.is_ok() {
                retried += 1;
            }
        }
        Ok(retried)
    }

    /// Bounded sweep moving past-expiry `PENDING_FUNDS` refunds to
    /// `EXPIRED`.
    pub async fn expire_pending_funds_page(&self, limit: i64) -> Result<usize, LedgerError> {
        let expired = self.refunds.expired_pending_funds(self.clock.now(), limit).await?;
        let mut count = 0;
        for refund in expired {
            self.refunds
                .set_refund_status(refund.id, RefundStatus::Expired, None, None, None)
                .await?;
            count += 1;
        }
        Ok(count)
    }

    /// Bounded sweep releasing expired reserves: settles the unused
    /// residual back to the merchant and marks the reserve `RELEASED`.
    pub async fn release_expired_reserves_page(&self, limit: i64) -> Result<usize, LedgerError> {
        let expired = self.refunds.expired_reserves(self.clock.now(), limit).await?;
        let mut count = 0;
        for reserve in expired {
            let residual = reserve.available();
            if residual > 0 {
                let merchant_wallet = self
                    .wallets
                    .wallet_for_owner(WalletType::Merchant, &reserve.merchant_id)
                    .await?;
                let reserve_party = Party::new(
                    reserve.reserve_wallet_id,
                    reserve.currency.clone(),
                    InitiatorKind::System,
                );
                let merchant_party =
                    Party::new(merchant_wallet.id, reserve.currency.clone(), InitiatorKind::System);
                let idem = format!("reserve_release_{}", reserve.id);
                self.groups
                    .direct_transfer(
                        &reserve_party,
                        &merchant_party,
                        residual,
                        Some(&idem),
                        Some("refund reserve release".into()),
                    )
                    .await?;
            }
            self.refunds
                .set_reserve_status(reserve.id, RefundReserveStatus::Released, Some(self.clock.now()))
                .await?;
            count += 1;
        }
        Ok(count)
    }
}

fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_available_is_reserved_minus_used() {
        let now = Utc::now();
        let reserve = RefundReserve {
            id: Uuid::now_v7(),
            settlement_id: Uuid::now_v7(),
            merchant_id: "m1".into(),
            reserve_wallet_id: 1,
            reserved: 1000,
            used: 400,
            reserve_group_id: Uuid::now_v7(),
            status: RefundReserveStatus::PartiallyUsed,
            currency: Currency::parse("USD").unwrap(),
            created_at: now,
            expires_at: now,
            released_at: None,
        };
        assert_eq!(reserve.available(), 600);
    }
}
