use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::currency::Currency;
use crate::entry::{EntryStatus, EntryType, InitiatorKind};
use crate::error::LedgerError;
use crate::group::{GroupEngine, Party};
use crate::money::apply_commission;
use crate::ports::{Clock, IdGenerator};
use crate::store::SettlementStore;
use crate::wallet::WalletRegistry;
use crate::wallet::WalletType;

/// `PENDING` -> `{COMPLETED, FAILED}`. Unlike transaction groups, a failed
/// settlement row is kept as an audit record rather than discarded;
/// spec.md §4.4 requires the settlement row to survive a failed execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementStatus {
    Pending,
    Completed,
    Failed,
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SettlementStatus::Pending => "PENDING",
            SettlementStatus::Completed => "COMPLETED",
            SettlementStatus::Failed => "FAILED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: Uuid,
    pub merchant_id: String,
    pub total: i64,
    pub fee: i64,
    pub net: i64,
    pub commission_rate: i64,
    pub group_count: i64,
    pub status: SettlementStatus,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settlement_group_id: Option<Uuid>,
    pub idempotency_key_hash: Option<String>,
}

pub struct NewSettlement {
    pub id: Uuid,
    pub merchant_id: String,
    pub total: i64,
    pub fee: i64,
    pub net: i64,
    pub commission_rate: i64,
    pub group_count: i64,
    pub currency: Currency,
    pub settlement_group_id: Uuid,
    pub idempotency_key_hash: String,
}

/// A non-persisted preview of what `execute` would do, returned by
/// `calculate` so a caller can display it before committing.
#[derive(Debug, Clone)]
pub struct SettlementPreview {
    pub merchant_id: String,
    pub groups: Vec<Uuid>,
    pub group_amounts: Vec<(Uuid, i64)>,
    pub total: i64,
    pub fee: i64,
    pub net: i64,
    pub commission_rate: i64,
    pub currency: Currency,
}

/// Merchant payout calculation and execution, spec.md §4.4.
pub struct SettlementEngine {
    settlements: Arc<dyn SettlementStore>,
    groups: Arc<GroupEngine>,
    wallets: Arc<WalletRegistry>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: LedgerConfig,
}

impl SettlementEngine {
    pub fn new(
        settlements: Arc<dyn SettlementStore>,
        groups: Arc<GroupEngine>,
        wallets: Arc<WalletRegistry>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            settlements,
            groups,
            wallets,
            clock,
            ids,
            config,
        }
    }

    /// `calculateSettlement(merchant)`: finds all unsettled groups
    /// attributed to `merchant_id` and sums the positive-amount HOLD
    /// CREDIT entries each deposited on ESCROW. The escrow leg of an
    /// unsettled order hold is the only positive HOLD CREDIT entry a
    /// freshly-held order carries, so no explicit wallet lookup is needed
    /// to identify it.
    pub async fn calculate(&self, merchant_id: &str) -> Result<SettlementPreview, LedgerError> {
        let group_ids = self
            .settlements
            .unsettled_groups_for_merchant(merchant_id)
            .await?;
        if group_ids.is_empty() {
            return Err(LedgerError::NoUnsettledGroups);
        }

        let mut group_amounts = Vec::with_capacity(group_ids.len());
        let mut total = 0i64;
        let mut currency: Option<Currency> = None;
        for group_id in &group_ids {
            let entries = self.groups.list_group_entries(*group_id).await?;
            let escrow_credits: Vec<_> = entries
                .iter()
                .filter(|e| {
                    e.status == EntryStatus::Hold
                        && e.entry_type == EntryType::Credit
                        && e.amount_minor_units > 0
                })
                .collect();
            let amount: i64 = escrow_credits.iter().map(|e| e.amount_minor_units).sum();
            if currency.is_none() {
                currency = escrow_credits.first().map(|e| e.currency.clone());
            }
            group_amounts.push((*group_id, amount));
            total += amount;
        }

        if total < self.config.settlement_min_amount {
            return Err(LedgerError::BelowMinimum {
                amount: total,
                minimum: self.config.settlement_min_amount,
            });
        }

        let (fee, net) = apply_commission(total, self.config.commission_rate);
        debug_assert_eq!(fee + net, total);

        let currency = currency.ok_or_else(|| {
            LedgerError::InvariantViolation("unsettled group carries no escrow entries".into())
        })?;

        Ok(SettlementPreview {
            merchant_id: merchant_id.to_string(),
            groups: group_ids,
            group_amounts,
            total,
            fee,
            net,
            commission_rate: self.config.commission_rate,
            currency,
        })
    }

    /// `executeSettlement(merchant)`, spec.md §4.4 steps 1-9.
    ///
    /// Per spec.md §5, a caller composes this inside one store
    /// transaction; a `PostgresStore` wires every call here to the same
    /// connection so a failure partway through rolls every entry/link
    /// write back, leaving only the `FAILED` settlement row as an audit
    /// record. This method does not attempt to undo prior writes itself.
    pub async fn execute(&self, merchant_id: &str) -> Result<Settlement, LedgerError> {
        let key = format!(
            "merchant_{merchant_id}_settlement_{}",
            self.clock.now().date_naive()
        );
        let key_hash = hash_key(&key);
        if let Some(existing) = self.settlements.find_by_idempotency_key(&key_hash).await? {
            return Ok(existing);
        }

        let preview = self.calculate(merchant_id).await?;
        let currency = preview.currency.clone();

        let escrow = self
            .wallets
            .system_wallet(WalletType::Escrow, currency.clone(), "escrow")
            .await?;
        let fee_wallet = self
            .wallets
            .system_wallet(WalletType::System, currency.clone(), "fees")
            .await?;
        let merchant_wallet = self
            .wallets
            .wallet_for_owner(WalletType::Merchant, merchant_id)
            .await?;

        let group = self
            .groups
            .create_group(
                None,
                Some(merchant_id.to_string()),
                None,
                Some("merchant settlement".into()),
            )
            .await?;

        let new_settlement = NewSettlement {
            id: self.ids.new_id(),
            merchant_id: merchant_id.to_string(),
            total: preview.total,
            fee: preview.fee,
            net: preview.net,
            commission_rate: preview.commission_rate,
            group_count: preview.groups.len() as i64,
            currency: currency.clone(),
            settlement_group_id: group.id,
            idempotency_key_hash: key_hash,
        };
        let settlement = self.settlements.insert(new_settlement).await?;

        let escrow_party = Party::new(escrow.id, currency.clone(), InitiatorKind::System);
        let merchant_party = Party::new(merchant_wallet.id, currency.clone(), InitiatorKind::System);
        let fee_party = Party::new(fee_wallet.id, currency.clone(), InitiatorKind::System);

        let outcome: Result<(), LedgerError> = async {
            self.groups
                .hold_credit(group.id, &escrow_party, &merchant_party, preview.net)
                .await?;
            if preview.fee > 0 {
                self.groups
                    .hold_credit(group.id, &escrow_party, &fee_party, preview.fee)
                    .await?;
            }
            self.groups.settle_group(group.id).await?;
            for (group_id, amount) in &preview.group_amounts {
                self.settlements
                    .link_group(settlement.id, *group_id, *amount)
                    .await?;
            }
            Ok(())
        }
        .await;

        match outcome {
            Ok(()) => {
                let completed = self
                    .settlements
                    .mark_completed(settlement.id, self.clock.now())
                    .await?;
                metrics::counter!("ledger.settlements.completed").increment(1);
                Ok(completed)
            }
            Err(e) => {
                let _ = self.settlements.mark_failed(settlement.id).await;
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        self.settlements.get(id).await
    }

    pub async fn list_for_merchant(
        &self,
        merchant_id: &str,
        page: i64,
        size: i64,
    ) -> Result<Vec<Settlement>, LedgerError> {
        self.settlements.list_for_merchant(merchant_id, page, size).await
    }
}

pub(crate) fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_key_deterministic() {
        assert_eq!(hash_key("a"), hash_key("a"));
        assert_ne!(hash_key("a"), hash_key("b"));
    }
}
