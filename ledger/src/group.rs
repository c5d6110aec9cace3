use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::currency::Currency;
use crate::entry::{EntryStatus, EntryType, InitiatorKind, LedgerEntry, NewEntry};
use crate::error::LedgerError;
use crate::ports::{Clock, IdGenerator};
use crate::store::{EntryStore, GroupStore, WalletStore};
use crate::wallet::WalletId;

/// `IN_PROGRESS` -> one of `{SETTLED, RELEASED, CANCELLED}`. Each final
/// state is terminal; spec.md §4.3 allows no other transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupStatus {
    InProgress,
    Settled,
    Released,
    Cancelled,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, GroupStatus::InProgress)
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GroupStatus::InProgress => "IN_PROGRESS",
            GroupStatus::Settled => "SETTLED",
            GroupStatus::Released => "RELEASED",
            GroupStatus::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionGroup {
    pub id: Uuid,
    pub status: GroupStatus,
    pub merchant_id: Option<String>,
    pub buyer_id: Option<String>,
    pub reason: Option<String>,
    pub idempotency_key_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A caller-facing description of one side of a hold, used by the
/// orchestration methods (`transfer`, `direct_transfer`, `deposit`,
/// `withdraw`) to describe a leg without the caller touching
/// [`NewEntry`] directly.
#[derive(Clone)]
pub struct Party {
    pub wallet_id: WalletId,
    pub currency: Currency,
    pub initiator_kind: InitiatorKind,
    pub initiator_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Party {
    pub fn new(wallet_id: WalletId, currency: Currency, initiator_kind: InitiatorKind) -> Self {
        Self {
            wallet_id,
            currency,
            initiator_kind,
            initiator_id: None,
            ip_address: None,
            user_agent: None,
        }
    }
}

fn flip(entry_type: EntryType) -> EntryType {
    match entry_type {
        EntryType::Debit => EntryType::Credit,
        EntryType::Credit => EntryType::Debit,
        EntryType::Ledger => EntryType::Ledger,
    }
}

fn leg(party: &Party, group_id: Uuid, entry_type: EntryType, status: EntryStatus, amount: i64) -> NewEntry {
    NewEntry {
        wallet_id: party.wallet_id,
        group_id,
        entry_type,
        status,
        amount_minor_units: amount,
        currency: party.currency.clone(),
        initiator_kind: party.initiator_kind,
        initiator_id: party.initiator_id.clone(),
        ip_address: party.ip_address.clone(),
        user_agent: party.user_agent.clone(),
        metadata: None,
    }
}

/// Transaction-group state machine and the transfer/deposit/withdrawal
/// orchestration built on top of it (spec.md §4.3).
pub struct GroupEngine {
    groups: Arc<dyn GroupStore>,
    entries: Arc<dyn EntryStore>,
    wallets: Arc<dyn WalletStore>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl GroupEngine {
    pub fn new(
        groups: Arc<dyn GroupStore>,
        entries: Arc<dyn EntryStore>,
        wallets: Arc<dyn WalletStore>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
    ) -> Self {
        Self {
            groups,
            entries,
            wallets,
            clock,
            ids,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ids(&self) -> &Arc<dyn IdGenerator> {
        &self.ids
    }

    pub fn entry_store(&self) -> &Arc<dyn EntryStore> {
        &self.entries
    }

    pub fn group_store(&self) -> &Arc<dyn GroupStore> {
        &self.groups
    }

    pub async fn create_group(
        &self,
        idempotency_key: Option<&str>,
        merchant_id: Option<String>,
        buyer_id: Option<String>,
        reason: Option<String>,
    ) -> Result<TransactionGroup, LedgerError> {
        let key_hash = idempotency_key.map(hash_key);
        if let Some(ref hash) = key_hash {
            if let Some(existing) = self.groups.find_by_idempotency_key(hash).await? {
                return Ok(existing);
            }
        }
        let id = self.ids.new_id();
        self.groups
            .create_group(id, key_hash, merchant_id, buyer_id, reason)
            .await
    }

    pub async fn get_group(&self, id: Uuid) -> Result<TransactionGroup, LedgerError> {
        self.groups.get_group(id).await
    }

    pub async fn list_group_entries(&self, id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.entries.entries_for_group(id).await
    }

    /// `holdDebit(A, amt, ref)`: requires `available(A) >= amt`; appends
    /// `{A, -amt, DEBIT, HOLD}` and `{E, +amt, CREDIT, HOLD}`.
    pub async fn hold_debit(
        &self,
        group_id: Uuid,
        actor: &Party,
        escrow: &Party,
        amount: i64,
    ) -> Result<(LedgerEntry, LedgerEntry), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        actor.currency.matches(&escrow.currency)?;

        let wallet = self.wallets.lock_for_update(actor.wallet_id).await?;
        wallet.currency.matches(&actor.currency)?;
        let total = self.entries.total_balance(actor.wallet_id).await?;
        let held = self.entries.held_debit(actor.wallet_id).await?;
        let available = total - held;
        if available < amount {
            return Err(LedgerError::InsufficientFunds);
        }

        let debit = leg(actor, group_id, EntryType::Debit, EntryStatus::Hold, -amount);
        let credit = leg(escrow, group_id, EntryType::Credit, EntryStatus::Hold, amount);
        let mut appended = self.entries.append_entries(vec![debit, credit]).await?;
        let second = appended.pop().unwrap();
        let first = appended.pop().unwrap();
        metrics::counter!("ledger.holds.total").increment(1);
        Ok((first, second))
    }

    /// `holdCredit(B, amt, ref)`: no balance check on `B` (incoming).
    pub async fn hold_credit(
        &self,
        group_id: Uuid,
        escrow: &Party,
        recipient: &Party,
        amount: i64,
    ) -> Result<(LedgerEntry, LedgerEntry), LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        escrow.currency.matches(&recipient.currency)?;

        let debit = leg(escrow, group_id, EntryType::Debit, EntryStatus::Hold, -amount);
        let credit = leg(recipient, group_id, EntryType::Credit, EntryStatus::Hold, amount);
        let mut appended = self.entries.append_entries(vec![debit, credit]).await?;
        let second = appended.pop().unwrap();
        let first = appended.pop().unwrap();
        Ok((first, second))
    }

    /// `settleGroup(ref)`: verifies the group is `IN_PROGRESS` and the
    /// HOLD/SETTLED sum is zero, then for every HOLD entry in the group
    /// appends an identical-sign copy with status `SETTLED`.
    pub async fn settle_group(&self, group_id: Uuid) -> Result<TransactionGroup, LedgerError> {
        let group = self.groups.get_group(group_id).await?;
        if group.status != GroupStatus::InProgress {
            return Err(LedgerError::InvalidStateTransition {
                from: group.status.to_string(),
                to: GroupStatus::Settled.to_string(),
            });
        }
        let sum = self.entries.group_hold_settle_sum(group_id).await?;
        if sum != 0 {
            return Err(LedgerError::ReconciliationError(format!(
                "group {group_id} HOLD/SETTLED sum is {sum}, expected 0"
            )));
        }
        let holds: Vec<LedgerEntry> = self
            .entries
            .entries_for_group(group_id)
            .await?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Hold)
            .collect();

        let new_entries = holds
            .iter()
            .map(|hold| NewEntry {
                wallet_id: hold.wallet_id,
                group_id,
                entry_type: hold.entry_type,
                status: EntryStatus::Settled,
                amount_minor_units: hold.amount_minor_units,
                currency: hold.currency.clone(),
                initiator_kind: hold.initiator_kind,
                initiator_id: hold.initiator_id.clone(),
                ip_address: hold.ip_address.clone(),
                user_agent: hold.user_agent.clone(),
                metadata: hold.metadata.clone(),
            })
            .collect();

        let group = self
            .groups
            .transition(group_id, GroupStatus::InProgress, GroupStatus::Settled)
            .await?;
        self.entries.append_entries(new_entries).await?;
        metrics::counter!("ledger.groups.settled").increment(1);
        Ok(group)
    }

    /// `releaseGroup(ref, reason)`.
    pub async fn release_group(&self, group_id: Uuid) -> Result<TransactionGroup, LedgerError> {
        self.offset_group(group_id, GroupStatus::Released, EntryStatus::Released)
            .await
    }

    /// `cancelGroup(ref, reason)`.
    pub async fn cancel_group(&self, group_id: Uuid) -> Result<TransactionGroup, LedgerError> {
        self.offset_group(group_id, GroupStatus::Cancelled, EntryStatus::Cancelled)
            .await
    }

    async fn offset_group(
        &self,
        group_id: Uuid,
        group_status: GroupStatus,
        entry_status: EntryStatus,
    ) -> Result<TransactionGroup, LedgerError> {
        let holds: Vec<LedgerEntry> = self
            .entries
            .entries_for_group(group_id)
            .await?
            .into_iter()
            .filter(|e| e.status == EntryStatus::Hold)
            .collect();

        let offsets = holds
            .iter()
            .map(|hold| NewEntry {
                wallet_id: hold.wallet_id,
                group_id,
                entry_type: flip(hold.entry_type),
                status: entry_status,
                amount_minor_units: -hold.amount_minor_units,
                currency: hold.currency.clone(),
                initiator_kind: hold.initiator_kind,
                initiator_id: hold.initiator_id.clone(),
                ip_address: hold.ip_address.clone(),
                user_agent: hold.user_agent.clone(),
                metadata: hold.metadata.clone(),
            })
            .collect();

        let group = self
            .groups
            .transition(group_id, GroupStatus::InProgress, group_status)
            .await?;
        self.entries.append_entries(offsets).await?;
        Ok(group)
    }

    /// Two-party transfer: `createGroup -> holdDebit(sender) ->
    /// holdCredit(recipient) -> settleGroup`. On any error the group is
    /// cancelled and the error propagated.
    pub async fn transfer(
        &self,
        sender: &Party,
        escrow: &Party,
        recipient: &Party,
        amount: i64,
        idempotency_key: Option<&str>,
    ) -> Result<TransactionGroup, LedgerError> {
        let group = self.create_group(idempotency_key, None, None, None).await?;
        if group.status != GroupStatus::InProgress {
            return Ok(group);
        }
        match self.run_transfer(&group, sender, escrow, recipient, amount).await {
            Ok(()) => self.settle_group(group.id).await,
            Err(e) => {
                let _ = self.cancel_group(group.id).await;
                Err(e)
            }
        }
    }

    async fn run_transfer(
        &self,
        group: &TransactionGroup,
        sender: &Party,
        escrow: &Party,
        recipient: &Party,
        amount: i64,
    ) -> Result<(), LedgerError> {
        self.hold_debit(group.id, sender, escrow, amount).await?;
        self.hold_credit(group.id, escrow, recipient, amount).await?;
        Ok(())
    }

    /// Direct transfer variant: bypasses HOLD, emitting `{-amt, DEBIT,
    /// SETTLED}` + `{+amt, CREDIT, SETTLED}` inside a group that is
    /// immediately SETTLED. Used by deposits/withdrawals where dispute
    /// risk is zero.
    pub async fn direct_transfer(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        idempotency_key: Option<&str>,
        reason: Option<String>,
    ) -> Result<TransactionGroup, LedgerError> {
        self.direct_transfer_with_status(from, to, amount, EntryStatus::Settled, idempotency_key, reason)
            .await
    }

    /// As [`Self::direct_transfer`] but with an explicit entry status.
    /// Entries are append-only — a status can never be patched onto a row
    /// after the fact — so a refund (which writes `REFUNDED`, not
    /// `SETTLED`, entries per spec.md §3) must pick its status at write
    /// time rather than relying on `direct_transfer`'s default.
    pub async fn direct_transfer_with_status(
        &self,
        from: &Party,
        to: &Party,
        amount: i64,
        status: EntryStatus,
        idempotency_key: Option<&str>,
        reason: Option<String>,
    ) -> Result<TransactionGroup, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount);
        }
        from.currency.matches(&to.currency)?;
        let group = self
            .create_group(idempotency_key, None, None, reason)
            .await?;
        if group.status != GroupStatus::InProgress {
            return Ok(group);
        }
        let debit = leg(from, group.id, EntryType::Debit, status, -amount);
        let credit = leg(to, group.id, EntryType::Credit, status, amount);
        self.entries.append_entries(vec![debit, credit]).await?;
        self.groups
            .transition(group.id, GroupStatus::InProgress, GroupStatus::Settled)
            .await
    }

    /// Deposit: source = DEPOSIT system wallet, sink = `wallet`. Direct
    /// transfer — the DEPOSIT wallet accumulates a negative balance
    /// representing external liabilities.
    pub async fn deposit(
        &self,
        deposit_wallet: &Party,
        wallet: &Party,
        amount: i64,
        external_ref: Option<&str>,
    ) -> Result<TransactionGroup, LedgerError> {
        self.direct_transfer(
            deposit_wallet,
            wallet,
            amount,
            external_ref,
            Some("deposit".to_string()),
        )
        .await
    }

    /// Withdrawal: source = `wallet` (balance checked), sink =
    /// WITHDRAWAL system wallet. Two-phase transfer via
    /// `escrow`-free hold (the withdrawal wallet itself stands in for
    /// escrow, since no third party is involved): hold the debit,
    /// hold the matching credit on the withdrawal wallet, then settle.
    /// The WITHDRAWAL wallet accumulates a positive balance representing
    /// outflows.
    pub async fn withdraw(
        &self,
        wallet: &Party,
        withdrawal_wallet: &Party,
        amount: i64,
        destination: Option<&str>,
    ) -> Result<TransactionGroup, LedgerError> {
        self.transfer(wallet, withdrawal_wallet, withdrawal_wallet, amount, destination)
            .await
    }

    /// Bounded page of the stale-group-cancel sweep: cancels
    /// `IN_PROGRESS` groups whose holds are older than `older_than`.
    pub async fn cancel_stale_groups_page(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, LedgerError> {
        let stale = self.groups.stale_groups(older_than, limit).await?;
        let mut cancelled = 0;
        for group in stale {
            self.cancel_group(group.id).await?;
            cancelled += 1;
        }
        Ok(cancelled)
    }
}

fn hash_key(key: &str) -> String {
    blake3::hash(key.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flip_swaps_debit_and_credit() {
        assert_eq!(flip(EntryType::Debit), EntryType::Credit);
        assert_eq!(flip(EntryType::Credit), EntryType::Debit);
        assert_eq!(flip(EntryType::Ledger), EntryType::Ledger);
    }

    #[test]
    fn hash_key_is_deterministic() {
        assert_eq!(hash_key("abc"), hash_key("abc"));
        assert_ne!(hash_key("abc"), hash_key("abd"));
    }
}
