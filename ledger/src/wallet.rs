use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::currency::Currency;
use crate::error::LedgerError;
use crate::store::WalletStore;

/// Dense, store-assigned wallet identifier.
pub type WalletId = i64;

/// Who a wallet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OwnerKind {
    User,
    Merchant,
    System,
}

/// What a wallet is for. `System` wallets back the ledger's own
/// housekeeping (fee collection, escrow, suspense); they are created
/// lazily and exactly once per `(wallet_type, description)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletType {
    User,
    Merchant,
    Escrow,
    System,
}

impl WalletType {
    /// The owner kind a wallet of this type must carry. `User` and
    /// `Merchant` wallets are owned by the matching party; `Escrow` and
    /// `System` wallets are always system-owned, never attributed to a
    /// specific user or merchant.
    pub fn required_owner_kind(self) -> OwnerKind {
        match self {
            WalletType::User => OwnerKind::User,
            WalletType::Merchant => OwnerKind::Merchant,
            WalletType::Escrow | WalletType::System => OwnerKind::System,
        }
    }
}

impl fmt::Display for WalletType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WalletType::User => "USER",
            WalletType::Merchant => "MERCHANT",
            WalletType::Escrow => "ESCROW",
            WalletType::System => "SYSTEM",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub wallet_type: WalletType,
    pub owner_kind: OwnerKind,
    pub owner_id: Option<String>,
    pub currency: Currency,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

pub struct NewWallet {
    pub wallet_type: WalletType,
    pub owner_kind: OwnerKind,
    pub owner_id: Option<String>,
    pub currency: Currency,
    pub description: String,
}

impl NewWallet {
    fn validate(&self) -> Result<(), LedgerError> {
        if self.owner_kind != self.wallet_type.required_owner_kind() {
            return Err(LedgerError::InvalidOwnership(format!(
                "{} wallets must be owned by {:?}, got {:?}",
                self.wallet_type,
                self.wallet_type.required_owner_kind(),
                self.owner_kind
            )));
        }
        let owner_required = matches!(self.wallet_type, WalletType::User | WalletType::Merchant);
        if owner_required && self.owner_id.is_none() {
            return Err(LedgerError::InvalidOwnership(format!(
                "{} wallets must carry an owner_id",
                self.wallet_type
            )));
        }
        if !owner_required && self.owner_id.is_some() {
            return Err(LedgerError::InvalidOwnership(format!(
                "{} wallets must not carry an owner_id",
                self.wallet_type
            )));
        }
        Ok(())
    }
}

/// Wallet creation and lookup, spec.md §4.1.
pub struct WalletRegistry {
    store: Arc<dyn WalletStore>,
}

impl WalletRegistry {
    pub fn new(store: Arc<dyn WalletStore>) -> Self {
        Self { store }
    }

    /// Creates a USER or MERCHANT wallet. Fails the ownership invariant
    /// check before ever reaching the store.
    pub async fn open_wallet(
        &self,
        wallet_type: WalletType,
        owner_kind: OwnerKind,
        owner_id: String,
        currency: Currency,
        description: String,
    ) -> Result<Wallet, LedgerError> {
        if !matches!(wallet_type, WalletType::User | WalletType::Merchant) {
            return Err(LedgerError::InvalidOwnership(
                "open_wallet only creates USER or MERCHANT wallets; system wallets are obtained via system_wallet".into(),
            ));
        }
        let new_wallet = NewWallet {
            wallet_type,
            owner_kind,
            owner_id: Some(owner_id),
            currency,
            description,
        };
        new_wallet.validate()?;
        self.store.insert_wallet(new_wallet).await
    }

    /// Returns the singleton SYSTEM/ESCROW wallet for `(wallet_type,
    /// description)`, creating it the first time it's requested. The
    /// uniqueness is enforced by the store (a unique index on
    /// `(wallet_type, description)` for non-owned wallets), so a race
    /// between two callers resolves to the same row rather than two.
    pub async fn system_wallet(
        &self,
        wallet_type: WalletType,
        currency: Currency,
        description: &str,
    ) -> Result<Wallet, LedgerError> {
        if wallet_type.required_owner_kind() != OwnerKind::System {
            return Err(LedgerError::InvalidOwnership(format!(
                "{wallet_type} is not a system-owned wallet type"
            )));
        }
        if let Some(existing) = self
            .store
            .find_system_wallet(wallet_type, description)
            .await?
        {
            return Ok(existing);
        }
        let new_wallet = NewWallet {
            wallet_type,
            owner_kind: OwnerKind::System,
            owner_id: None,
            currency,
            description: description.to_string(),
        };
        new_wallet.validate()?;
        self.store.insert_or_get_system_wallet(new_wallet).await
    }

    pub async fn get_wallet(&self, id: WalletId) -> Result<Wallet, LedgerError> {
        self.store.get_wallet(id).await
    }

    /// Resolves a USER or MERCHANT wallet by owner id. Returns
    /// `WalletNotFound` if the owner has no wallet yet; callers that need
    /// one provisioned call `open_wallet` first.
    pub async fn wallet_for_owner(
        &self,
        wallet_type: WalletType,
        owner_id: &str,
    ) -> Result<Wallet, LedgerError> {
        self.store
            .find_by_owner(wallet_type, owner_id)
            .await?
            .ok_or_else(|| LedgerError::InvalidOwnership(format!(
                "no {wallet_type} wallet for owner {owner_id}"
            )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_owner_kind_matches_wallet_type() {
        assert_eq!(WalletType::User.required_owner_kind(), OwnerKind::User);
        assert_eq!(
            WalletType::Merchant.required_owner_kind(),
            OwnerKind::Merchant
        );
        assert_eq!(WalletType::Escrow.required_owner_kind(), OwnerKind::System);
        assert_eq!(WalletType::System.required_owner_kind(), OwnerKind::System);
    }

    #[test]
    fn new_wallet_rejects_mismatched_owner_kind() {
        let nw = NewWallet {
            wallet_type: WalletType::User,
            owner_kind: OwnerKind::System,
            owner_id: None,
            currency: Currency::parse("USD").unwrap(),
            description: "bad".into(),
        };
        assert!(nw.validate().is_err());
    }

    #[test]
    fn new_wallet_rejects_owner_id_on_system_wallet() {
        let nw = NewWallet {
            wallet_type: WalletType::Escrow,
            owner_kind: OwnerKind::System,
            owner_id: Some("should-not-be-here".into()),
            currency: Currency::parse("USD").unwrap(),
            description: "escrow".into(),
        };
        assert!(nw.validate().is_err());
    }
}
