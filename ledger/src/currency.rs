use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

/// A validated three-letter ISO-4217-shaped currency code.
///
/// Wallets are single-currency (no FX, no multi-asset valuation); keeping
/// this as a small validated type rather than a bare `String` means a
/// currency mismatch is caught the moment two amounts are compared, not
/// three layers down inside a SQL constraint violation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    pub fn parse(code: &str) -> Result<Self, LedgerError> {
        let upper = code.to_ascii_uppercase();
        if upper.len() == 3 && upper.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(upper))
        } else {
            Err(LedgerError::InvalidOwnership(format!(
                "invalid currency code: {code}"
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, other: &Currency) -> Result<(), LedgerError> {
        if self == other {
            Ok(())
        } else {
            Err(LedgerError::CurrencyMismatch {
                expected: self.0.clone(),
                actual: other.0.clone(),
            })
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
