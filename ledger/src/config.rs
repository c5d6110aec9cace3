/// Where a refund reserve's held funds are taken from.
///
/// Spec left this as an open question; this crate resolves it as an
/// explicit choice rather than a silent default, since the two options
/// have different balance-sheet consequences. `Escrow` is the recommended
/// choice: it keeps a merchant's available balance untouched until a
/// refund is actually issued, which matches treating the reserve as
/// escrow-like withholding rather than an immediate debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveSource {
    /// Reserve funds are held in a dedicated ESCROW system wallet,
    /// separate from the merchant's operational balance.
    Escrow,
    /// Reserve funds are withheld directly from the merchant's own wallet.
    MerchantBalance,
}

/// Every tunable this crate needs. There is no `Default` impl: a caller
/// supplying the wrong commission rate or reserve rate is a financial bug,
/// not a missing convenience, so every field must be supplied explicitly.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Merchant settlement commission, scaled by [`crate::money::RATE_SCALE`]
    /// (four fractional digits): `290` for 2.9%.
    pub commission_rate: i64,
    /// Minimum payout amount (minor units) below which a settlement is
    /// skipped for a merchant until more volume accrues.
    pub settlement_min_amount: i64,
    /// Minimum age (days) a HOLD must reach before it is eligible for
    /// the stale-group cancellation sweep.
    pub hold_age_days: i64,
    /// Whether settlements withhold a refund reserve at all. When
    /// `false`, `executeSettlement` pays the merchant's full `net` with
    /// no follow-up reserve step.
    pub reserve_enabled: bool,
    /// Fraction of a settlement's net amount withheld into a refund
    /// reserve, scaled by [`crate::money::RATE_SCALE`]: `1_000` for 10%.
    pub reserve_rate: i64,
    /// How long (days) a refund reserve is held before it is eligible
    /// for release back to the merchant.
    pub reserve_hold_days: i64,
    /// How many days after settlement a refund may still be requested.
    pub refund_window_days: i64,
    /// Where refund reserves draw their held funds from.
    pub reserve_source: ReserveSource,
}

impl LedgerConfig {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        commission_rate: i64,
        settlement_min_amount: i64,
        hold_age_days: i64,
        reserve_enabled: bool,
        reserve_rate: i64,
        reserve_hold_days: i64,
        refund_window_days: i64,
        reserve_source: ReserveSource,
    ) -> Self {
        Self {
            commission_rate,
            settlement_min_amount,
            hold_age_days,
            reserve_enabled,
            reserve_rate,
            reserve_hold_days,
            refund_window_days,
            reserve_source,
        }
    }
}
