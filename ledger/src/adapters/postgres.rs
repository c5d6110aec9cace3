use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::entry::{EntryId, EntryStatus, EntryType, InitiatorKind, LedgerEntry, NewEntry, Tier};
use crate::error::LedgerError;
use crate::group::{GroupStatus, TransactionGroup};
use crate::refund::{
    NewRefund, NewRefundReserve, Refund, RefundInitiator, RefundReserve, RefundReserveStatus, RefundStatus,
    RefundType,
};
use crate::settlement::{NewSettlement, Settlement, SettlementStatus};
use crate::store::{EntryStore, GroupStore, RefundStore, SettlementStore, WalletStore};
use crate::wallet::{NewWallet, OwnerKind, Wallet, WalletId, WalletType};

/// Postgres-backed implementation of every store port. Holds a pool
/// rather than a single connection; callers that need atomicity across
/// several of these calls (settlement execution, refund creation) are
/// expected to compose them inside one `pool.begin()` transaction at a
/// layer above this adapter, the way spec.md §5's concurrency model
/// assumes — this struct itself does not open transactions per call.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates every table and index this crate needs if they do not
    /// already exist. Safe to call repeatedly (e.g. once per test
    /// process against a fresh container).
    pub async fn init_schema(&self) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS wallet (
                id BIGSERIAL PRIMARY KEY,
                wallet_type TEXT NOT NULL CHECK (wallet_type IN ('USER','MERCHANT','ESCROW','SYSTEM')),
                owner_kind TEXT NOT NULL CHECK (owner_kind IN ('USER','MERCHANT','SYSTEM')),
                owner_id TEXT,
                currency TEXT NOT NULL,
                description TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_owner
            ON wallet (wallet_type, owner_id) WHERE owner_id IS NOT NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_wallet_system
            ON wallet (wallet_type, description) WHERE owner_id IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transaction_group (
                id UUID PRIMARY KEY,
                status TEXT NOT NULL CHECK (status IN ('IN_PROGRESS','SETTLED','RELEASED','CANCELLED')),
                merchant_id TEXT,
                buyer_id TEXT,
                reason TEXT,
                idempotency_key_hash TEXT UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_transaction_group_stale
            ON transaction_group (created_at) WHERE status = 'IN_PROGRESS'
            "#,
        )
        .execute(&mut *tx)
        .await?;

        // Three genuinely separate tables for the three storage tiers —
        // a row moves hot -> warm -> cold by being copied into the next
        // table and deleted from the last, never by an UPDATE to a tier
        // column. All three share one id sequence so an entry id stays
        // unique and monotonic no matter which table currently holds it.
        sqlx::query("CREATE SEQUENCE IF NOT EXISTS ledger_entry_id_seq")
            .execute(&mut *tx)
            .await?;

        let entry_columns = r#"
                id BIGINT PRIMARY KEY DEFAULT nextval('ledger_entry_id_seq'),
                wallet_id BIGINT NOT NULL REFERENCES wallet(id),
                group_id UUID NOT NULL REFERENCES transaction_group(id),
                entry_type TEXT NOT NULL CHECK (entry_type IN ('DEBIT','CREDIT','LEDGER')),
                status TEXT NOT NULL CHECK (status IN ('HOLD','SETTLED','RELEASED','CANCELLED','REFUNDED')),
                amount_minor_units BIGINT NOT NULL CHECK (
                    (entry_type = 'DEBIT' AND amount_minor_units <= 0)
                    OR (entry_type = 'CREDIT' AND amount_minor_units >= 0)
                    OR entry_type = 'LEDGER'
                ),
                currency TEXT NOT NULL,
                initiator_kind TEXT NOT NULL CHECK (initiator_kind IN ('SYSTEM','USER','MERCHANT','ADMIN')),
                initiator_id TEXT,
                ip_address TEXT,
                user_agent TEXT,
                metadata JSONB,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                settled_at TIMESTAMPTZ,
                snapshot_date DATE
        "#;

        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS transaction ({entry_columns})"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS transaction_snapshot ({entry_columns})"))
            .execute(&mut *tx)
            .await?;
        sqlx::query(&format!("CREATE TABLE IF NOT EXISTS transaction_snapshot_archive ({entry_columns})"))
            .execute(&mut *tx)
            .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transaction_wallet ON transaction (wallet_id, id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_transaction_group ON transaction (group_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transaction_snapshot_wallet ON transaction_snapshot (wallet_id, id)",
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transaction_snapshot_archive_wallet \
             ON transaction_snapshot_archive (wallet_id, id)",
        )
        .execute(&mut *tx)
        .await?;

        // Hot and warm reject UPDATEs outright; cold additionally rejects
        // DELETEs. The adapter's own move/archive methods only ever
        // INSERT into the next tier and DELETE from the last, so none of
        // this fires against legitimate traffic.
        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION ledger_reject_update() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION '% rows are append-only and cannot be updated', TG_TABLE_NAME;
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            CREATE OR REPLACE FUNCTION ledger_reject_write() RETURNS trigger AS $$
            BEGIN
                RAISE EXCEPTION '% rows are immutable and cannot be updated or deleted', TG_TABLE_NAME;
            END;
            $$ LANGUAGE plpgsql
            "#,
        )
        .execute(&mut *tx)
        .await?;

        for table in ["transaction", "transaction_snapshot"] {
            sqlx::query(&format!("DROP TRIGGER IF EXISTS trg_{table}_no_update ON {table}"))
                .execute(&mut *tx)
                .await?;
            sqlx::query(&format!(
                "CREATE TRIGGER trg_{table}_no_update BEFORE UPDATE ON {table} \
                 FOR EACH ROW EXECUTE FUNCTION ledger_reject_update()"
            ))
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query("DROP TRIGGER IF EXISTS trg_transaction_snapshot_archive_no_write ON transaction_snapshot_archive")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            CREATE TRIGGER trg_transaction_snapshot_archive_no_write
            BEFORE UPDATE OR DELETE ON transaction_snapshot_archive
            FOR EACH ROW EXECUTE FUNCTION ledger_reject_write()
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries_tracking (
                checkpoint_id BIGINT NOT NULL,
                original_entry_id BIGINT NOT NULL
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement (
                id UUID PRIMARY KEY,
                merchant_id TEXT NOT NULL,
                total BIGINT NOT NULL,
                fee BIGINT NOT NULL,
                net BIGINT NOT NULL,
                commission_rate BIGINT NOT NULL,
                group_count BIGINT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('PENDING','COMPLETED','FAILED')),
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                settled_at TIMESTAMPTZ,
                settlement_group_id UUID REFERENCES transaction_group(id),
                idempotency_key_hash TEXT UNIQUE
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_settlement_merchant ON settlement (merchant_id, created_at)")
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settlement_transaction_group (
                settlement_id UUID NOT NULL REFERENCES settlement(id),
                group_id UUID NOT NULL UNIQUE REFERENCES transaction_group(id),
                amount BIGINT NOT NULL,
                PRIMARY KEY (settlement_id, group_id)
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refund_reserve (
                id UUID PRIMARY KEY,
                settlement_id UUID NOT NULL UNIQUE REFERENCES settlement(id),
                merchant_id TEXT NOT NULL,
                reserve_wallet_id BIGINT NOT NULL REFERENCES wallet(id),
                reserved BIGINT NOT NULL,
                used BIGINT NOT NULL DEFAULT 0,
                reserve_group_id UUID NOT NULL REFERENCES transaction_group(id),
                status TEXT NOT NULL CHECK (status IN ('ACTIVE','PARTIALLY_USED','FULLY_USED','RELEASED')),
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                expires_at TIMESTAMPTZ NOT NULL,
                released_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_refund_reserve_expiry
            ON refund_reserve (expires_at) WHERE status IN ('ACTIVE','PARTIALLY_USED')
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS refund (
                id UUID PRIMARY KEY,
                order_group_id UUID NOT NULL REFERENCES transaction_group(id),
                settlement_id UUID REFERENCES settlement(id),
                merchant_id TEXT NOT NULL,
                merchant_wallet_id BIGINT NOT NULL REFERENCES wallet(id),
                buyer_id TEXT NOT NULL,
                buyer_wallet_id BIGINT NOT NULL REFERENCES wallet(id),
                amount BIGINT NOT NULL CHECK (amount > 0),
                original_amount BIGINT NOT NULL,
                reason TEXT,
                status TEXT NOT NULL CHECK (
                    status IN ('PENDING','PENDING_FUNDS','PROCESSING','COMPLETED','REJECTED','FAILED','EXPIRED')
                ),
                initiator TEXT NOT NULL CHECK (initiator IN ('SYSTEM','MERCHANT','ADMIN')),
                refund_group_id UUID REFERENCES transaction_group(id),
                idempotency_key_hash TEXT UNIQUE,
                refund_type TEXT NOT NULL CHECK (refund_type IN ('FULL','PARTIAL')),
                currency TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                processed_at TIMESTAMPTZ,
                expires_at TIMESTAMPTZ
            )
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_refund_order ON refund (order_group_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_refund_merchant ON refund (merchant_id, created_at)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_refund_pending_funds
            ON refund (expires_at) WHERE status = 'PENDING_FUNDS'
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

fn wallet_type_str(t: WalletType) -> &'static str {
    match t {
        WalletType::User => "USER",
        WalletType::Merchant => "MERCHANT",
        WalletType::Escrow => "ESCROW",
        WalletType::System => "SYSTEM",
    }
}

fn parse_wallet_type(s: &str) -> Result<WalletType, LedgerError> {
    match s {
        "USER" => Ok(WalletType::User),
        "MERCHANT" => Ok(WalletType::Merchant),
        "ESCROW" => Ok(WalletType::Escrow),
        "SYSTEM" => Ok(WalletType::System),
        other => Err(LedgerError::StoreUnavailable(format!("unknown wallet_type {other}"))),
    }
}

fn owner_kind_str(k: OwnerKind) -> &'static str {
    match k {
        OwnerKind::User => "USER",
        OwnerKind::Merchant => "MERCHANT",
        OwnerKind::System => "SYSTEM",
    }
}

fn parse_owner_kind(s: &str) -> Result<OwnerKind, LedgerError> {
    match s {
        "USER" => Ok(OwnerKind::User),
        "MERCHANT" => Ok(OwnerKind::Merchant),
        "SYSTEM" => Ok(OwnerKind::System),
        other => Err(LedgerError::StoreUnavailable(format!("unknown owner_kind {other}"))),
    }
}

fn entry_type_str(t: EntryType) -> &'static str {
    match t {
        EntryType::Debit => "DEBIT",
        EntryType::Credit => "CREDIT",
        EntryType::Ledger => "LEDGER",
    }
}

fn parse_entry_type(s: &str) -> Result<EntryType, LedgerError> {
    match s {
        "DEBIT" => Ok(EntryType::Debit),
        "CREDIT" => Ok(EntryType::Credit),
        "LEDGER" => Ok(EntryType::Ledger),
        other => Err(LedgerError::StoreUnavailable(format!("unknown entry_type {other}"))),
    }
}

fn entry_status_str(s: EntryStatus) -> &'static str {
    match s {
        EntryStatus::Hold => "HOLD",
        EntryStatus::Settled => "SETTLED",
        EntryStatus::Released => "RELEASED",
        EntryStatus::Cancelled => "CANCELLED",
        EntryStatus::Refunded => "REFUNDED",
    }
}

fn parse_entry_status(s: &str) -> Result<EntryStatus, LedgerError> {
    match s {
        "HOLD" => Ok(EntryStatus::Hold),
        "SETTLED" => Ok(EntryStatus::Settled),
        "RELEASED" => Ok(EntryStatus::Released),
        "CANCELLED" => Ok(EntryStatus::Cancelled),
        "REFUNDED" => Ok(EntryStatus::Refunded),
        other => Err(LedgerError::StoreUnavailable(format!("unknown entry_status {other}"))),
    }
}

fn initiator_kind_str(k: InitiatorKind) -> &'static str {
    match k {
        InitiatorKind::System => "SYSTEM",
        InitiatorKind::User => "USER",
        InitiatorKind::Merchant => "MERCHANT",
        InitiatorKind::Admin => "ADMIN",
    }
}

fn parse_initiator_kind(s: &str) -> Result<InitiatorKind, LedgerError> {
    match s {
        "SYSTEM" => Ok(InitiatorKind::System),
        "USER" => Ok(InitiatorKind::User),
        "MERCHANT" => Ok(InitiatorKind::Merchant),
        "ADMIN" => Ok(InitiatorKind::Admin),
        other => Err(LedgerError::StoreUnavailable(format!("unknown initiator_kind {other}"))),
    }
}

fn group_status_str(s: GroupStatus) -> &'static str {
    match s {
        GroupStatus::InProgress => "IN_PROGRESS",
        GroupStatus::Settled => "SETTLED",
        GroupStatus::Released => "RELEASED",
        GroupStatus::Cancelled => "CANCELLED",
    }
}

fn parse_group_status(s: &str) -> Result<GroupStatus, LedgerError> {
    match s {
        "IN_PROGRESS" => Ok(GroupStatus::InProgress),
        "SETTLED" => Ok(GroupStatus::Settled),
        "RELEASED" => Ok(GroupStatus::Released),
        "CANCELLED" => Ok(GroupStatus::Cancelled),
        other => Err(LedgerError::StoreUnavailable(format!("unknown group_status {other}"))),
    }
}

fn settlement_status_str(s: SettlementStatus) -> &'static str {
    match s {
        SettlementStatus::Pending => "PENDING",
        SettlementStatus::Completed => "COMPLETED",
        SettlementStatus::Failed => "FAILED",
    }
}

fn parse_settlement_status(s: &str) -> Result<SettlementStatus, LedgerError> {
    match s {
        "PENDING" => Ok(SettlementStatus::Pending),
        "COMPLETED" => Ok(SettlementStatus::Completed),
        "FAILED" => Ok(SettlementStatus::Failed),
        other => Err(LedgerError::StoreUnavailable(format!("unknown settlement_status {other}"))),
    }
}

fn reserve_status_str(s: RefundReserveStatus) -> &'static str {
    match s {
        RefundReserveStatus::Active => "ACTIVE",
        RefundReserveStatus::PartiallyUsed => "PARTIALLY_USED",
        RefundReserveStatus::FullyUsed => "FULLY_USED",
        RefundReserveStatus::Released => "RELEASED",
    }
}

fn parse_reserve_status(s: &str) -> Result<RefundReserveStatus, LedgerError> {
    match s {
        "ACTIVE" => Ok(RefundReserveStatus::Active),
        "PARTIALLY_USED" => Ok(RefundReserveStatus::PartiallyUsed),
        "FULLY_USED" => Ok(RefundReserveStatus::FullyUsed),
        "RELEASED" => Ok(RefundReserveStatus::Released),
        other => Err(LedgerError::StoreUnavailable(format!("unknown reserve_status {other}"))),
    }
}

fn refund_status_str(s: RefundStatus) -> &'static str {
    match s {
        RefundStatus::Pending => "PENDING",
        RefundStatus::PendingFunds => "PENDING_FUNDS",
        RefundStatus::Processing => "PROCESSING",
        RefundStatus::Completed => "COMPLETED",
        RefundStatus::Rejected => "REJECTED",
        RefundStatus::Failed => "FAILED",
        RefundStatus::Expired => "EXPIRED",
    }
}

fn parse_refund_status(s: &str) -> Result<RefundStatus, LedgerError> {
    match s {
        "PENDING" => Ok(RefundStatus::Pending),
        "PENDING_FUNDS" => Ok(RefundStatus::PendingFunds),
        "PROCESSING" => Ok(RefundStatus::Processing),
        "COMPLETED" => Ok(RefundStatus::Completed),
        "REJECTED" => Ok(RefundStatus::Rejected),
        "FAILED" => Ok(RefundStatus::Failed),
        "EXPIRED" => Ok(RefundStatus::Expired),
        other => Err(LedgerError::StoreUnavailable(format!("unknown refund_status {other}"))),
    }
}

fn refund_initiator_str(i: RefundInitiator) -> &'static str {
    match i {
        RefundInitiator::System => "SYSTEM",
        RefundInitiator::Merchant => "MERCHANT",
        RefundInitiator::Admin => "ADMIN",
    }
}

fn parse_refund_initiator(s: &str) -> Result<RefundInitiator, LedgerError> {
    match s {
        "SYSTEM" => Ok(RefundInitiator::System),
        "MERCHANT" => Ok(RefundInitiator::Merchant),
        "ADMIN" => Ok(RefundInitiator::Admin),
        other => Err(LedgerError::StoreUnavailable(format!("unknown refund_initiator {other}"))),
    }
}

fn refund_type_str(t: RefundType) -> &'static str {
    match t {
        RefundType::Full => "FULL",
        RefundType::Partial => "PARTIAL",
    }
}

fn parse_refund_type(s: &str) -> Result<RefundType, LedgerError> {
    match s {
        "FULL" => Ok(RefundType::Full),
        "PARTIAL" => Ok(RefundType::Partial),
        other => Err(LedgerError::StoreUnavailable(format!("unknown refund_type {other}"))),
    }
}

fn wallet_from_row(row: &sqlx::postgres::PgRow) -> Result<Wallet, LedgerError> {
    Ok(Wallet {
        id: row.try_get("id")?,
        wallet_type: parse_wallet_type(row.try_get("wallet_type")?)?,
        owner_kind: parse_owner_kind(row.try_get("owner_kind")?)?,
        owner_id: row.try_get("owner_id")?,
        currency: crate::currency::Currency::parse(row.try_get("currency")?)?,
        description: row.try_get("description")?,
        created_at: row.try_get("created_at")?,
    })
}

/// `tier` is no longer a stored column — it is which of the three tables
/// the row was read from, so the caller supplies it.
fn entry_from_row(row: &sqlx::postgres::PgRow, tier: Tier) -> Result<LedgerEntry, LedgerError> {
    Ok(LedgerEntry {
        id: row.try_get("id")?,
        wallet_id: row.try_get("wallet_id")?,
        group_id: row.try_get("group_id")?,
        entry_type: parse_entry_type(row.try_get("entry_type")?)?,
        status: parse_entry_status(row.try_get("status")?)?,
        amount_minor_units: row.try_get("amount_minor_units")?,
        currency: crate::currency::Currency::parse(row.try_get("currency")?)?,
        tier,
        initiator_kind: parse_initiator_kind(row.try_get("initiator_kind")?)?,
        initiator_id: row.try_get("initiator_id")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        metadata: row.try_get("metadata")?,
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
        snapshot_date: row.try_get("snapshot_date")?,
    })
}

fn tier_table(tier: Tier) -> &'static str {
    match tier {
        Tier::Hot => "transaction",
        Tier::Warm => "transaction_snapshot",
        Tier::Cold => "transaction_snapshot_archive",
    }
}

fn group_from_row(row: &sqlx::postgres::PgRow) -> Result<TransactionGroup, LedgerError> {
    Ok(TransactionGroup {
        id: row.try_get("id")?,
        status: parse_group_status(row.try_get("status")?)?,
        merchant_id: row.try_get("merchant_id")?,
        buyer_id: row.try_get("buyer_id")?,
        reason: row.try_get("reason")?,
        idempotency_key_hash: row.try_get("idempotency_key_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn settlement_from_row(row: &sqlx::postgres::PgRow) -> Result<Settlement, LedgerError> {
    Ok(Settlement {
        id: row.try_get("id")?,
        merchant_id: row.try_get("merchant_id")?,
        total: row.try_get("total")?,
        fee: row.try_get("fee")?,
        net: row.try_get("net")?,
        commission_rate: row.try_get("commission_rate")?,
        group_count: row.try_get("group_count")?,
        status: parse_settlement_status(row.try_get("status")?)?,
        currency: crate::currency::Currency::parse(row.try_get("currency")?)?,
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
        settlement_group_id: row.try_get("settlement_group_id")?,
        idempotency_key_hash: row.try_get("idempotency_key_hash")?,
    })
}

fn reserve_from_row(row: &sqlx::postgres::PgRow) -> Result<RefundReserve, LedgerError> {
    Ok(RefundReserve {
        id: row.try_get("id")?,
        settlement_id: row.try_get("settlement_id")?,
        merchant_id: row.try_get("merchant_id")?,
        reserve_wallet_id: row.try_get("reserve_wallet_id")?,
        reserved: row.try_get("reserved")?,
        used: row.try_get("used")?,
        reserve_group_id: row.try_get("reserve_group_id")?,
        status: parse_reserve_status(row.try_get("status")?)?,
        currency: crate::currency::Currency::parse(row.try_get("currency")?)?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        released_at: row.try_get("released_at")?,
    })
}

fn refund_from_row(row: &sqlx::postgres::PgRow) -> Result<Refund, LedgerError> {
    Ok(Refund {
        id: row.try_get("id")?,
        order_group_id: row.try_get("order_group_id")?,
        settlement_id: row.try_get("settlement_id")?,
        merchant_id: row.try_get("merchant_id")?,
        merchant_wallet_id: row.try_get("merchant_wallet_id")?,
        buyer_id: row.try_get("buyer_id")?,
        buyer_wallet_id: row.try_get("buyer_wallet_id")?,
        amount: row.try_get("amount")?,
        original_amount: row.try_get("original_amount")?,
        reason: row.try_get("reason")?,
        status: parse_refund_status(row.try_get("status")?)?,
        initiator: parse_refund_initiator(row.try_get("initiator")?)?,
        refund_group_id: row.try_get("refund_group_id")?,
        idempotency_key_hash: row.try_get("idempotency_key_hash")?,
        refund_type: parse_refund_type(row.try_get("refund_type")?)?,
        currency: crate::currency::Currency::parse(row.try_get("currency")?)?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        expires_at: row.try_get("expires_at")?,
    })
}

#[async_trait]
impl WalletStore for PostgresStore {
    async fn insert_wallet(&self, wallet: NewWallet) -> Result<Wallet, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO wallet (wallet_type, owner_kind, owner_id, currency, description)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(wallet_type_str(wallet.wallet_type))
        .bind(owner_kind_str(wallet.owner_kind))
        .bind(&wallet.owner_id)
        .bind(wallet.currency.as_str())
        .bind(&wallet.description)
        .fetch_one(&self.pool)
        .await?;
        wallet_from_row(&row)
    }

    async fn get_wallet(&self, id: WalletId) -> Result<Wallet, LedgerError> {
        let row = sqlx::query("SELECT * FROM wallet WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::WalletNotFound(id))?;
        wallet_from_row(&row)
    }

    async fn find_by_owner(
        &self,
        wallet_type: WalletType,
        owner_id: &str,
    ) -> Result<Option<Wallet>, LedgerError> {
        let row = sqlx::query("SELECT * FROM wallet WHERE wallet_type = $1 AND owner_id = $2")
            .bind(wallet_type_str(wallet_type))
            .bind(owner_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn find_system_wallet(
        &self,
        wallet_type: WalletType,
        description: &str,
    ) -> Result<Option<Wallet>, LedgerError> {
        let row = sqlx::query("SELECT * FROM wallet WHERE wallet_type = $1 AND description = $2 AND owner_id IS NULL")
            .bind(wallet_type_str(wallet_type))
            .bind(description)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(wallet_from_row).transpose()
    }

    async fn insert_or_get_system_wallet(&self, wallet: NewWallet) -> Result<Wallet, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO wallet (wallet_type, owner_kind, owner_id, currency, description)
            VALUES ($1, $2, NULL, $3, $4)
            ON CONFLICT (wallet_type, description) WHERE owner_id IS NULL DO UPDATE SET description = EXCLUDED.description
            RETURNING *
            "#,
        )
        .bind(wallet_type_str(wallet.wallet_type))
        .bind(owner_kind_str(wallet.owner_kind))
        .bind(wallet.currency.as_str())
        .bind(&wallet.description)
        .fetch_one(&self.pool)
        .await?;
        wallet_from_row(&row)
    }

    async fn lock_for_update(&self, id: WalletId) -> Result<Wallet, LedgerError> {
        let row = sqlx::query("SELECT * FROM wallet WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::WalletNotFound(id))?;
        wallet_from_row(&row)
    }
}

#[async_trait]
impl EntryStore for PostgresStore {
    async fn append_entries(&self, entries: Vec<NewEntry>) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::with_capacity(entries.len());
        for ne in entries {
            let row = sqlx::query(
                r#"
                INSERT INTO transaction (
                    wallet_id, group_id, entry_type, status, amount_minor_units, currency,
                    initiator_kind, initiator_id, ip_address, user_agent, metadata, settled_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                RETURNING *
                "#,
            )
            .bind(ne.wallet_id)
            .bind(ne.group_id)
            .bind(entry_type_str(ne.entry_type))
            .bind(entry_status_str(ne.status))
            .bind(ne.amount_minor_units)
            .bind(ne.currency.as_str())
            .bind(initiator_kind_str(ne.initiator_kind))
            .bind(&ne.initiator_id)
            .bind(&ne.ip_address)
            .bind(&ne.user_agent)
            .bind(&ne.metadata)
            .bind(finalizes_balance(ne.status).then(Utc::now))
            .fetch_one(&self.pool)
            .await?;
            out.push(entry_from_row(&row, Tier::Hot)?);
        }
        Ok(out)
    }

    async fn entries_for_group(&self, group_id: Uuid) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::new();
        for (table, tier) in [
            ("transaction", Tier::Hot),
            ("transaction_snapshot", Tier::Warm),
            ("transaction_snapshot_archive", Tier::Cold),
        ] {
            let rows = sqlx::query(&format!("SELECT * FROM {table} WHERE group_id = $1 ORDER BY id"))
                .bind(group_id)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                out.push(entry_from_row(row, tier)?);
            }
        }
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    async fn entries_for_wallet(&self, wallet_id: WalletId) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut out = Vec::new();
        for (table, tier) in [
            ("transaction", Tier::Hot),
            ("transaction_snapshot", Tier::Warm),
            ("transaction_snapshot_archive", Tier::Cold),
        ] {
            let rows = sqlx::query(&format!("SELECT * FROM {table} WHERE wallet_id = $1 ORDER BY id"))
                .bind(wallet_id)
                .fetch_all(&self.pool)
                .await?;
            for row in &rows {
                out.push(entry_from_row(row, tier)?);
            }
        }
        out.sort_by_key(|e| e.id);
        Ok(out)
    }

    async fn total_balance(&self, wallet_id: WalletId) -> Result<i64, LedgerError> {
        // The archive table is excluded: the LEDGER checkpoint written into
        // transaction_snapshot at archive time already carries forward the
        // amount of whatever it archived, so reading the archive here too
        // would double-count it. The archive stays queryable for forensic
        // lookups via `sum_by_tier`, just not on this path.
        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_minor_units), 0)::BIGINT FROM (
                SELECT amount_minor_units FROM transaction WHERE wallet_id = $1 AND status IN ('SETTLED','RELEASED','CANCELLED','REFUNDED')
                UNION ALL
                SELECT amount_minor_units FROM transaction_snapshot WHERE wallet_id = $1 AND status IN ('SETTLED','RELEASED','CANCELLED','REFUNDED')
            ) t
            "#,
        )
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn held_debit(&self, wallet_id: WalletId) -> Result<i64, LedgerError> {
        // HOLD rows never leave the hot table, so only it needs scanning.
        let held: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(-SUM(t.amount_minor_units), 0)::BIGINT
            FROM transaction t
            JOIN transaction_group tg ON tg.id = t.group_id
            WHERE t.wallet_id = $1 AND t.status = 'HOLD' AND t.amount_minor_units < 0
              AND tg.status != 'SETTLED'
            "#,
        )
        .bind(wallet_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(held)
    }

    async fn group_hold_settle_sum(&self, group_id: Uuid) -> Result<i64, LedgerError> {
        let sum: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(amount_minor_units), 0)::BIGINT FROM (
                SELECT amount_minor_units FROM transaction WHERE group_id = $1 AND status IN ('HOLD', 'SETTLED')
                UNION ALL
                SELECT amount_minor_units FROM transaction_snapshot WHERE group_id = $1 AND status IN ('HOLD', 'SETTLED')
            ) t
            "#,
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }

    async fn hot_entries_ready_for_snapshot(
        &self,
        wallet_id: WalletId,
        limit: i64,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT t.*
            FROM transaction t
            JOIN transaction_group tg ON tg.id = t.group_id
            WHERE t.wallet_id = $1 AND tg.status != 'IN_PROGRESS'
            ORDER BY t.id
            LIMIT $2
            "#,
        )
        .bind(wallet_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| entry_from_row(row, Tier::Hot)).collect()
    }

    /// Copies `entry_ids` out of `transaction` into `transaction_snapshot`
    /// and deletes the `transaction` rows — never an UPDATE, since
    /// `transaction` rejects those via trigger regardless.
    async fn move_to_warm(&self, entry_ids: &[EntryId]) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO transaction_snapshot (
                id, wallet_id, group_id, entry_type, status, amount_minor_units, currency,
                initiator_kind, initiator_id, ip_address, user_agent, metadata,
                created_at, settled_at, snapshot_date
            )
            SELECT id, wallet_id, group_id, entry_type, status, amount_minor_units, currency,
                   initiator_kind, initiator_id, ip_address, user_agent, metadata,
                   created_at, settled_at, CURRENT_DATE
            FROM transaction
            WHERE id = ANY($1)
            "#,
        )
        .bind(entry_ids)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM transaction WHERE id = ANY($1)")
            .bind(entry_ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn warm_entries_before(
        &self,
        wallet_id: WalletId,
        cutoff: NaiveDate,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM transaction_snapshot
            WHERE wallet_id = $1 AND entry_type != 'LEDGER' AND snapshot_date < $2
            ORDER BY id
            "#,
        )
        .bind(wallet_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| entry_from_row(row, Tier::Warm)).collect()
    }

    async fn insert_checkpoint(
        &self,
        wallet_id: WalletId,
        amount: i64,
        snapshot_date: NaiveDate,
    ) -> Result<EntryId, LedgerError> {
        let wallet = self.get_wallet(wallet_id).await?;
        let group_id = Uuid::now_v7();
        sqlx::query(
            r#"
            INSERT INTO transaction_group (id, status, reason)
            VALUES ($1, 'SETTLED', 'archive checkpoint')
            "#,
        )
        .bind(group_id)
        .execute(&self.pool)
        .await?;

        let id: EntryId = sqlx::query_scalar(
            r#"
            INSERT INTO transaction_snapshot (
                wallet_id, group_id, entry_type, status, amount_minor_units, currency,
                initiator_kind, settled_at, snapshot_date
            )
            VALUES ($1, $2, 'LEDGER', 'SETTLED', $3, $4, 'SYSTEM', now(), $5)
            RETURNING id
            "#,
        )
        .bind(wallet_id)
        .bind(group_id)
        .bind(amount)
        .bind(wallet.currency.as_str())
        .bind(snapshot_date)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    /// Copies `entries` into `transaction_snapshot_archive` and deletes
    /// them from `transaction_snapshot` — the same copy-then-delete
    /// discipline as [`Self::move_to_warm`].
    async fn archive_to_cold(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        let ids: Vec<EntryId> = entries.iter().map(|e| e.id).collect();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO transaction_snapshot_archive (
                id, wallet_id, group_id, entry_type, status, amount_minor_units, currency,
                initiator_kind, initiator_id, ip_address, user_agent, metadata,
                created_at, settled_at, snapshot_date
            )
            SELECT id, wallet_id, group_id, entry_type, status, amount_minor_units, currency,
                   initiator_kind, initiator_id, ip_address, user_agent, metadata,
                   created_at, settled_at, snapshot_date
            FROM transaction_snapshot
            WHERE id = ANY($1)
            "#,
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;
        sqlx::query("DELETE FROM transaction_snapshot WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn record_archive_trace(
        &self,
        checkpoint_id: EntryId,
        original_entry_ids: &[EntryId],
    ) -> Result<(), LedgerError> {
        for original in original_entry_ids {
            sqlx::query("INSERT INTO ledger_entries_tracking (checkpoint_id, original_entry_id) VALUES ($1, $2)")
                .bind(checkpoint_id)
                .bind(original)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn reconcile_system(&self) -> Result<Vec<(String, i64)>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COALESCE(SUM(amount_minor_units), 0)::BIGINT AS total
            FROM (
                SELECT status, amount_minor_units FROM transaction
                UNION ALL
                SELECT status, amount_minor_units FROM transaction_snapshot
            ) t
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| Ok((row.try_get::<String, _>("status")?, row.try_get::<i64, _>("total")?)))
            .collect()
    }

    async fn sum_by_tier(&self, tier: Tier) -> Result<i64, LedgerError> {
        let sum: i64 = sqlx::query_scalar(&format!(
            "SELECT COALESCE(SUM(amount_minor_units), 0)::BIGINT FROM {}",
            tier_table(tier)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(sum)
    }
}

fn finalizes_balance(status: EntryStatus) -> bool {
    matches!(
        status,
        EntryStatus::Settled | EntryStatus::Released | EntryStatus::Cancelled | EntryStatus::Refunded
    )
}

#[async_trait]
impl GroupStore for PostgresStore {
    async fn create_group(
        &self,
        id: Uuid,
        idempotency_key_hash: Option<String>,
        merchant_id: Option<String>,
        buyer_id: Option<String>,
        reason: Option<String>,
    ) -> Result<TransactionGroup, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO transaction_group (id, status, merchant_id, buyer_id, reason, idempotency_key_hash)
            VALUES ($1, 'IN_PROGRESS', $2, $3, $4, $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&merchant_id)
        .bind(&buyer_id)
        .bind(&reason)
        .bind(&idempotency_key_hash)
        .fetch_one(&self.pool)
        .await?;
        group_from_row(&row)
    }

    async fn find_by_idempotency_key(&self, key_hash: &str) -> Result<Option<TransactionGroup>, LedgerError> {
        let row = sqlx::query("SELECT * FROM transaction_group WHERE idempotency_key_hash = $1")
            .bind(key_hash)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(group_from_row).transpose()
    }

    async fn get_group(&self, id: Uuid) -> Result<TransactionGroup, LedgerError> {
        let row = sqlx::query("SELECT * FROM transaction_group WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::GroupNotFound(id))?;
        group_from_row(&row)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: GroupStatus,
        next: GroupStatus,
    ) -> Result<TransactionGroup, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE transaction_group SET status = $1
            WHERE id = $2 AND status = $3
            RETURNING *
            "#,
        )
        .bind(group_status_str(next))
        .bind(id)
        .bind(group_status_str(expected))
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => group_from_row(&row),
            None => {
                let current = self.get_group(id).await?;
                Err(LedgerError::InvalidStateTransition {
                    from: current.status.to_string(),
                    to: next.to_string(),
                })
            }
        }
    }

    async fn stale_groups(&self, older_than: DateTime<Utc>, limit: i64) -> Result<Vec<TransactionGroup>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM transaction_group
            WHERE status = 'IN_PROGRESS' AND created_at < $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(group_from_row).collect()
    }
}

#[async_trait]
impl SettlementStore for PostgresStore {
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Settlement>, LedgerError> {
        let row = sqlx::query("SELECT * FROM settlement WHERE idempotency_key_hash = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(settlement_from_row).transpose()
    }

    async fn insert(&self, settlement: NewSettlement) -> Result<Settlement, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO settlement (
                id, merchant_id, total, fee, net, commission_rate, group_count,
                status, currency, settlement_group_id, idempotency_key_hash
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'PENDING', $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(settlement.id)
        .bind(&settlement.merchant_id)
        .bind(settlement.total)
        .bind(settlement.fee)
        .bind(settlement.net)
        .bind(settlement.commission_rate)
        .bind(settlement.group_count)
        .bind(settlement.currency.as_str())
        .bind(settlement.settlement_group_id)
        .bind(&settlement.idempotency_key_hash)
        .fetch_one(&self.pool)
        .await?;
        settlement_from_row(&row)
    }

    async fn mark_completed(&self, id: Uuid, settled_at: DateTime<Utc>) -> Result<Settlement, LedgerError> {
        let row = sqlx::query("UPDATE settlement SET status = 'COMPLETED', settled_at = $1 WHERE id = $2 RETURNING *")
            .bind(settled_at)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::SettlementNotFound(id))?;
        settlement_from_row(&row)
    }

    async fn mark_failed(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        let row = sqlx::query("UPDATE settlement SET status = 'FAILED' WHERE id = $1 RETURNING *")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::SettlementNotFound(id))?;
        settlement_from_row(&row)
    }

    async fn get(&self, id: Uuid) -> Result<Settlement, LedgerError> {
        let row = sqlx::query("SELECT * FROM settlement WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::SettlementNotFound(id))?;
        settlement_from_row(&row)
    }

    async fn list_for_merchant(&self, merchant_id: &str, page: i64, size: i64) -> Result<Vec<Settlement>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM settlement WHERE merchant_id = $1 ORDER BY created_at OFFSET $2 LIMIT $3")
            .bind(merchant_id)
            .bind(page.max(0) * size.max(0))
            .bind(size)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(settlement_from_row).collect()
    }

    async fn unsettled_groups_for_merchant(&self, merchant_id: &str) -> Result<Vec<Uuid>, LedgerError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT tg.id FROM transaction_group tg
            LEFT JOIN settlement_transaction_group stg ON stg.group_id = tg.id
            WHERE tg.merchant_id = $1 AND tg.status = 'IN_PROGRESS' AND stg.group_id IS NULL
            "#,
        )
        .bind(merchant_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn link_group(&self, settlement_id: Uuid, group_id: Uuid, amount: i64) -> Result<(), LedgerError> {
        sqlx::query("INSERT INTO settlement_transaction_group (settlement_id, group_id, amount) VALUES ($1, $2, $3)")
            .bind(settlement_id)
            .bind(group_id)
            .bind(amount)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => LedgerError::DoubleSettlement(group_id),
                _ => LedgerError::from(e),
            })?;
        Ok(())
    }

    async fn settlement_status(&self, id: Uuid) -> Result<SettlementStatus, LedgerError> {
        let status: String = sqlx::query_scalar("SELECT status FROM settlement WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::SettlementNotFound(id))?;
        parse_settlement_status(&status)
    }

    async fn settlement_for_group(&self, group_id: Uuid) -> Result<Option<Uuid>, LedgerError> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT settlement_id FROM settlement_transaction_group WHERE group_id = $1")
                .bind(group_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(id)
    }
}

#[async_trait]
impl RefundStore for PostgresStore {
    async fn insert_reserve(&self, reserve: NewRefundReserve) -> Result<RefundReserve, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO refund_reserve (
                id, settlement_id, merchant_id, reserve_wallet_id, reserved, used,
                reserve_group_id, status, currency, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, 0, $6, 'ACTIVE', $7, $8)
            RETURNING *
            "#,
        )
        .bind(reserve.id)
        .bind(reserve.settlement_id)
        .bind(&reserve.merchant_id)
        .bind(reserve.reserve_wallet_id)
        .bind(reserve.reserved)
        .bind(reserve.reserve_group_id)
        .bind(reserve.currency.as_str())
        .bind(reserve.expires_at)
        .fetch_one(&self.pool)
        .await?;
        reserve_from_row(&row)
    }

    async fn get_reserve(&self, id: Uuid) -> Result<RefundReserve, LedgerError> {
        let row = sqlx::query("SELECT * FROM refund_reserve WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::RefundReserveNotFound(id))?;
        reserve_from_row(&row)
    }

    async fn reserve_for_settlement(&self, settlement_id: Uuid) -> Result<Option<RefundReserve>, LedgerError> {
        let row = sqlx::query("SELECT * FROM refund_reserve WHERE settlement_id = $1")
            .bind(settlement_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(reserve_from_row).transpose()
    }

    async fn consume_reserve(&self, id: Uuid, amount: i64) -> Result<RefundReserve, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE refund_reserve
            SET used = used + $1,
                status = CASE WHEN used + $1 >= reserved THEN 'FULLY_USED' ELSE 'PARTIALLY_USED' END
            WHERE id = $2
            RETURNING *
            "#,
        )
        .bind(amount)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::RefundReserveNotFound(id))?;
        reserve_from_row(&row)
    }

    async fn set_reserve_status(
        &self,
        id: Uuid,
        status: RefundReserveStatus,
        released_at: Option<DateTime<Utc>>,
    ) -> Result<RefundReserve, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE refund_reserve
            SET status = $1, released_at = COALESCE($2, released_at)
            WHERE id = $3
            RETURNING *
            "#,
        )
        .bind(reserve_status_str(status))
        .bind(released_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::RefundReserveNotFound(id))?;
        reserve_from_row(&row)
    }

    async fn expired_reserves(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<RefundReserve>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM refund_reserve
            WHERE status IN ('ACTIVE', 'PARTIALLY_USED') AND expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(reserve_from_row).collect()
    }

    async fn find_refund_by_idempotency_key(&self, key: &str) -> Result<Option<Refund>, LedgerError> {
        let row = sqlx::query("SELECT * FROM refund WHERE idempotency_key_hash = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(refund_from_row).transpose()
    }

    async fn insert_refund(&self, refund: NewRefund) -> Result<Refund, LedgerError> {
        let row = sqlx::query(
            r#"
            INSERT INTO refund (
                id, order_group_id, settlement_id, merchant_id, merchant_wallet_id, buyer_id, buyer_wallet_id,
                amount, original_amount, reason, status, initiator, idempotency_key_hash, refund_type, currency
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'PENDING', $11, $12, $13, $14)
            RETURNING *
            "#,
        )
        .bind(refund.id)
        .bind(refund.order_group_id)
        .bind(refund.settlement_id)
        .bind(&refund.merchant_id)
        .bind(refund.merchant_wallet_id)
        .bind(&refund.buyer_id)
        .bind(refund.buyer_wallet_id)
        .bind(refund.amount)
        .bind(refund.original_amount)
        .bind(&refund.reason)
        .bind(refund_initiator_str(refund.initiator))
        .bind(&refund.idempotency_key_hash)
        .bind(refund_type_str(refund.refund_type))
        .bind(refund.currency.as_str())
        .fetch_one(&self.pool)
        .await?;
        refund_from_row(&row)
    }

    async fn get_refund(&self, id: Uuid) -> Result<Refund, LedgerError> {
        let row = sqlx::query("SELECT * FROM refund WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::RefundNotFound(id))?;
        refund_from_row(&row)
    }

    async fn set_refund_status(
        &self,
        id: Uuid,
        status: RefundStatus,
        refund_group_id: Option<Uuid>,
        processed_at: Option<DateTime<Utc>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Refund, LedgerError> {
        let row = sqlx::query(
            r#"
            UPDATE refund
            SET status = $1,
                refund_group_id = COALESCE($2, refund_group_id),
                processed_at = COALESCE($3, processed_at),
                expires_at = COALESCE($4, expires_at)
            WHERE id = $5
            RETURNING *
            "#,
        )
        .bind(refund_status_str(status))
        .bind(refund_group_id)
        .bind(processed_at)
        .bind(expires_at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::RefundNotFound(id))?;
        refund_from_row(&row)
    }

    async fn refunds_for_order(&self, order_group_id: Uuid) -> Result<Vec<Refund>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM refund WHERE order_group_id = $1 ORDER BY created_at")
            .bind(order_group_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(refund_from_row).collect()
    }

    async fn completed_refund_total(&self, order_group_id: Uuid) -> Result<i64, LedgerError> {
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM refund WHERE order_group_id = $1 AND status = 'COMPLETED'",
        )
        .bind(order_group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn has_full_refund(&self, order_group_id: Uuid) -> Result<bool, LedgerError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM refund
                WHERE order_group_id = $1 AND refund_type = 'FULL'
                  AND status NOT IN ('REJECTED', 'FAILED', 'EXPIRED')
            )
            "#,
        )
        .bind(order_group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn list_for_merchant(&self, merchant_id: &str, page: i64, size: i64) -> Result<Vec<Refund>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM refund WHERE merchant_id = $1 ORDER BY created_at OFFSET $2 LIMIT $3")
            .bind(merchant_id)
            .bind(page.max(0) * size.max(0))
            .bind(size)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(refund_from_row).collect()
    }

    async fn pending_funds_page(&self, limit: i64) -> Result<Vec<Refund>, LedgerError> {
        let rows = sqlx::query("SELECT * FROM refund WHERE status = 'PENDING_FUNDS' ORDER BY created_at LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(refund_from_row).collect()
    }

    async fn expired_pending_funds(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<Refund>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM refund
            WHERE status = 'PENDING_FUNDS' AND expires_at <= $1
            ORDER BY created_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(refund_from_row).collect()
    }
}
