// ledger/tests/integration_tests.rs
use std::sync::Arc;

use chrono::{Duration, Utc};
use ledger::adapters::MemoryStore;
use ledger::{
    Currency, GroupStatus, Ledger, LedgerConfig, LedgerError, OwnerKind, RefundInitiator, RefundStatus,
    RefundType, ReserveSource, SettlementStatus, SystemClock, UuidV7Generator, WalletType,
};

fn usd() -> Currency {
    Currency::parse("USD").unwrap()
}

fn new_ledger() -> Ledger {
    let config = LedgerConfig::new(300, 1, 30, true, 1_000, 30, 30, ReserveSource::Escrow);
    Ledger::new(MemoryStore::new(), Arc::new(SystemClock), Arc::new(UuidV7Generator), config)
}

async fn open_user(ledger: &Ledger, owner_id: &str) -> i64 {
    ledger
        .create_wallet(WalletType::User, OwnerKind::User, owner_id.to_string(), usd(), "user wallet".into())
        .await
        .unwrap()
}

async fn open_merchant(ledger: &Ledger, owner_id: &str) -> i64 {
    ledger
        .create_wallet(
            WalletType::Merchant,
            OwnerKind::Merchant,
            owner_id.to_string(),
            usd(),
            "merchant wallet".into(),
        )
        .await
        .unwrap()
}

async fn fund(ledger: &Ledger, wallet: i64, amount: i64) {
    let deposit = ledger
        .wallets()
        .system_wallet(WalletType::System, usd(), "deposit")
        .await
        .unwrap();
    let deposit_party = ledger::Party::new(deposit.id, usd(), ledger::InitiatorKind::System);
    let wallet_party = ledger::Party::new(wallet, usd(), ledger::InitiatorKind::System);
    ledger
        .groups()
        .deposit(&deposit_party, &wallet_party, amount, None)
        .await
        .unwrap();
}

// Scenario 1: simple settled transfer.
#[tokio::test]
async fn simple_settled_transfer() {
    let ledger = new_ledger();
    let buyer = open_user(&ledger, "buyer-1").await;
    let merchant = open_merchant(&ledger, "merchant-1").await;
    fund(&ledger, buyer, 100_000).await;

    let escrow = ledger
        .wallets()
        .system_wallet(WalletType::Escrow, usd(), "escrow")
        .await
        .unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);
    let merchant_party = ledger::Party::new(merchant, usd(), ledger::InitiatorKind::Merchant);

    let group = ledger
        .groups()
        .transfer(&buyer_party, &escrow_party, &merchant_party, 25_000, None)
        .await
        .unwrap();

    assert_eq!(group.status, GroupStatus::Settled);
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), 75_000);
    assert_eq!(ledger.get_available_balance(merchant).await.unwrap(), 25_000);
    let totals = ledger.system_reconciliation().await.unwrap();
    assert_eq!(*totals.get("TOTAL").unwrap(), 0);
}

// Scenario 2: hold/cancel restores balance exactly.
#[tokio::test]
async fn hold_then_cancel_restores_balance() {
    let ledger = new_ledger();
    let buyer = open_user(&ledger, "buyer-2").await;
    fund(&ledger, buyer, 100_000).await;

    let escrow = ledger
        .wallets()
        .system_wallet(WalletType::Escrow, usd(), "escrow")
        .await
        .unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);

    let group_id = ledger.create_group(None).await.unwrap();
    ledger
        .groups()
        .hold_debit(group_id, &buyer_party, &escrow_party, 10_000)
        .await
        .unwrap();
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), 90_000);

    ledger.cancel(group_id, Some("buyer changed mind".into())).await.unwrap();
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), 100_000);

    let entries = ledger.list_group_entries(group_id).await.unwrap();
    assert_eq!(entries.len(), 4);
}

// Scenario 3: unbalanced group fails to settle with ReconciliationError.
#[tokio::test]
async fn settle_with_nonzero_sum_fails_reconciliation() {
    let ledger = new_ledger();
    let w1 = open_user(&ledger, "w1").await;
    let w2 = open_user(&ledger, "w2").await;
    let w3 = open_user(&ledger, "w3").await;
    fund(&ledger, w1, 1_000).await;

    let w1_party = ledger::Party::new(w1, usd(), ledger::InitiatorKind::User);
    let w2_party = ledger::Party::new(w2, usd(), ledger::InitiatorKind::User);
    let w3_party = ledger::Party::new(w3, usd(), ledger::InitiatorKind::User);

    let group_id = ledger.create_group(None).await.unwrap();
    ledger.groups().hold_debit(group_id, &w1_party, &w2_party, 10).await.unwrap();
    ledger.groups().hold_credit(group_id, &w2_party, &w3_party, 5).await.unwrap();

    let err = ledger.settle(group_id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ReconciliationError(_)));
}

// Scenario 4: batch settlement with commission.
#[tokio::test]
async fn batch_settlement_with_fee() {
    let ledger = new_ledger();
    let merchant = open_merchant(&ledger, "merchant-4").await;
    let buyer = open_user(&ledger, "buyer-4").await;
    fund(&ledger, buyer, 100_000).await;

    let escrow = ledger
        .wallets()
        .system_wallet(WalletType::Escrow, usd(), "escrow")
        .await
        .unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);
    let merchant_party = ledger::Party::new(merchant, usd(), ledger::InitiatorKind::Merchant);

    // Three orders, HOLD only, attributed to the merchant but left unsettled.
    for amount in [8_000, 6_000, 4_000] {
        let group = ledger
            .groups()
            .create_group(None, Some("merchant-4".to_string()), Some("buyer-4".to_string()), None)
            .await
            .unwrap();
        ledger
            .groups()
            .hold_debit(group.id, &buyer_party, &escrow_party, amount)
            .await
            .unwrap();
        ledger
            .groups()
            .hold_credit(group.id, &escrow_party, &merchant_party, amount)
            .await
            .unwrap();
    }

    let settlement = ledger.execute_settlement("merchant-4").await.unwrap();
    assert_eq!(settlement.status, SettlementStatus::Completed);
    assert_eq!(settlement.total, 18_000);
    assert_eq!(settlement.fee, 540);
    assert_eq!(settlement.net, 17_460);
    assert_eq!(ledger.get_available_balance(merchant).await.unwrap(), 17_460);

    let fees = ledger
        .wallets()
        .system_wallet(WalletType::System, usd(), "fees")
        .await
        .unwrap();
    assert_eq!(ledger.get_available_balance(fees.id).await.unwrap(), 540);

    // idempotent same-day re-execution returns the same row, no new entries.
    let before = ledger.list_group_entries(settlement.settlement_group_id.unwrap()).await.unwrap().len();
    let again = ledger.execute_settlement("merchant-4").await.unwrap();
    assert_eq!(again.id, settlement.id);
    let after = ledger.list_group_entries(settlement.settlement_group_id.unwrap()).await.unwrap().len();
    assert_eq!(before, after);
}

// Scenario 5: full refund keeps the commission with the system wallet.
#[tokio::test]
async fn full_refund_returns_net_not_total() {
    let ledger = new_ledger();
    let merchant = open_merchant(&ledger, "merchant-5").await;
    let buyer = open_user(&ledger, "buyer-5").await;
    fund(&ledger, buyer, 100_000).await;
    fund(&ledger, merchant, 50_000).await; // headroom so the refund doesn't defer

    let escrow = ledger.wallets().system_wallet(WalletType::Escrow, usd(), "escrow").await.unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);
    let merchant_party = ledger::Party::new(merchant, usd(), ledger::InitiatorKind::Merchant);

    let order = ledger
        .groups()
        .create_group(None, Some("merchant-5".to_string()), Some("buyer-5".to_string()), None)
        .await
        .unwrap();
    ledger.groups().hold_debit(order.id, &buyer_party, &escrow_party, 10_000).await.unwrap();
    ledger.groups().hold_credit(order.id, &escrow_party, &merchant_party, 9_700).await.unwrap();
    ledger.settle(order.id).await.unwrap();

    let merchant_before = ledger.get_available_balance(merchant).await.unwrap();
    let buyer_before = ledger.get_available_balance(buyer).await.unwrap();

    let refund = ledger
        .create_refund(order.id, 9_700, Some("buyer request".into()), RefundInitiator::Merchant, RefundType::Full, None)
        .await
        .unwrap();

    assert_eq!(refund.status, RefundStatus::Completed);
    assert_eq!(ledger.get_available_balance(merchant).await.unwrap(), merchant_before - 9_700);
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), buyer_before + 9_700);

    // a second FULL refund on the same order is rejected.
    let err = ledger
        .create_refund(order.id, 100, None, RefundInitiator::Merchant, RefundType::Full, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AlreadyRefunded));
}

// Scenario 6: pending-funds refund resumes once the merchant is funded.
#[tokio::test]
async fn pending_funds_refund_resumes_on_retry() {
    let ledger = new_ledger();
    let merchant = open_merchant(&ledger, "merchant-6").await;
    let buyer = open_user(&ledger, "buyer-6").await;
    fund(&ledger, buyer, 100_000).await;
    fund(&ledger, merchant, 5_000).await;

    let escrow = ledger.wallets().system_wallet(WalletType::Escrow, usd(), "escrow").await.unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);
    let merchant_party = ledger::Party::new(merchant, usd(), ledger::InitiatorKind::Merchant);

    let order = ledger
        .groups()
        .create_group(None, Some("merchant-6".to_string()), Some("buyer-6".to_string()), None)
        .await
        .unwrap();
    ledger.groups().hold_debit(order.id, &buyer_party, &escrow_party, 10_000).await.unwrap();
    ledger.groups().hold_credit(order.id, &escrow_party, &merchant_party, 9_700).await.unwrap();
    ledger.settle(order.id).await.unwrap();

    let refund = ledger
        .create_refund(order.id, 9_700, None, RefundInitiator::System, RefundType::Full, None)
        .await
        .unwrap();
    assert_eq!(refund.status, RefundStatus::PendingFunds);

    fund(&ledger, merchant, 5_000).await;

    let retried = ledger.refunds().retry_pending_funds_page(10).await.unwrap();
    assert_eq!(retried, 1);

    let refreshed = ledger.get_refund(refund.id).await.unwrap();
    assert_eq!(refreshed.status, RefundStatus::Completed);
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), 100_000 - 10_000 + 9_700);
}

// Boundary: minimum amount.
#[tokio::test]
async fn zero_and_negative_amounts_are_rejected() {
    let ledger = new_ledger();
    let buyer = open_user(&ledger, "buyer-7").await;
    fund(&ledger, buyer, 1_000).await;
    let escrow = ledger.wallets().system_wallet(WalletType::Escrow, usd(), "escrow").await.unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);

    let group_id = ledger.create_group(None).await.unwrap();
    let zero = ledger.groups().hold_debit(group_id, &buyer_party, &escrow_party, 0).await;
    assert!(matches!(zero, Err(LedgerError::InvalidAmount)));
    let negative = ledger.groups().hold_debit(group_id, &buyer_party, &escrow_party, -5).await;
    assert!(matches!(negative, Err(LedgerError::InvalidAmount)));
}

// Boundary: a hold of exactly the available balance succeeds; a further
// hold of 1 fails with InsufficientFunds.
#[tokio::test]
async fn hold_of_exact_balance_then_overdraft_fails() {
    let ledger = new_ledger();
    let buyer = open_user(&ledger, "buyer-8").await;
    fund(&ledger, buyer, 500).await;
    let escrow = ledger.wallets().system_wallet(WalletType::Escrow, usd(), "escrow").await.unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);

    let group_id = ledger.create_group(None).await.unwrap();
    ledger.groups().hold_debit(group_id, &buyer_party, &escrow_party, 500).await.unwrap();
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), 0);

    let another_group = ledger.create_group(None).await.unwrap();
    let err = ledger
        .groups()
        .hold_debit(another_group, &buyer_party, &escrow_party, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InsufficientFunds));
}

// Cross-currency operations fail before any entry is written.
#[tokio::test]
async fn cross_currency_transfer_rejected_before_any_write() {
    let ledger = new_ledger();
    let buyer = open_user(&ledger, "buyer-9").await;
    fund(&ledger, buyer, 1_000).await;

    let eur_merchant = ledger
        .create_wallet(
            WalletType::Merchant,
            OwnerKind::Merchant,
            "merchant-9".to_string(),
            Currency::parse("EUR").unwrap(),
            "eur merchant".into(),
        )
        .await
        .unwrap();
    let escrow = ledger.wallets().system_wallet(WalletType::Escrow, usd(), "escrow").await.unwrap();

    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);
    let merchant_party = ledger::Party::new(eur_merchant, Currency::parse("EUR").unwrap(), ledger::InitiatorKind::Merchant);

    let err = ledger
        .groups()
        .transfer(&buyer_party, &escrow_party, &merchant_party, 100, None)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
    assert_eq!(ledger.get_available_balance(buyer).await.unwrap(), 1_000);
}

// createGroup idempotence.
#[tokio::test]
async fn create_group_with_same_idempotency_key_returns_same_id() {
    let ledger = new_ledger();
    let a = ledger.create_group(Some("order-42")).await.unwrap();
    let b = ledger.create_group(Some("order-42")).await.unwrap();
    assert_eq!(a, b);
}

// Snapshot moves settled-group entries from hot to warm; archive folds
// warm rows into a single LEDGER checkpoint.
#[tokio::test]
async fn snapshot_then_archive_preserves_total() {
    let ledger = new_ledger();
    let buyer = open_user(&ledger, "buyer-10").await;
    let merchant = open_merchant(&ledger, "merchant-10").await;
    fund(&ledger, buyer, 10_000).await;

    let escrow = ledger.wallets().system_wallet(WalletType::Escrow, usd(), "escrow").await.unwrap();
    let buyer_party = ledger::Party::new(buyer, usd(), ledger::InitiatorKind::User);
    let escrow_party = ledger::Party::new(escrow.id, usd(), ledger::InitiatorKind::System);
    let merchant_party = ledger::Party::new(merchant, usd(), ledger::InitiatorKind::Merchant);

    ledger
        .groups()
        .transfer(&buyer_party, &escrow_party, &merchant_party, 5_000, None)
        .await
        .unwrap();

    let before = ledger.get_total_balance(merchant).await.unwrap();
    let moved = ledger.capture_daily_snapshot(merchant).await.unwrap();
    assert!(moved > 0);
    assert_eq!(ledger.get_total_balance(merchant).await.unwrap(), before);

    let tomorrow = (Utc::now() + Duration::days(1)).date_naive();
    let checkpoint = ledger.archive_old_snapshots(merchant, tomorrow).await.unwrap();
    assert!(checkpoint.is_some());
    assert_eq!(ledger.get_total_balance(merchant).await.unwrap(), before);
}
