use std::sync::Arc;

use chrono::NaiveDate;
use uuid::Uuid;

use common::decimal::{dec, Amount};
use common::error::Error;
use common::model::account::{Account, NewAccount};
use common::model::transaction::{TransactionDraft, TransactionKind};
use ledger_engine::{InMemoryLedgerStore, LedgerEngine};

fn engine() -> LedgerEngine {
    LedgerEngine::new(Arc::new(InMemoryLedgerStore::new()))
}

async fn open_account(engine: &LedgerEngine, workspace_id: Uuid, opening: Amount) -> Account {
    engine
        .store()
        .create_account(NewAccount {
            workspace_id,
            opening_balance: opening,
            currency: "EUR".to_string(),
        })
        .await
        .unwrap()
}

fn draft(workspace_id: Uuid, account_id: Uuid, kind: TransactionKind, amount: Amount) -> TransactionDraft {
    TransactionDraft {
        workspace_id,
        account_id,
        kind,
        amount,
        currency: "EUR".to_string(),
        category: None,
        description: None,
        transaction_date: NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
        created_by: Uuid::new_v4(),
    }
}

#[tokio::test]
async fn recompute_matches_the_stored_balance_after_mutations() {
    let engine = engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(100.00)).await;

    for (kind, amount) in [
        (TransactionKind::Income, dec!(250.00)),
        (TransactionKind::Expense, dec!(40.50)),
        (TransactionKind::Expense, dec!(9.50)),
    ] {
        engine
            .mutator()
            .create_transaction(draft(workspace, account.id, kind, amount))
            .await
            .unwrap();
    }

    let stored = engine
        .store()
        .get_account(account.id)
        .await
        .unwrap()
        .unwrap()
        .balance;
    let recomputed = engine.reconciliation().recompute_balance(account.id).await.unwrap();

    assert_eq!(stored, dec!(300.00));
    assert_eq!(recomputed, stored);
}

#[tokio::test]
async fn recompute_does_not_mutate() {
    let engine = engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(50.00)).await;

    // Inject drift, then only recompute
    engine.store().set_balance(account.id, dec!(999.99)).await.unwrap();
    let recomputed = engine.reconciliation().recompute_balance(account.id).await.unwrap();

    assert_eq!(recomputed, dec!(50.00));
    let stored = engine
        .store()
        .get_account(account.id)
        .await
        .unwrap()
        .unwrap()
        .balance;
    assert_eq!(stored, dec!(999.99), "recompute must not write");
}

#[tokio::test]
async fn reconcile_reports_a_clean_account() {
    let engine = engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(75.00)).await;

    let report = engine.reconciliation().reconcile(account.id).await.unwrap();

    assert!(!report.corrected);
    assert!(!report.drifted());
    assert_eq!(report.previous, dec!(75.00));
    assert_eq!(report.recomputed, dec!(75.00));
}

#[tokio::test]
async fn reconcile_repairs_drift_and_is_then_idempotent() {
    let engine = engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(100.00)).await;

    engine
        .mutator()
        .create_transaction(draft(workspace, account.id, TransactionKind::Expense, dec!(20.00)))
        .await
        .unwrap();

    engine.store().set_balance(account.id, dec!(123.45)).await.unwrap();

    let first = engine.reconciliation().reconcile(account.id).await.unwrap();
    assert!(first.corrected);
    assert_eq!(first.previous, dec!(123.45));
    assert_eq!(first.recomputed, dec!(80.00));

    let second = engine.reconciliation().reconcile(account.id).await.unwrap();
    assert!(!second.corrected, "a second pass with no mutations must find nothing");
    assert_eq!(second.previous, dec!(80.00));
}

#[tokio::test]
async fn the_opening_balance_is_the_recompute_base() {
    let engine = engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(250.00)).await;

    engine.store().set_balance(account.id, dec!(0.00)).await.unwrap();
    let report = engine.reconciliation().reconcile(account.id).await.unwrap();

    assert!(report.corrected);
    assert_eq!(report.recomputed, dec!(250.00));
}

#[tokio::test]
async fn reconcile_workspace_sweeps_every_account() {
    let engine = engine();
    let workspace = Uuid::new_v4();
    let _clean = open_account(&engine, workspace, dec!(10.00)).await;
    let drifted = open_account(&engine, workspace, dec!(10.00)).await;
    // An account in another workspace stays untouched
    let foreign = open_account(&engine, Uuid::new_v4(), dec!(10.00)).await;

    engine.store().set_balance(drifted.id, dec!(55.00)).await.unwrap();
    engine.store().set_balance(foreign.id, dec!(55.00)).await.unwrap();

    let reports = engine.reconciliation().reconcile_workspace(workspace).await.unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports.iter().filter(|r| r.corrected).count(), 1);
    assert!(reports.iter().all(|r| r.account_id != foreign.id));

    let foreign_balance = engine
        .store()
        .get_account(foreign.id)
        .await
        .unwrap()
        .unwrap()
        .balance;
    assert_eq!(foreign_balance, dec!(55.00));
}

#[tokio::test]
async fn reconcile_unknown_account_fails() {
    let engine = engine();

    let recompute = engine.reconciliation().recompute_balance(Uuid::new_v4()).await;
    assert!(matches!(recompute, Err(Error::AccountNotFound(_))));

    let reconcile = engine.reconciliation().reconcile(Uuid::new_v4()).await;
    assert!(matches!(reconcile, Err(Error::AccountNotFound(_))));
}
