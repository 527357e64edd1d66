//! Partial-failure behavior: every mutation either lands completely or
//! compensates the half it managed to write, and a failed compensation
//! escalates to a consistency error that reconciliation can repair.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashSet;
use uuid::Uuid;

use common::decimal::{dec, Amount};
use common::error::{Error, Result};
use common::model::account::{Account, NewAccount};
use common::model::transaction::{Transaction, TransactionDraft, TransactionKind, TransactionPatch};
use common::model::workspace::WorkspaceContext;
use ledger_engine::{InMemoryLedgerStore, LedgerEngine, LedgerStore};

/// In-memory store with injectable failures, for exercising the
/// compensation paths of the mutator
struct FlakyStore {
    inner: InMemoryLedgerStore,
    /// Fail the next N balance adjustments
    failing_adjustments: AtomicUsize,
    /// Fail the next N row deletes
    failing_deletes: AtomicUsize,
    /// Fail the next N row updates
    failing_updates: AtomicUsize,
    /// Fail the next balance adjustment touching one of these accounts
    failing_accounts: DashSet<Uuid>,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryLedgerStore::new(),
            failing_adjustments: AtomicUsize::new(0),
            failing_deletes: AtomicUsize::new(0),
            failing_updates: AtomicUsize::new(0),
            failing_accounts: DashSet::new(),
        }
    }

    fn fail_next_adjustments(&self, n: usize) {
        self.failing_adjustments.store(n, Ordering::SeqCst);
    }

    fn fail_next_deletes(&self, n: usize) {
        self.failing_deletes.store(n, Ordering::SeqCst);
    }

    fn fail_next_updates(&self, n: usize) {
        self.failing_updates.store(n, Ordering::SeqCst);
    }

    fn fail_adjustment_for(&self, account_id: Uuid) {
        self.failing_accounts.insert(account_id);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn create_account(&self, new: NewAccount) -> Result<Account> {
        self.inner.create_account(new).await
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        self.inner.get_account(id).await
    }

    async fn list_accounts(&self, workspace_id: Uuid) -> Result<Vec<Account>> {
        self.inner.list_accounts(workspace_id).await
    }

    async fn deactivate_account(&self, id: Uuid) -> Result<Account> {
        self.inner.deactivate_account(id).await
    }

    async fn adjust_balance(&self, id: Uuid, delta: Amount) -> Result<Amount> {
        if Self::take(&self.failing_adjustments) || self.failing_accounts.remove(&id).is_some() {
            return Err(Error::Persistence("injected balance adjustment failure".to_string()));
        }
        self.inner.adjust_balance(id, delta).await
    }

    async fn set_balance(&self, id: Uuid, balance: Amount) -> Result<()> {
        self.inner.set_balance(id, balance).await
    }

    async fn insert_transaction(&self, txn: Transaction) -> Result<Transaction> {
        self.inner.insert_transaction(txn).await
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        self.inner.get_transaction(id).await
    }

    async fn update_transaction(&self, txn: Transaction) -> Result<Transaction> {
        if Self::take(&self.failing_updates) {
            return Err(Error::Persistence("injected row update failure".to_string()));
        }
        self.inner.update_transaction(txn).await
    }

    async fn delete_transaction(&self, id: Uuid) -> Result<()> {
        if Self::take(&self.failing_deletes) {
            return Err(Error::Persistence("injected row delete failure".to_string()));
        }
        self.inner.delete_transaction(id).await
    }

    async fn transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>> {
        self.inner.transactions_for_account(account_id).await
    }

    async fn transactions_for_transfer(&self, transfer_id: Uuid) -> Result<Vec<Transaction>> {
        self.inner.transactions_for_transfer(transfer_id).await
    }
}

fn flaky_engine() -> (Arc<FlakyStore>, LedgerEngine) {
    let store = Arc::new(FlakyStore::new());
    let engine = LedgerEngine::new(Arc::clone(&store) as Arc<dyn LedgerStore>);
    (store, engine)
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
        transaction_date: NaiveDate::from_ymd_opt(2024, 9, 9).unwrap(),
        created_by: Uuid::new_v4(),
    }
}

async fn balance(engine: &LedgerEngine, account_id: Uuid) -> Amount {
    engine
        .store()
        .get_account(account_id)
        .await
        .unwrap()
        .unwrap()
        .balance
}

#[tokio::test]
async fn failed_balance_update_rolls_the_insert_back() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(100.00)).await;

    store.fail_next_adjustments(1);
    let result = engine
        .mutator()
        .create_transaction(draft(workspace, account.id, TransactionKind::Income, dec!(40.00)))
        .await;

    let err = result.unwrap_err();
    assert!(err.is_retryable(), "a cleanly compensated failure is retryable: {}", err);
    assert_eq!(balance(&engine, account.id).await, dec!(100.00));
    assert!(engine
        .store()
        .transactions_for_account(account.id)
        .await
        .unwrap()
        .is_empty());

    // The same call goes through once the store recovers
    engine
        .mutator()
        .create_transaction(draft(workspace, account.id, TransactionKind::Income, dec!(40.00)))
        .await
        .unwrap();
    assert_eq!(balance(&engine, account.id).await, dec!(140.00));
}

#[tokio::test]
async fn failed_compensation_escalates_and_reconciliation_repairs() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let account = open_account(&engine, workspace, dec!(100.00)).await;

    // The balance update fails and so does the compensating delete, leaving
    // an orphan row behind
    store.fail_next_adjustments(1);
    store.fail_next_deletes(1);
    let result = engine
        .mutator()
        .create_transaction(draft(workspace, account.id, TransactionKind::Income, dec!(40.00)))
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, Error::Consistency(_)));
    assert!(!err.is_retryable());

    // The stored balance now disagrees with the row set until reconciliation
    assert_eq!(balance(&engine, account.id).await, dec!(100.00));
    let report = engine.reconciliation().reconcile(account.id).await.unwrap();
    assert!(report.corrected);
    assert_eq!(report.recomputed, dec!(140.00));
    assert_eq!(balance(&engine, account.id).await, dec!(140.00));
}

#[tokio::test]
async fn failed_row_delete_restores_the_balance() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let ctx = WorkspaceContext::new(workspace, Uuid::new_v4());
    let account = open_account(&engine, workspace, dec!(100.00)).await;

    let txn = engine
        .mutator()
        .create_transaction(draft(workspace, account.id, TransactionKind::Expense, dec!(25.00)))
        .await
        .unwrap();
    assert_eq!(balance(&engine, account.id).await, dec!(75.00));

    store.fail_next_deletes(1);
    let result = engine.mutator().delete_transaction(&ctx, txn.id).await;

    assert!(result.unwrap_err().is_retryable());
    // The adjustment was reversed and the row survived
    assert_eq!(balance(&engine, account.id).await, dec!(75.00));
    assert!(engine.store().get_transaction(txn.id).await.unwrap().is_some());
}

#[tokio::test]
async fn failed_row_update_restores_the_balance() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let ctx = WorkspaceContext::new(workspace, Uuid::new_v4());
    let account = open_account(&engine, workspace, dec!(100.00)).await;

    let txn = engine
        .mutator()
        .create_transaction(draft(workspace, account.id, TransactionKind::Expense, dec!(30.00)))
        .await
        .unwrap();
    assert_eq!(balance(&engine, account.id).await, dec!(70.00));

    store.fail_next_updates(1);
    let patch = TransactionPatch {
        amount: Some(dec!(50.00)),
        ..TransactionPatch::default()
    };
    let result = engine.mutator().update_transaction(&ctx, txn.id, patch).await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(balance(&engine, account.id).await, dec!(70.00));
    let stored = engine.store().get_transaction(txn.id).await.unwrap().unwrap();
    assert_eq!(stored.amount, dec!(30.00));
}

#[tokio::test]
async fn failed_move_restores_the_source_account() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let ctx = WorkspaceContext::new(workspace, Uuid::new_v4());
    let account_a = open_account(&engine, workspace, dec!(0.00)).await;
    let account_b = open_account(&engine, workspace, dec!(0.00)).await;

    let txn = engine
        .mutator()
        .create_transaction(draft(workspace, account_a.id, TransactionKind::Income, dec!(25.00)))
        .await
        .unwrap();

    // The adjustment on the destination account fails after the source was
    // already reversed
    store.fail_adjustment_for(account_b.id);
    let patch = TransactionPatch {
        account_id: Some(account_b.id),
        ..TransactionPatch::default()
    };
    let result = engine.mutator().update_transaction(&ctx, txn.id, patch).await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(balance(&engine, account_a.id).await, dec!(25.00));
    assert_eq!(balance(&engine, account_b.id).await, dec!(0.00));
    let stored = engine.store().get_transaction(txn.id).await.unwrap().unwrap();
    assert_eq!(stored.account_id, account_a.id);
}

#[tokio::test]
async fn failed_transfer_unwinds_both_legs() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let source = open_account(&engine, workspace, dec!(100.00)).await;
    let destination = open_account(&engine, workspace, dec!(0.00)).await;

    store.fail_adjustment_for(destination.id);
    let result = engine
        .mutator()
        .create_transfer(common::model::transaction::TransferDraft {
            workspace_id: workspace,
            source_account_id: source.id,
            destination_account_id: destination.id,
            amount: dec!(40.00),
            currency: "EUR".to_string(),
            category: None,
            description: None,
            transaction_date: NaiveDate::from_ymd_opt(2024, 9, 9).unwrap(),
            created_by: Uuid::new_v4(),
        })
        .await;

    assert!(result.unwrap_err().is_retryable());
    assert_eq!(balance(&engine, source.id).await, dec!(100.00));
    assert_eq!(balance(&engine, destination.id).await, dec!(0.00));
    assert!(engine
        .store()
        .transactions_for_account(source.id)
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .store()
        .transactions_for_account(destination.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn failed_bulk_group_unwinds_the_whole_batch() {
    let (store, engine) = flaky_engine();
    let workspace = Uuid::new_v4();
    let account_a = open_account(&engine, workspace, dec!(10.00)).await;
    let account_b = open_account(&engine, workspace, dec!(10.00)).await;

    store.fail_adjustment_for(account_b.id);
    let drafts = vec![
        draft(workspace, account_a.id, TransactionKind::Income, dec!(5.00)),
        draft(workspace, account_b.id, TransactionKind::Income, dec!(7.00)),
    ];
    let result = engine.mutator().bulk_create_transactions(drafts).await;

    assert!(result.is_err());
    // No subset of the batch survives without its balance effect
    assert_eq!(balance(&engine, account_a.id).await, dec!(10.00));
    assert_eq!(balance(&engine, account_b.id).await, dec!(10.00));
    assert!(engine
        .store()
        .transactions_for_account(account_a.id)
        .await
        .unwrap()
        .is_empty());
    assert!(engine
        .store()
        .transactions_for_account(account_b.id)
        .await
        .unwrap()
        .is_empty());
}
