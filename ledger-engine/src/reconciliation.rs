//! Balance reconciliation
//!
//! Recomputes account balances from transaction history to detect and
//! repair drift left behind by any partial-failure window the mutator
//! could not fully roll back. Operators and background jobs call this
//! after a `Consistency` error, or periodically as a safety net.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use common::decimal::Amount;
use common::error::{Error, ErrorExt, Result};
use common::model::account::Account;

use crate::delta::balance_delta;
use crate::locks::AccountLocks;
use crate::store::LedgerStore;

/// Outcome of a reconciliation pass over one account
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Account the pass ran over
    pub account_id: Uuid,
    /// Balance stored before the pass
    pub previous: Amount,
    /// Balance recomputed from transaction history
    pub recomputed: Amount,
    /// Whether the stored balance was overwritten
    pub corrected: bool,
}

impl ReconcileReport {
    /// Whether the stored balance disagreed with the transaction history
    pub fn drifted(&self) -> bool {
        self.previous != self.recomputed
    }
}

/// Reconciliation service recomputing balances from transaction history
pub struct ReconciliationService {
    /// Ledger storage adapter
    store: Arc<dyn LedgerStore>,
    /// Per-account serialization, shared with the mutator
    locks: Arc<AccountLocks>,
}

impl ReconciliationService {
    /// Create a service with its own lock registry
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_locks(store, Arc::new(AccountLocks::new()))
    }

    /// Create a service sharing a lock registry with the mutator, so a
    /// repair never races an in-flight mutation on the same account
    pub fn with_locks(store: Arc<dyn LedgerStore>, locks: Arc<AccountLocks>) -> Self {
        Self { store, locks }
    }

    /// Recompute an account's balance from its transaction history without
    /// mutating anything
    pub async fn recompute_balance(&self, account_id: Uuid) -> Result<Amount> {
        let account = self.fetch_account(account_id).await?;
        recompute_for(self.store.as_ref(), &account).await
    }

    /// Compare the stored balance to the recomputed one and overwrite it if
    /// they disagree.
    ///
    /// Running twice without intervening mutations reports
    /// `corrected: false` the second time.
    pub async fn reconcile(&self, account_id: Uuid) -> Result<ReconcileReport> {
        let _guard = self.locks.acquire(account_id).await;

        let account = self.fetch_account(account_id).await?;
        let recomputed = recompute_for(self.store.as_ref(), &account).await?;

        if recomputed == account.balance {
            debug!("account {} balance {} matches its history", account_id, account.balance);
            return Ok(ReconcileReport {
                account_id,
                previous: account.balance,
                recomputed,
                corrected: false,
            });
        }

        warn!(
            "account {} balance drifted: stored {}, recomputed {}; correcting",
            account_id, account.balance, recomputed
        );
        self.store
            .set_balance(account_id, recomputed)
            .await
            .with_context(|| format!("failed to repair balance of account {}", account_id))?;

        Ok(ReconcileReport {
            account_id,
            previous: account.balance,
            recomputed,
            corrected: true,
        })
    }

    /// Reconcile every account in a workspace
    pub async fn reconcile_workspace(&self, workspace_id: Uuid) -> Result<Vec<ReconcileReport>> {
        let accounts = self.store.list_accounts(workspace_id).await?;
        let mut reports = Vec::with_capacity(accounts.len());
        for account in accounts {
            reports.push(self.reconcile(account.id).await?);
        }
        Ok(reports)
    }

    async fn fetch_account(&self, account_id: Uuid) -> Result<Account> {
        self.store
            .get_account(account_id)
            .await?
            .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", account_id)))
    }
}

async fn recompute_for(store: &dyn LedgerStore, account: &Account) -> Result<Amount> {
    let transactions = store.transactions_for_account(account.id).await?;
    let mut balance = account.opening_balance;
    for txn in &transactions {
        balance += balance_delta(txn.kind, txn.amount)?;
    }
    Ok(balance)
}
