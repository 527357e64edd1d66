//! Transaction mutator
//!
//! The one code path through which transactions are created, updated, and
//! deleted. Every operation pairs its row write with the matching balance
//! adjustment and either completes both or compensates the one that
//! happened, so the account invariant (balance == opening balance + sum of
//! posted deltas) holds at every commit point.
//!
//! Storage writes are per-statement atomic; the multi-statement sequences
//! here are protected by per-account locks (`AccountLocks`) and by
//! compensating actions on the failure paths. When a compensating action
//! itself fails the error escalates to `Error::Consistency` and the account
//! is left for the reconciliation service to repair.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use common::decimal::{precision, Amount};
use common::error::{Error, ErrorExt, Result};
use common::model::account::Account;
use common::model::transaction::{
    Transaction, TransactionDraft, TransactionKind, TransactionPatch, TransferDraft,
};
use common::model::workspace::WorkspaceContext;

use crate::delta::balance_delta;
use crate::locks::AccountLocks;
use crate::store::LedgerStore;

/// Attempts to stabilize the lock set of an operation whose target accounts
/// are only known after reading the transaction row
const MAX_LOCK_ATTEMPTS: usize = 5;

/// Transaction mutator orchestrating all balance-affecting writes
pub struct TransactionMutator {
    /// Ledger storage adapter
    store: Arc<dyn LedgerStore>,
    /// Per-account serialization
    locks: Arc<AccountLocks>,
}

impl TransactionMutator {
    /// Create a mutator with its own lock registry
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self::with_locks(store, Arc::new(AccountLocks::new()))
    }

    /// Create a mutator sharing a lock registry with other engine services
    pub fn with_locks(store: Arc<dyn LedgerStore>, locks: Arc<AccountLocks>) -> Self {
        Self { store, locks }
    }

    /// Create a transaction and apply its delta to the owning account.
    ///
    /// The insert and the balance update succeed together or not at all: a
    /// failed balance update triggers a compensating delete of the inserted
    /// row before the error is returned.
    pub async fn create_transaction(&self, draft: TransactionDraft) -> Result<Transaction> {
        if draft.kind == TransactionKind::Transfer {
            return Err(Error::Validation(
                "single-sided transfer creation is not allowed; use create_transfer".to_string(),
            ));
        }
        validated_amount(draft.amount)?;
        let delta = balance_delta(draft.kind, draft.amount)?;

        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        shielded(async move {
            let _guard = locks.acquire(draft.account_id).await;
            let account = fetch_posting_account(
                store.as_ref(),
                draft.workspace_id,
                draft.account_id,
                &draft.currency,
            )
            .await?;

            let inserted = store
                .insert_transaction(Transaction::from_draft(&draft))
                .await
                .with_context(|| format!("failed to insert transaction on account {}", account.id))?;
            match store.adjust_balance(account.id, delta).await {
                Ok(new_balance) => {
                    info!(
                        "created transaction {} on account {}, balance now {}",
                        inserted.id, account.id, new_balance
                    );
                    Ok(inserted)
                }
                Err(adjust_err) => {
                    warn!(
                        "balance update for transaction {} failed, rolling the insert back: {}",
                        inserted.id, adjust_err
                    );
                    match store.delete_transaction(inserted.id).await {
                        Ok(()) => Err(adjust_err),
                        Err(rollback_err) => {
                            error!(
                                "compensating delete of transaction {} failed: {}",
                                inserted.id, rollback_err
                            );
                            Err(Error::Consistency(format!(
                                "transaction {} was inserted but its balance update and the \
                                 compensating delete both failed; account {} needs reconciliation",
                                inserted.id, account.id
                            )))
                        }
                    }
                }
            }
        })
        .await
    }

    /// Create a transfer as a linked expense leg and income leg.
    ///
    /// Both rows and both balance adjustments land together; any partial
    /// write is unwound before the error surfaces.
    pub async fn create_transfer(&self, draft: TransferDraft) -> Result<(Transaction, Transaction)> {
        validated_amount(draft.amount)?;
        if draft.source_account_id == draft.destination_account_id {
            return Err(Error::Validation(
                "transfer source and destination must be distinct accounts".to_string(),
            ));
        }

        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        shielded(async move {
            let _guards = locks
                .acquire_pair(draft.source_account_id, draft.destination_account_id)
                .await;

            let source = fetch_posting_account(
                store.as_ref(),
                draft.workspace_id,
                draft.source_account_id,
                &draft.currency,
            )
            .await?;
            let destination = fetch_posting_account(
                store.as_ref(),
                draft.workspace_id,
                draft.destination_account_id,
                &draft.currency,
            )
            .await?;

            let (expense_leg, income_leg) = draft.legs();
            let out_delta = balance_delta(expense_leg.kind, expense_leg.amount)?;
            let in_delta = balance_delta(income_leg.kind, income_leg.amount)?;

            let expense_row = store.insert_transaction(expense_leg).await?;
            let income_row = match store.insert_transaction(income_leg).await {
                Ok(row) => row,
                Err(err) => {
                    return Err(unwind_writes(store.as_ref(), &[expense_row.id], &[], err).await);
                }
            };
            if let Err(err) = store.adjust_balance(source.id, out_delta).await {
                return Err(
                    unwind_writes(store.as_ref(), &[expense_row.id, income_row.id], &[], err).await,
                );
            }
            if let Err(err) = store.adjust_balance(destination.id, in_delta).await {
                return Err(unwind_writes(
                    store.as_ref(),
                    &[expense_row.id, income_row.id],
                    &[(source.id, -out_delta)],
                    err,
                )
                .await);
            }

            info!(
                "created transfer {} of {} {} from account {} to account {}",
                expense_row.transfer_id.map(|id| id.to_string()).unwrap_or_default(),
                expense_row.amount,
                expense_row.currency,
                source.id,
                destination.id
            );
            Ok((expense_row, income_row))
        })
        .await
    }

    /// Update a transaction, reversing its old delta and applying the new
    /// one; moving the transaction to another account adjusts both.
    pub async fn update_transaction(
        &self,
        ctx: &WorkspaceContext,
        id: Uuid,
        patch: TransactionPatch,
    ) -> Result<Transaction> {
        if let Some(amount) = patch.amount {
            validated_amount(amount)?;
        }
        if patch.kind == Some(TransactionKind::Transfer) {
            return Err(Error::Validation(
                "a transaction cannot be turned into a transfer; delete it and create a transfer"
                    .to_string(),
            ));
        }

        let ctx = *ctx;
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        shielded(async move {
            for _ in 0..MAX_LOCK_ATTEMPTS {
                // The lock set depends on the row's current account, so read
                // once to learn it, lock, then re-read under the lock.
                let snapshot = fetch_scoped_transaction(store.as_ref(), &ctx, id).await?;
                if snapshot.is_transfer_leg() && patch.changes_structure() {
                    return Err(Error::Validation(format!(
                        "transaction {} is a transfer leg; its kind, amount, and account are fixed",
                        id
                    )));
                }

                let target_account_id = patch.account_id.unwrap_or(snapshot.account_id);
                let _guards = if target_account_id == snapshot.account_id {
                    vec![locks.acquire(snapshot.account_id).await]
                } else {
                    let (a, b) = locks.acquire_pair(snapshot.account_id, target_account_id).await;
                    vec![a, b]
                };

                let current = fetch_scoped_transaction(store.as_ref(), &ctx, id).await?;
                if current.account_id != snapshot.account_id {
                    continue;
                }

                return apply_update(store.as_ref(), &ctx, current, &patch).await;
            }
            Err(Error::Persistence(format!(
                "could not stabilize account locks for update of transaction {}; retry",
                id
            )))
        })
        .await
    }

    /// Delete a transaction, reversing its balance effect first.
    ///
    /// The balance is adjusted before the row goes away (fail closed); if
    /// the row delete then fails, the adjustment is reversed. Deleting a
    /// transfer leg removes the whole pair.
    pub async fn delete_transaction(&self, ctx: &WorkspaceContext, id: Uuid) -> Result<()> {
        let ctx = *ctx;
        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        shielded(async move {
            for _ in 0..MAX_LOCK_ATTEMPTS {
                let snapshot = fetch_scoped_transaction(store.as_ref(), &ctx, id).await?;

                if let Some(transfer_id) = snapshot.transfer_id {
                    let legs = store.transactions_for_transfer(transfer_id).await?;
                    let mut account_ids: Vec<Uuid> = legs.iter().map(|l| l.account_id).collect();
                    account_ids.sort();
                    let _guards = locks.acquire_many(&account_ids).await;

                    let current_legs = store.transactions_for_transfer(transfer_id).await?;
                    let mut current_ids: Vec<Uuid> =
                        current_legs.iter().map(|l| l.account_id).collect();
                    current_ids.sort();
                    if current_ids != account_ids {
                        continue;
                    }
                    if current_legs.is_empty() {
                        return Err(Error::TransactionNotFound(format!(
                            "transaction not found: {}",
                            id
                        )));
                    }

                    return delete_transfer_legs(store.as_ref(), current_legs).await;
                }

                let _guard = locks.acquire(snapshot.account_id).await;
                let current = fetch_scoped_transaction(store.as_ref(), &ctx, id).await?;
                if current.account_id != snapshot.account_id || current.is_transfer_leg() {
                    continue;
                }

                return delete_single(store.as_ref(), current).await;
            }
            Err(Error::Persistence(format!(
                "could not stabilize account locks for delete of transaction {}; retry",
                id
            )))
        })
        .await
    }

    /// Create a batch of transactions, one summed balance adjustment per
    /// account.
    ///
    /// Every draft is validated before anything is written. Groups for
    /// independent accounts run concurrently; on any failure the whole
    /// batch is unwound so no subset survives without its balance effect.
    pub async fn bulk_create_transactions(
        &self,
        drafts: Vec<TransactionDraft>,
    ) -> Result<Vec<Transaction>> {
        if drafts.is_empty() {
            return Ok(Vec::new());
        }
        for draft in &drafts {
            if draft.kind == TransactionKind::Transfer {
                return Err(Error::Validation(
                    "bulk creation does not accept transfers; use create_transfer".to_string(),
                ));
            }
            validated_amount(draft.amount)?;
        }

        let store = Arc::clone(&self.store);
        let locks = Arc::clone(&self.locks);
        shielded(async move {
            // All-or-nothing precondition check before the first write
            let mut accounts: HashMap<Uuid, Account> = HashMap::new();
            for draft in &drafts {
                if !accounts.contains_key(&draft.account_id) {
                    let account = store.get_account(draft.account_id).await?.ok_or_else(|| {
                        Error::AccountNotFound(format!("account not found: {}", draft.account_id))
                    })?;
                    accounts.insert(draft.account_id, account);
                }
                let account = &accounts[&draft.account_id];
                check_posting_preconditions(account, draft.workspace_id, &draft.currency)?;
            }

            let mut groups: HashMap<Uuid, Vec<(usize, TransactionDraft)>> = HashMap::new();
            for (idx, draft) in drafts.into_iter().enumerate() {
                groups.entry(draft.account_id).or_default().push((idx, draft));
            }

            let group_futures = groups.into_iter().map(|(account_id, items)| {
                let store = Arc::clone(&store);
                let locks = Arc::clone(&locks);
                async move { apply_group(store, locks, account_id, items).await }
            });
            let results = futures::future::join_all(group_futures).await;

            let mut succeeded: Vec<GroupOutcome> = Vec::new();
            let mut failure: Option<Error> = None;
            for result in results {
                match result {
                    Ok(outcome) => succeeded.push(outcome),
                    Err(err) => failure = Some(pick_failure(failure.take(), err)),
                }
            }

            if let Some(err) = failure {
                let mut broken = matches!(err, Error::Consistency(_));
                for group in &succeeded {
                    let _guard = locks.acquire(group.account_id).await;
                    if let Err(undo_err) =
                        store.adjust_balance(group.account_id, -group.total_delta).await
                    {
                        error!(
                            "could not reverse bulk adjustment on account {}: {}",
                            group.account_id, undo_err
                        );
                        broken = true;
                    }
                    for (_, row) in &group.rows {
                        if let Err(undo_err) = store.delete_transaction(row.id).await {
                            error!(
                                "could not remove bulk transaction {} during rollback: {}",
                                row.id, undo_err
                            );
                            broken = true;
                        }
                    }
                }
                return Err(if broken && !matches!(err, Error::Consistency(_)) {
                    Error::Consistency(format!(
                        "bulk create could not be fully rolled back after: {}",
                        err
                    ))
                } else {
                    err
                });
            }

            let mut indexed: Vec<(usize, Transaction)> =
                succeeded.into_iter().flat_map(|group| group.rows).collect();
            indexed.sort_by_key(|(idx, _)| *idx);
            info!("bulk-created {} transactions", indexed.len());
            Ok(indexed.into_iter().map(|(_, txn)| txn).collect())
        })
        .await
    }
}

/// Rows inserted and the summed delta applied for one account of a batch
struct GroupOutcome {
    account_id: Uuid,
    total_delta: Amount,
    rows: Vec<(usize, Transaction)>,
}

/// Insert one account's share of a batch and apply its summed delta
async fn apply_group(
    store: Arc<dyn LedgerStore>,
    locks: Arc<AccountLocks>,
    account_id: Uuid,
    items: Vec<(usize, TransactionDraft)>,
) -> Result<GroupOutcome> {
    let mut total_delta = Amount::ZERO;
    for (_, draft) in &items {
        total_delta += balance_delta(draft.kind, draft.amount)?;
    }

    let _guard = locks.acquire(account_id).await;
    let mut rows: Vec<(usize, Transaction)> = Vec::with_capacity(items.len());
    for (idx, draft) in &items {
        match store.insert_transaction(Transaction::from_draft(draft)).await {
            Ok(txn) => rows.push((*idx, txn)),
            Err(err) => {
                let row_ids: Vec<Uuid> = rows.iter().map(|(_, row)| row.id).collect();
                return Err(unwind_writes(store.as_ref(), &row_ids, &[], err).await);
            }
        }
    }

    match store.adjust_balance(account_id, total_delta).await {
        Ok(_) => Ok(GroupOutcome {
            account_id,
            total_delta,
            rows,
        }),
        Err(err) => {
            let row_ids: Vec<Uuid> = rows.iter().map(|(_, row)| row.id).collect();
            Err(unwind_writes(store.as_ref(), &row_ids, &[], err).await)
        }
    }
}

/// Apply a patch to a transaction whose lock set is already held
async fn apply_update(
    store: &dyn LedgerStore,
    ctx: &WorkspaceContext,
    existing: Transaction,
    patch: &TransactionPatch,
) -> Result<Transaction> {
    let updated = patch.apply_to(&existing);
    let old_delta = balance_delta(existing.kind, existing.amount)?;
    let new_delta = balance_delta(updated.kind, updated.amount)?;

    if updated.account_id == existing.account_id {
        if updated.currency != existing.currency {
            let account = store.get_account(existing.account_id).await?.ok_or_else(|| {
                Error::AccountNotFound(format!("account not found: {}", existing.account_id))
            })?;
            if account.currency != updated.currency {
                return Err(Error::Validation(format!(
                    "currency {} does not match account {} currency {}",
                    updated.currency, account.id, account.currency
                )));
            }
        }

        let diff = new_delta - old_delta;
        if diff != Amount::ZERO {
            store.adjust_balance(existing.account_id, diff).await?;
        }
        match store.update_transaction(updated).await {
            Ok(txn) => {
                info!("updated transaction {} on account {}", txn.id, txn.account_id);
                Ok(txn)
            }
            Err(err) if diff != Amount::ZERO => {
                Err(unwind_writes(store, &[], &[(existing.account_id, -diff)], err).await)
            }
            Err(err) => Err(err),
        }
    } else {
        // Moving the transaction: reverse on the old account, apply on the
        // new one, then persist the row
        let target = fetch_posting_account(
            store,
            ctx.workspace_id,
            updated.account_id,
            &updated.currency,
        )
        .await?;

        store.adjust_balance(existing.account_id, -old_delta).await?;
        if let Err(err) = store.adjust_balance(target.id, new_delta).await {
            return Err(
                unwind_writes(store, &[], &[(existing.account_id, old_delta)], err).await,
            );
        }
        match store.update_transaction(updated).await {
            Ok(txn) => {
                info!(
                    "moved transaction {} from account {} to account {}",
                    txn.id, existing.account_id, target.id
                );
                Ok(txn)
            }
            Err(err) => Err(unwind_writes(
                store,
                &[],
                &[(target.id, -new_delta), (existing.account_id, old_delta)],
                err,
            )
            .await),
        }
    }
}

/// Delete a plain transaction whose account lock is already held
async fn delete_single(store: &dyn LedgerStore, txn: Transaction) -> Result<()> {
    let reverse = -balance_delta(txn.kind, txn.amount)?;
    store.adjust_balance(txn.account_id, reverse).await?;
    match store.delete_transaction(txn.id).await {
        Ok(()) => {
            info!("deleted transaction {} from account {}", txn.id, txn.account_id);
            Ok(())
        }
        Err(delete_err) => {
            warn!(
                "row delete of transaction {} failed after balance adjustment, reversing it: {}",
                txn.id, delete_err
            );
            match store.adjust_balance(txn.account_id, -reverse).await {
                Ok(_) => Err(delete_err),
                Err(rollback_err) => {
                    error!(
                        "could not reverse balance adjustment on account {}: {}",
                        txn.account_id, rollback_err
                    );
                    Err(Error::Consistency(format!(
                        "balance of account {} was adjusted but transaction {} could not be \
                         deleted nor the adjustment reversed; reconciliation required",
                        txn.account_id, txn.id
                    )))
                }
            }
        }
    }
}

/// Delete both legs of a transfer whose account locks are already held
async fn delete_transfer_legs(store: &dyn LedgerStore, legs: Vec<Transaction>) -> Result<()> {
    let mut applied: Vec<(Uuid, Amount)> = Vec::with_capacity(legs.len());
    for leg in &legs {
        let reverse = -balance_delta(leg.kind, leg.amount)?;
        match store.adjust_balance(leg.account_id, reverse).await {
            Ok(_) => applied.push((leg.account_id, -reverse)),
            Err(err) => return Err(unwind_writes(store, &[], &applied, err).await),
        }
    }

    let mut deleted: Vec<&Transaction> = Vec::with_capacity(legs.len());
    for leg in &legs {
        if let Err(delete_err) = store.delete_transaction(leg.id).await {
            warn!(
                "deleting transfer leg {} failed, restoring the pair: {}",
                leg.id, delete_err
            );
            let mut broken = false;
            for row in &deleted {
                if let Err(err) = store.insert_transaction((*row).clone()).await {
                    error!("could not restore transfer leg {}: {}", row.id, err);
                    broken = true;
                }
            }
            for (account_id, undo) in &applied {
                if let Err(err) = store.adjust_balance(*account_id, *undo).await {
                    error!(
                        "could not reverse balance adjustment on account {}: {}",
                        account_id, err
                    );
                    broken = true;
                }
            }
            return Err(if broken {
                Error::Consistency(format!(
                    "transfer deletion could not be fully rolled back after: {}",
                    delete_err
                ))
            } else {
                delete_err
            });
        }
        deleted.push(leg);
    }

    info!("deleted transfer pair of {} legs", legs.len());
    Ok(())
}

/// Undo inserted rows and applied balance adjustments after a failure.
///
/// Returns the error the operation should surface: the original cause when
/// the unwind succeeded (a clean, retryable rejection), or a consistency
/// escalation when part of the unwind failed too.
async fn unwind_writes(
    store: &dyn LedgerStore,
    inserted_rows: &[Uuid],
    reversals: &[(Uuid, Amount)],
    cause: Error,
) -> Error {
    let mut broken = false;
    for row_id in inserted_rows {
        if let Err(err) = store.delete_transaction(*row_id).await {
            error!("could not remove transaction {} during rollback: {}", row_id, err);
            broken = true;
        }
    }
    for (account_id, delta) in reversals {
        if let Err(err) = store.adjust_balance(*account_id, *delta).await {
            error!(
                "could not reverse balance adjustment on account {}: {}",
                account_id, err
            );
            broken = true;
        }
    }
    if broken {
        Error::Consistency(format!(
            "partial write could not be fully rolled back after: {}",
            cause
        ))
    } else {
        cause
    }
}

/// Keep the most severe of two batch failures
fn pick_failure(current: Option<Error>, incoming: Error) -> Error {
    match current {
        Some(existing) if matches!(existing, Error::Consistency(_)) => existing,
        _ => incoming,
    }
}

/// Amounts are strictly positive and carry at most two fractional digits
fn validated_amount(amount: Amount) -> Result<Amount> {
    if amount <= Amount::ZERO {
        return Err(Error::Validation(format!(
            "amount must be strictly positive, got {}",
            amount
        )));
    }
    if !precision::is_money(amount) {
        return Err(Error::Validation(format!(
            "amount {} has more than {} fractional digits",
            amount,
            precision::MONEY_PRECISION
        )));
    }
    Ok(amount)
}

fn check_posting_preconditions(
    account: &Account,
    workspace_id: Uuid,
    currency: &str,
) -> Result<()> {
    if account.workspace_id != workspace_id {
        return Err(Error::CrossWorkspace(format!(
            "account {} does not belong to workspace {}",
            account.id, workspace_id
        )));
    }
    if !account.is_active {
        return Err(Error::Validation(format!("account {} is inactive", account.id)));
    }
    if account.currency != currency {
        return Err(Error::Validation(format!(
            "currency {} does not match account {} currency {}",
            currency, account.id, account.currency
        )));
    }
    Ok(())
}

/// Load an account and verify it can be posted against
async fn fetch_posting_account(
    store: &dyn LedgerStore,
    workspace_id: Uuid,
    account_id: Uuid,
    currency: &str,
) -> Result<Account> {
    let account = store
        .get_account(account_id)
        .await?
        .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", account_id)))?;
    check_posting_preconditions(&account, workspace_id, currency)?;
    Ok(account)
}

/// Load a transaction scoped to the caller's workspace. Rows belonging to
/// other tenants read as absent.
async fn fetch_scoped_transaction(
    store: &dyn LedgerStore,
    ctx: &WorkspaceContext,
    id: Uuid,
) -> Result<Transaction> {
    let txn = store
        .get_transaction(id)
        .await?
        .ok_or_else(|| Error::TransactionNotFound(format!("transaction not found: {}", id)))?;
    if txn.workspace_id != ctx.workspace_id {
        return Err(Error::TransactionNotFound(format!("transaction not found: {}", id)));
    }
    Ok(txn)
}

/// Run a mutation's critical section on its own task so a caller dropping
/// the future cannot abandon a half-applied sequence; the section always
/// runs to completion or through its compensation path.
async fn shielded<T, F>(fut: F) -> Result<T>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(join_err) => Err(Error::Persistence(format!("mutation task aborted: {}", join_err))),
    }
}
