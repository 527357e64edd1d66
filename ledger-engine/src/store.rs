//! Ledger store for account and transaction data
//!
//! Defines the storage adapter the engine mutates through, plus two
//! implementations: a DashMap-backed in-memory store and a PostgreSQL
//! store. Both expose `adjust_balance` as an atomic increment so a single
//! balance bump can never lose a concurrent update; the multi-statement
//! sequences built on top are the mutator's responsibility.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

use common::decimal::Amount;
use common::error::{Error, Result};
use common::model::account::{Account, NewAccount};
use common::model::transaction::Transaction;

use crate::config::LedgerConfig;

/// Ledger store trait defining the interface the engine mutates through
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Create a new account from a creation payload
    async fn create_account(&self, new: NewAccount) -> Result<Account>;

    /// Get an account by ID
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>>;

    /// List all accounts in a workspace
    async fn list_accounts(&self, workspace_id: Uuid) -> Result<Vec<Account>>;

    /// Soft-delete an account; its transaction history stays in place
    async fn deactivate_account(&self, id: Uuid) -> Result<Account>;

    /// Atomically add a signed delta to an account's balance and return the
    /// new balance
    async fn adjust_balance(&self, id: Uuid, delta: Amount) -> Result<Amount>;

    /// Overwrite an account's balance; reserved for reconciliation repair
    async fn set_balance(&self, id: Uuid, balance: Amount) -> Result<()>;

    /// Insert a transaction row
    async fn insert_transaction(&self, txn: Transaction) -> Result<Transaction>;

    /// Get a transaction by ID
    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>>;

    /// Replace an existing transaction row
    async fn update_transaction(&self, txn: Transaction) -> Result<Transaction>;

    /// Delete a transaction row
    async fn delete_transaction(&self, id: Uuid) -> Result<()>;

    /// All transactions posted against an account
    async fn transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>>;

    /// The legs sharing a transfer id
    async fn transactions_for_transfer(&self, transfer_id: Uuid) -> Result<Vec<Transaction>>;
}

/// In-memory ledger store
pub struct InMemoryLedgerStore {
    /// Accounts by ID
    pub accounts: DashMap<Uuid, Account>,
    /// Transactions by ID
    pub transactions: DashMap<Uuid, Transaction>,
}

impl InMemoryLedgerStore {
    /// Create a new in-memory ledger store
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            transactions: DashMap::new(),
        }
    }
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn create_account(&self, new: NewAccount) -> Result<Account> {
        let account = Account::from_new(new);
        self.accounts.insert(account.id, account.clone());
        Ok(account)
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    async fn list_accounts(&self, workspace_id: Uuid) -> Result<Vec<Account>> {
        let accounts = self
            .accounts
            .iter()
            .filter(|entry| entry.value().workspace_id == workspace_id)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(accounts)
    }

    async fn deactivate_account(&self, id: Uuid) -> Result<Account> {
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", id)))?;
        entry.is_active = false;
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }

    async fn adjust_balance(&self, id: Uuid, delta: Amount) -> Result<Amount> {
        // get_mut holds the shard write lock for the duration of the
        // mutation, which makes the increment atomic
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", id)))?;
        entry.apply_delta(delta);
        Ok(entry.balance)
    }

    async fn set_balance(&self, id: Uuid, balance: Amount) -> Result<()> {
        let mut entry = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", id)))?;
        entry.balance = balance;
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn insert_transaction(&self, txn: Transaction) -> Result<Transaction> {
        self.transactions.insert(txn.id, txn.clone());
        Ok(txn)
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        Ok(self.transactions.get(&id).map(|t| t.clone()))
    }

    async fn update_transaction(&self, txn: Transaction) -> Result<Transaction> {
        let mut entry = self
            .transactions
            .get_mut(&txn.id)
            .ok_or_else(|| Error::TransactionNotFound(format!("transaction not found: {}", txn.id)))?;
        *entry = txn.clone();
        Ok(txn)
    }

    async fn delete_transaction(&self, id: Uuid) -> Result<()> {
        self.transactions
            .remove(&id)
            .ok_or_else(|| Error::TransactionNotFound(format!("transaction not found: {}", id)))?;
        Ok(())
    }

    async fn transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>> {
        let transactions = self
            .transactions
            .iter()
            .filter(|entry| entry.value().account_id == account_id)
            .map(|entry| entry.value().clone())
            .collect();
        Ok(transactions)
    }

    async fn transactions_for_transfer(&self, transfer_id: Uuid) -> Result<Vec<Transaction>> {
        let transactions = self
            .transactions
            .iter()
            .filter(|entry| entry.value().transfer_id == Some(transfer_id))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(transactions)
    }
}

/// PostgreSQL ledger store
pub struct PostgresLedgerStore {
    /// Database connection pool
    pool: PgPool,
    /// Upper bound on any single statement
    statement_timeout: Duration,
}

impl PostgresLedgerStore {
    /// Create a new PostgreSQL ledger store
    pub async fn new(database_url: Option<String>) -> Result<Self> {
        let database_url = match database_url {
            Some(url) => url,
            None => std::env::var("DATABASE_URL")
                .map_err(|_| Error::Validation("DATABASE_URL must be set".to_string()))?,
        };

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&database_url)
            .await
            .map_err(Error::Database)?;

        info!("Connected to PostgreSQL database");

        Ok(Self {
            pool,
            statement_timeout: Duration::from_millis(5_000),
        })
    }

    /// Create a new PostgreSQL ledger store with configuration
    pub async fn with_config(config: &LedgerConfig) -> Result<Self> {
        info!(
            "Connecting to PostgreSQL database with pool size: {}",
            config.db_pool_size
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.db_pool_size)
            .connect(&config.database_url)
            .await
            .map_err(Error::Database)?;

        info!("Connected to PostgreSQL database");

        Ok(Self {
            pool,
            statement_timeout: config.statement_timeout(),
        })
    }

    /// Create the accounts and transactions tables if they do not exist
    pub async fn ensure_schema(&self) -> Result<()> {
        debug!("Ensuring ledger schema exists");

        self.bounded(
            "create accounts table",
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS accounts (
                    id UUID PRIMARY KEY,
                    workspace_id UUID NOT NULL,
                    balance NUMERIC(18, 2) NOT NULL,
                    opening_balance NUMERIC(18, 2) NOT NULL,
                    currency TEXT NOT NULL,
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
            )
            .execute(&self.pool),
        )
        .await?;

        self.bounded(
            "create transactions table",
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS transactions (
                    id UUID PRIMARY KEY,
                    workspace_id UUID NOT NULL,
                    account_id UUID NOT NULL REFERENCES accounts (id),
                    kind TEXT NOT NULL,
                    amount NUMERIC(18, 2) NOT NULL CHECK (amount > 0),
                    currency TEXT NOT NULL,
                    category TEXT,
                    description TEXT,
                    transaction_date DATE NOT NULL,
                    created_by UUID NOT NULL,
                    transfer_id UUID,
                    created_at TIMESTAMPTZ NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL
                )",
            )
            .execute(&self.pool),
        )
        .await?;

        self.bounded(
            "create account index",
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_transactions_account_id
                 ON transactions (account_id)",
            )
            .execute(&self.pool),
        )
        .await?;

        self.bounded(
            "create transfer index",
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_transactions_transfer_id
                 ON transactions (transfer_id) WHERE transfer_id IS NOT NULL",
            )
            .execute(&self.pool),
        )
        .await?;

        Ok(())
    }

    /// Run a statement future under the configured timeout. An elapsed
    /// timeout surfaces as a retryable persistence failure, never a hang.
    async fn bounded<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.statement_timeout, fut).await {
            Ok(result) => result.map_err(Error::Database),
            Err(_) => Err(Error::Persistence(format!(
                "{} timed out after {:?}",
                op, self.statement_timeout
            ))),
        }
    }
}

fn account_from_row(row: &PgRow) -> Account {
    Account {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        balance: row.get("balance"),
        opening_balance: row.get("opening_balance"),
        currency: row.get("currency"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let kind: String = row.get("kind");
    Ok(Transaction {
        id: row.get("id"),
        workspace_id: row.get("workspace_id"),
        account_id: row.get("account_id"),
        kind: kind.parse()?,
        amount: row.get("amount"),
        currency: row.get("currency"),
        category: row.get("category"),
        description: row.get("description"),
        transaction_date: row.get("transaction_date"),
        created_by: row.get("created_by"),
        transfer_id: row.get("transfer_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn create_account(&self, new: NewAccount) -> Result<Account> {
        let account = Account::from_new(new);
        debug!("Creating account {} in database", account.id);

        self.bounded(
            "insert account",
            sqlx::query(
                "INSERT INTO accounts
                 (id, workspace_id, balance, opening_balance, currency, is_active, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(account.id)
            .bind(account.workspace_id)
            .bind(account.balance)
            .bind(account.opening_balance)
            .bind(&account.currency)
            .bind(account.is_active)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&self.pool),
        )
        .await?;

        Ok(account)
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        debug!("Getting account from database: {}", id);

        let row = self
            .bounded(
                "select account",
                sqlx::query(
                    "SELECT id, workspace_id, balance, opening_balance, currency, is_active,
                            created_at, updated_at
                     FROM accounts WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(|row| account_from_row(&row)))
    }

    async fn list_accounts(&self, workspace_id: Uuid) -> Result<Vec<Account>> {
        debug!("Listing accounts for workspace: {}", workspace_id);

        let rows = self
            .bounded(
                "select workspace accounts",
                sqlx::query(
                    "SELECT id, workspace_id, balance, opening_balance, currency, is_active,
                            created_at, updated_at
                     FROM accounts WHERE workspace_id = $1 ORDER BY created_at",
                )
                .bind(workspace_id)
                .fetch_all(&self.pool),
            )
            .await?;

        Ok(rows.iter().map(account_from_row).collect())
    }

    async fn deactivate_account(&self, id: Uuid) -> Result<Account> {
        debug!("Deactivating account: {}", id);

        let row = self
            .bounded(
                "deactivate account",
                sqlx::query(
                    "UPDATE accounts SET is_active = FALSE, updated_at = $2
                     WHERE id = $1
                     RETURNING id, workspace_id, balance, opening_balance, currency, is_active,
                               created_at, updated_at",
                )
                .bind(id)
                .bind(Utc::now())
                .fetch_optional(&self.pool),
            )
            .await?
            .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", id)))?;

        Ok(account_from_row(&row))
    }

    async fn adjust_balance(&self, id: Uuid, delta: Amount) -> Result<Amount> {
        debug!("Adjusting balance of account {} by {}", id, delta);

        // Single-statement atomic increment; concurrent adjustments cannot
        // lose updates regardless of application-level interleaving
        let row = self
            .bounded(
                "adjust balance",
                sqlx::query(
                    "UPDATE accounts SET balance = balance + $2, updated_at = $3
                     WHERE id = $1
                     RETURNING balance",
                )
                .bind(id)
                .bind(delta)
                .bind(Utc::now())
                .fetch_optional(&self.pool),
            )
            .await?
            .ok_or_else(|| Error::AccountNotFound(format!("account not found: {}", id)))?;

        Ok(row.get("balance"))
    }

    async fn set_balance(&self, id: Uuid, balance: Amount) -> Result<()> {
        debug!("Setting balance of account {} to {}", id, balance);

        let result = self
            .bounded(
                "set balance",
                sqlx::query(
                    "UPDATE accounts SET balance = $2, updated_at = $3 WHERE id = $1",
                )
                .bind(id)
                .bind(balance)
                .bind(Utc::now())
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::AccountNotFound(format!("account not found: {}", id)));
        }

        Ok(())
    }

    async fn insert_transaction(&self, txn: Transaction) -> Result<Transaction> {
        debug!("Inserting transaction {} for account {}", txn.id, txn.account_id);

        self.bounded(
            "insert transaction",
            sqlx::query(
                "INSERT INTO transactions
                 (id, workspace_id, account_id, kind, amount, currency, category, description,
                  transaction_date, created_by, transfer_id, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(txn.id)
            .bind(txn.workspace_id)
            .bind(txn.account_id)
            .bind(txn.kind.as_str())
            .bind(txn.amount)
            .bind(&txn.currency)
            .bind(&txn.category)
            .bind(&txn.description)
            .bind(txn.transaction_date)
            .bind(txn.created_by)
            .bind(txn.transfer_id)
            .bind(txn.created_at)
            .bind(txn.updated_at)
            .execute(&self.pool),
        )
        .await?;

        Ok(txn)
    }

    async fn get_transaction(&self, id: Uuid) -> Result<Option<Transaction>> {
        debug!("Getting transaction from database: {}", id);

        let row = self
            .bounded(
                "select transaction",
                sqlx::query(
                    "SELECT id, workspace_id, account_id, kind, amount, currency, category,
                            description, transaction_date, created_by, transfer_id,
                            created_at, updated_at
                     FROM transactions WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool),
            )
            .await?;

        row.map(|row| transaction_from_row(&row)).transpose()
    }

    async fn update_transaction(&self, txn: Transaction) -> Result<Transaction> {
        debug!("Updating transaction: {}", txn.id);

        let result = self
            .bounded(
                "update transaction",
                sqlx::query(
                    "UPDATE transactions
                     SET account_id = $2, kind = $3, amount = $4, currency = $5, category = $6,
                         description = $7, transaction_date = $8, updated_at = $9
                     WHERE id = $1",
                )
                .bind(txn.id)
                .bind(txn.account_id)
                .bind(txn.kind.as_str())
                .bind(txn.amount)
                .bind(&txn.currency)
                .bind(&txn.category)
                .bind(&txn.description)
                .bind(txn.transaction_date)
                .bind(txn.updated_at)
                .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TransactionNotFound(format!(
                "transaction not found: {}",
                txn.id
            )));
        }

        Ok(txn)
    }

    async fn delete_transaction(&self, id: Uuid) -> Result<()> {
        debug!("Deleting transaction: {}", id);

        let result = self
            .bounded(
                "delete transaction",
                sqlx::query("DELETE FROM transactions WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool),
            )
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::TransactionNotFound(format!("transaction not found: {}", id)));
        }

        Ok(())
    }

    async fn transactions_for_account(&self, account_id: Uuid) -> Result<Vec<Transaction>> {
        debug!("Listing transactions for account: {}", account_id);

        let rows = self
            .bounded(
                "select account transactions",
                sqlx::query(
                    "SELECT id, workspace_id, account_id, kind, amount, currency, category,
                            description, transaction_date, created_by, transfer_id,
                            created_at, updated_at
                     FROM transactions WHERE account_id = $1 ORDER BY created_at",
                )
                .bind(account_id)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.iter().map(transaction_from_row).collect()
    }

    async fn transactions_for_transfer(&self, transfer_id: Uuid) -> Result<Vec<Transaction>> {
        debug!("Listing legs for transfer: {}", transfer_id);

        let rows = self
            .bounded(
                "select transfer legs",
                sqlx::query(
                    "SELECT id, workspace_id, account_id, kind, amount, currency, category,
                            description, transaction_date, created_by, transfer_id,
                            created_at, updated_at
                     FROM transactions WHERE transfer_id = $1",
                )
                .bind(transfer_id)
                .fetch_all(&self.pool),
            )
            .await?;

        rows.iter().map(transaction_from_row).collect()
    }
}
