//! Balance consistency engine for the Homeledger finance tracker
//!
//! Keeps each account's cached balance in agreement with the transactions
//! posted against it, across create/update/delete/bulk operations, under
//! partial failure and concurrent access. The mutator and the
//! reconciliation service operate on one `LedgerStore` and share one
//! per-account lock registry; `LedgerEngine` wires the three together.

use std::sync::Arc;

pub mod config;
pub mod delta;
pub mod locks;
pub mod mutator;
pub mod reconciliation;
pub mod store;

pub use config::LedgerConfig;
pub use delta::balance_delta;
pub use locks::AccountLocks;
pub use mutator::TransactionMutator;
pub use reconciliation::{ReconcileReport, ReconciliationService};
pub use store::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore};

use common::error::Result;

/// Store backend selector
pub enum StoreBackend {
    /// In-memory store
    InMemory,
    /// PostgreSQL store with an optional database URL override
    Postgres(Option<String>),
}

/// Engine facade: a mutator and a reconciliation service over one store,
/// sharing one per-account lock registry
pub struct LedgerEngine {
    store: Arc<dyn LedgerStore>,
    mutator: TransactionMutator,
    reconciliation: ReconciliationService,
}

impl LedgerEngine {
    /// Wire an engine over an existing store
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        let locks = Arc::new(AccountLocks::new());
        Self {
            mutator: TransactionMutator::with_locks(Arc::clone(&store), Arc::clone(&locks)),
            reconciliation: ReconciliationService::with_locks(Arc::clone(&store), locks),
            store,
        }
    }

    /// Create an engine with a specific store backend
    pub async fn with_backend(backend: StoreBackend) -> Result<Self> {
        let store: Arc<dyn LedgerStore> = match backend {
            StoreBackend::InMemory => Arc::new(InMemoryLedgerStore::new()),
            StoreBackend::Postgres(database_url) => {
                Arc::new(PostgresLedgerStore::new(database_url).await?)
            }
        };
        Ok(Self::new(store))
    }

    /// Create an engine backed by PostgreSQL with a configuration
    pub async fn with_config(config: &LedgerConfig) -> Result<Self> {
        let store = Arc::new(PostgresLedgerStore::with_config(config).await?);
        Ok(Self::new(store))
    }

    /// The underlying store
    pub fn store(&self) -> Arc<dyn LedgerStore> {
        Arc::clone(&self.store)
    }

    /// The transaction mutator
    pub fn mutator(&self) -> &TransactionMutator {
        &self.mutator
    }

    /// The reconciliation service
    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }
}
