//! Per-account mutual exclusion
//!
//! Every mutator operation is a read-modify-write against one or two
//! account rows. The registry hands out one async mutex per account id so
//! those sequences serialize; multi-account operations always acquire in
//! sorted id order so two transfers between the same pair of accounts
//! cannot deadlock each other.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of per-account async locks
#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AccountLocks {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn handle(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        self.locks.entry(account_id).or_default().clone()
    }

    /// Acquire the lock for a single account
    pub async fn acquire(&self, account_id: Uuid) -> OwnedMutexGuard<()> {
        self.handle(account_id).lock_owned().await
    }

    /// Acquire the locks for two distinct accounts in sorted id order
    pub async fn acquire_pair(
        &self,
        first: Uuid,
        second: Uuid,
    ) -> (OwnedMutexGuard<()>, OwnedMutexGuard<()>) {
        debug_assert_ne!(first, second);
        if first < second {
            let a = self.acquire(first).await;
            let b = self.acquire(second).await;
            (a, b)
        } else {
            let b = self.acquire(second).await;
            let a = self.acquire(first).await;
            (a, b)
        }
    }

    /// Acquire the locks for a set of accounts; ids are deduplicated and
    /// taken in sorted order
    pub async fn acquire_many(&self, account_ids: &[Uuid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<Uuid> = account_ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.acquire(id).await);
        }
        guards
    }
}
