//! Account models and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Amount;

/// Account model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account ID
    pub id: Uuid,
    /// Owning workspace (tenant boundary)
    pub workspace_id: Uuid,
    /// Cached balance; kept equal to `opening_balance` plus the sum of
    /// signed deltas of every transaction posted against this account
    pub balance: Amount,
    /// Starting balance supplied at creation; immutable afterwards
    pub opening_balance: Amount,
    /// ISO 4217 currency code (e.g. "EUR", "USD")
    pub currency: String,
    /// Soft-delete flag; accounts with history are deactivated, never removed
    pub is_active: bool,
    /// Account creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

/// Payload for creating an account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    /// Owning workspace
    pub workspace_id: Uuid,
    /// Starting balance
    pub opening_balance: Amount,
    /// ISO 4217 currency code
    pub currency: String,
}

impl Account {
    /// Create a new active account from a creation payload
    pub fn from_new(new: NewAccount) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: new.workspace_id,
            balance: new.opening_balance,
            opening_balance: new.opening_balance,
            currency: new.currency,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a signed delta to the cached balance
    pub fn apply_delta(&mut self, delta: Amount) {
        self.balance += delta;
        self.updated_at = Utc::now();
    }
}
