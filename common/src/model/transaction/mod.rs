//! Transaction models and related types

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Amount;
use crate::error::Error;

/// Transaction kind; the sign of the balance effect is derived from this,
/// amounts are always stored positive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    /// Money coming into the account
    Income,
    /// Money leaving the account
    Expense,
    /// Money moving between two accounts; never persisted as a single row,
    /// stored as a paired expense leg and income leg instead
    Transfer,
}

impl TransactionKind {
    /// Canonical lowercase name, also the storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
            TransactionKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "income" => Ok(TransactionKind::Income),
            "expense" => Ok(TransactionKind::Expense),
            "transfer" => Ok(TransactionKind::Transfer),
            other => Err(Error::Validation(format!("unknown transaction kind: {}", other))),
        }
    }
}

/// Transaction model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique transaction ID
    pub id: Uuid,
    /// Owning workspace
    pub workspace_id: Uuid,
    /// Account the transaction is posted against
    pub account_id: Uuid,
    /// Transaction kind
    pub kind: TransactionKind,
    /// Amount, strictly positive
    pub amount: Amount,
    /// ISO 4217 currency code
    pub currency: String,
    /// Optional category label
    pub category: Option<String>,
    /// Optional free-form description
    pub description: Option<String>,
    /// Date the transaction took place
    pub transaction_date: NaiveDate,
    /// Actor who created the transaction
    pub created_by: Uuid,
    /// Pairs the two legs of a transfer; None for plain transactions
    pub transfer_id: Option<Uuid>,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Whether this row is one leg of a transfer pair
    pub fn is_transfer_leg(&self) -> bool {
        self.transfer_id.is_some()
    }

    /// Build a persistable transaction from a validated draft
    pub fn from_draft(draft: &TransactionDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workspace_id: draft.workspace_id,
            account_id: draft.account_id,
            kind: draft.kind,
            amount: draft.amount,
            currency: draft.currency.clone(),
            category: draft.category.clone(),
            description: draft.description.clone(),
            transaction_date: draft.transaction_date,
            created_by: draft.created_by,
            transfer_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Validated payload for creating a single transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDraft {
    /// Owning workspace
    pub workspace_id: Uuid,
    /// Target account
    pub account_id: Uuid,
    /// Transaction kind
    pub kind: TransactionKind,
    /// Amount, strictly positive
    pub amount: Amount,
    /// ISO 4217 currency code
    pub currency: String,
    /// Optional category label
    pub category: Option<String>,
    /// Optional free-form description
    pub description: Option<String>,
    /// Date the transaction took place
    pub transaction_date: NaiveDate,
    /// Authenticated actor creating the transaction
    pub created_by: Uuid,
}

/// Partial update of an existing transaction; None fields keep their value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionPatch {
    /// Move the transaction to another account in the same workspace
    pub account_id: Option<Uuid>,
    /// Change the kind
    pub kind: Option<TransactionKind>,
    /// Change the amount
    pub amount: Option<Amount>,
    /// Change the currency
    pub currency: Option<String>,
    /// Replace the category
    pub category: Option<String>,
    /// Replace the description
    pub description: Option<String>,
    /// Change the transaction date
    pub transaction_date: Option<NaiveDate>,
}

impl TransactionPatch {
    /// Whether the patch touches fields that participate in the balance
    /// invariant (kind, amount, owning account)
    pub fn changes_structure(&self) -> bool {
        self.account_id.is_some() || self.kind.is_some() || self.amount.is_some()
    }

    /// Produce the post-image of a transaction with this patch applied
    pub fn apply_to(&self, existing: &Transaction) -> Transaction {
        let mut updated = existing.clone();
        if let Some(account_id) = self.account_id {
            updated.account_id = account_id;
        }
        if let Some(kind) = self.kind {
            updated.kind = kind;
        }
        if let Some(amount) = self.amount {
            updated.amount = amount;
        }
        if let Some(currency) = &self.currency {
            updated.currency = currency.clone();
        }
        if let Some(category) = &self.category {
            updated.category = Some(category.clone());
        }
        if let Some(description) = &self.description {
            updated.description = Some(description.clone());
        }
        if let Some(date) = self.transaction_date {
            updated.transaction_date = date;
        }
        updated.updated_at = Utc::now();
        updated
    }
}

/// Validated payload for creating a transfer between two accounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferDraft {
    /// Owning workspace
    pub workspace_id: Uuid,
    /// Account the money leaves
    pub source_account_id: Uuid,
    /// Account the money arrives on
    pub destination_account_id: Uuid,
    /// Amount moved, strictly positive
    pub amount: Amount,
    /// ISO 4217 currency code; both accounts must use it
    pub currency: String,
    /// Optional category label, applied to both legs
    pub category: Option<String>,
    /// Optional free-form description, applied to both legs
    pub description: Option<String>,
    /// Date the transfer took place
    pub transaction_date: NaiveDate,
    /// Authenticated actor creating the transfer
    pub created_by: Uuid,
}

impl TransferDraft {
    /// Build the persistable expense leg and income leg sharing one
    /// transfer id
    pub fn legs(&self) -> (Transaction, Transaction) {
        let now = Utc::now();
        let transfer_id = Uuid::new_v4();
        let base = |account_id: Uuid, kind: TransactionKind| Transaction {
            id: Uuid::new_v4(),
            workspace_id: self.workspace_id,
            account_id,
            kind,
            amount: self.amount,
            currency: self.currency.clone(),
            category: self.category.clone(),
            description: self.description.clone(),
            transaction_date: self.transaction_date,
            created_by: self.created_by,
            transfer_id: Some(transfer_id),
            created_at: now,
            updated_at: now,
        };
        (
            base(self.source_account_id, TransactionKind::Expense),
            base(self.destination_account_id, TransactionKind::Income),
        )
    }
}
