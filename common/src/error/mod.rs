//! Error types for the ledger engine
//!
//! This module provides a unified error handling system for the balance
//! consistency engine. The taxonomy separates caller mistakes (validation,
//! lookups, workspace scoping) from storage trouble, and storage trouble in
//! turn into "nothing was committed, retry the whole operation" and "the
//! balance invariant may be broken, do not blindly retry".

use std::fmt::Display;
use thiserror::Error;

/// Ledger engine error type
#[derive(Debug, Error)]
pub enum Error {
    /// Rejected input: bad amount, bad kind, inactive account, currency mismatch
    #[error("Validation error: {0}")]
    Validation(String),

    /// Error when an account cannot be found
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    /// Error when a transaction cannot be found
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    /// Error when an account is referenced from a foreign workspace
    #[error("Cross-workspace reference: {0}")]
    CrossWorkspace(String),

    /// The balance invariant may be broken: a compensating rollback failed.
    /// Never retried blindly; the account needs reconciliation.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Transient storage failure with nothing committed; safe to retry
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Decimal conversion error
    #[error("Decimal conversion error: {0}")]
    DecimalError(String),
}

impl Error {
    /// Whether the whole operation is safe to retry as-is.
    ///
    /// True only for transient storage classes. `Consistency` is explicitly
    /// not retryable: the stored balance may already disagree with the
    /// transaction set and must be reconciled first. Caller-fault classes
    /// (validation, lookups, workspace scoping) retry to the same rejection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Database(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Extension trait to add context to error results
pub trait ErrorExt<T> {
    /// Add context information to an error
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T> ErrorExt<T> for Result<T> {
    fn with_context<C, F>(self, context_fn: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        self.map_err(|e| {
            let context = context_fn().to_string();
            match e {
                Error::Validation(msg) => Error::Validation(format!("{}: {}", context, msg)),
                Error::AccountNotFound(msg) => Error::AccountNotFound(format!("{}: {}", context, msg)),
                Error::TransactionNotFound(msg) => Error::TransactionNotFound(format!("{}: {}", context, msg)),
                Error::CrossWorkspace(msg) => Error::CrossWorkspace(format!("{}: {}", context, msg)),
                Error::Consistency(msg) => Error::Consistency(format!("{}: {}", context, msg)),
                Error::Persistence(msg) => Error::Persistence(format!("{}: {}", context, msg)),
                Error::Database(e) => Error::Database(e),
                Error::Serialization(e) => Error::Serialization(e),
                Error::DecimalError(msg) => Error::DecimalError(format!("{}: {}", context, msg)),
            }
        })
    }
}

/// From rust_decimal::Error
impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::DecimalError(err.to_string())
    }
}
