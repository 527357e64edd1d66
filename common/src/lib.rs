//! Common types and utilities for the Homeledger balance engine
//!
//! This library contains the shared error taxonomy, money types, and domain
//! models used by the ledger engine crate. It provides a unified approach
//! to error handling and keeps all monetary values on `rust_decimal`.

pub mod decimal;
pub mod error;
pub mod model;

/// Re-export important types
pub use decimal::*;
pub use error::{Error, ErrorExt, Result};
