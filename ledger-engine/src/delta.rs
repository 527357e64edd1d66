//! Balance delta calculation
//!
//! The single place that maps a transaction to its signed effect on the
//! owning account's balance. Every mutation and every reconciliation pass
//! goes through this function; nothing else is allowed to decide signs.

use common::decimal::Amount;
use common::error::{Error, Result};
use common::model::transaction::TransactionKind;

/// Signed effect of a transaction on its account's balance.
///
/// `Income` adds the amount, `Expense` subtracts it. A `Transfer`-kinded
/// row has no well-defined single-account effect: transfers exist only as
/// a paired expense leg and income leg, so asking for the delta of a bare
/// transfer row is an input error, never a silent zero.
pub fn balance_delta(kind: TransactionKind, amount: Amount) -> Result<Amount> {
    match kind {
        TransactionKind::Income => Ok(amount),
        TransactionKind::Expense => Ok(-amount),
        TransactionKind::Transfer => Err(Error::Validation(
            "a transfer has no single-account balance effect; it must be stored as two linked legs"
                .to_string(),
        )),
    }
}
