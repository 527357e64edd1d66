//! Decimal type utilities for precise monetary calculations

use rust_decimal::Decimal;
pub use rust_decimal_macros::dec;

/// Monetary amount with fixed-point precision
pub type Amount = Decimal;

/// Precision helpers for common operations
pub mod precision {
    use super::*;

    /// Money precision (2 fractional digits, cent granularity)
    pub const MONEY_PRECISION: u32 = 2;

    /// Round an amount to money precision
    pub fn round_money(amount: Amount) -> Amount {
        amount.round_dp(MONEY_PRECISION)
    }

    /// Whether an amount is already expressed at money precision
    pub fn is_money(amount: Amount) -> bool {
        amount == round_money(amount)
    }
}
