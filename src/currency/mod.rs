//! Price normalization: currency aliases, observed rates and overrides.

pub mod price;
pub mod rates;
pub mod table;

pub use price::PriceExpr;
pub use table::{CurrencySnapshot, CurrencyTable, BASE_CURRENCY};
