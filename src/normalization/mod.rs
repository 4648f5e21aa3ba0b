//! Marketplace text normalization: prices, condition labels and variant hints.

pub mod condition;
pub mod price;
pub mod variant;

pub use condition::ConditionMapper;
pub use price::{format_price, normalize_price, Currency, NormalizedPrice};
pub use variant::VariantHints;
