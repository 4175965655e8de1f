//! Bundled strategies.

pub mod opening_price_crossover;
pub mod sma_crossover;

pub use opening_price_crossover::{OpeningPriceCrossover, OpeningPriceParams};
pub use sma_crossover::SmaCrossover;
