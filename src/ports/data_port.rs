//! Historical bar access port trait.

use chrono::{DateTime, Utc};

use crate::domain::bar::Bar;
use crate::domain::error::BarsimError;
use crate::domain::resolution::Resolution;

pub trait HistoricalBarStore {
    /// Bars for `symbols` at `resolution` with `from <= timestamp <= to`,
    /// ascending by timestamp within each symbol.
    fn load_bars(
        &self,
        symbols: &[String],
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BarsimError>;

    fn list_symbols(&self, resolution: Resolution) -> Result<Vec<String>, BarsimError>;
}
