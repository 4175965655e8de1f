//! Symbol metadata and exchange calendar port traits.

use chrono::{NaiveDate, NaiveTime};

use crate::domain::error::BarsimError;

pub trait SymbolMetadata: Send + Sync {
    /// Minimum tradable multiple for `symbol`; 1 when the symbol is unknown.
    fn lot_size(&self, symbol: &str) -> Result<i64, BarsimError>;
}

pub trait TradingCalendar: Send + Sync {
    fn is_trading_day(&self, date: NaiveDate) -> bool;
    fn market_open(&self, date: NaiveDate) -> NaiveTime;
    fn market_close(&self, date: NaiveDate) -> NaiveTime;
}
