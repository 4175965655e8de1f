//! Weekday calendar with a fixed session and an explicit holiday list.

use crate::domain::session::hm;
use crate::ports::metadata_port::TradingCalendar;
use chrono::{Datelike, NaiveDate, NaiveTime, Weekday};
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
pub struct StaticCalendar {
    open: NaiveTime,
    close: NaiveTime,
    holidays: BTreeSet<NaiveDate>,
}

impl Default for StaticCalendar {
    fn default() -> Self {
        Self::new(hm(9, 15), hm(15, 30))
    }
}

impl StaticCalendar {
    pub fn new(open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            open,
            close,
            holidays: BTreeSet::new(),
        }
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }
}

impl TradingCalendar for StaticCalendar {
    fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    fn market_open(&self, _date: NaiveDate) -> NaiveTime {
        self.open
    }

    fn market_close(&self, _date: NaiveDate) -> NaiveTime {
        self.close
    }
}
