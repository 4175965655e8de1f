//! OHLCV bar representation.

use chrono::{DateTime, Utc};

use super::resolution::Resolution;

/// One completed OHLCV summary for a symbol over one bucket.
///
/// `timestamp` is the bucket-start instant, matching how historical rows are
/// labelled by the bar store.
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub resolution: Resolution,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl Bar {
    /// Instant at which the bucket closes.
    pub fn end(&self) -> DateTime<Utc> {
        self.timestamp + self.resolution.period()
    }

    /// `high >= max(open, close) >= min(open, close) >= low` and `volume >= 0`.
    pub fn is_consistent(&self) -> bool {
        let body_high = self.open.max(self.close);
        let body_low = self.open.min(self.close);
        self.high >= body_high && body_low >= self.low && self.volume >= 0
    }

    /// Aggregate consecutive finer bars into one bar of `resolution`.
    ///
    /// Returns `None` for an empty slice.
    pub fn merge(bars: &[Bar], resolution: Resolution) -> Option<Bar> {
        let first = bars.first()?;
        let last = bars.last()?;
        Some(Bar {
            timestamp: first.timestamp,
            symbol: first.symbol.clone(),
            resolution,
            open: first.open,
            high: bars.iter().map(|b| b.high).fold(f64::MIN, f64::max),
            low: bars.iter().map(|b| b.low).fold(f64::MAX, f64::min),
            close: last.close,
            volume: bars.iter().map(|b| b.volume).sum(),
        })
    }
}
