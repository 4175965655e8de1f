//! Simple moving average crossover.
//!
//! Buys when the short SMA of closes crosses above the long SMA and the slot is
//! flat; sells the whole holding on the reverse cross. Orders are sized from
//! the slot's compounding capital.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

use crate::domain::bar::Bar;
use crate::domain::execution::TradeIntent;
use crate::domain::ledger::LedgerView;
use crate::domain::packet::DataPacket;
use crate::domain::position::Slot;
use crate::domain::resolution::Resolution;
use crate::domain::strategy::Strategy;

pub const DEFAULT_SHORT_WINDOW: usize = 5;
pub const DEFAULT_LONG_WINDOW: usize = 20;

#[derive(Debug, Clone)]
pub struct SmaCrossover {
    timeframe: Resolution,
    short_window: usize,
    long_window: usize,
    extra: Vec<Resolution>,
    last_seen: BTreeMap<String, DateTime<Utc>>,
}

impl SmaCrossover {
    pub fn new(timeframe: Resolution, short_window: usize, long_window: usize) -> Self {
        SmaCrossover {
            timeframe,
            short_window: short_window.max(1),
            long_window: long_window.max(short_window.max(1) + 1),
            extra: Vec::new(),
            last_seen: BTreeMap::new(),
        }
    }

    /// Also request `resolutions` in every packet.
    pub fn with_resolutions(mut self, resolutions: &[Resolution]) -> Self {
        self.extra = resolutions.to_vec();
        self
    }

    pub fn windows(&self) -> (usize, usize) {
        (self.short_window, self.long_window)
    }

    fn evaluate(
        &self,
        ledger: &LedgerView<'_>,
        symbol: &str,
        bars: &[Bar],
        timestamp: DateTime<Utc>,
    ) -> Option<TradeIntent> {
        let n = bars.len();
        if n <= self.long_window {
            return None;
        }
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let short_now = sma(&closes[..n], self.short_window)?;
        let long_now = sma(&closes[..n], self.long_window)?;
        let short_prev = sma(&closes[..n - 1], self.short_window)?;
        let long_prev = sma(&closes[..n - 1], self.long_window)?;
        let close = closes[n - 1];

        let slot = Slot::new(symbol, self.timeframe);
        let held = ledger.quantity(&slot);

        if short_now > long_now && short_prev <= long_prev && held == 0 {
            let quantity = (ledger.capital_for_slot(&slot) / close).floor() as i64;
            if quantity <= 0 {
                return None;
            }
            info!(slot = %slot, short_now, long_now, close, "bullish crossover");
            return Some(TradeIntent::buy(symbol, self.timeframe, quantity, close, timestamp));
        }
        if short_now < long_now && short_prev >= long_prev && held > 0 {
            info!(slot = %slot, short_now, long_now, close, "bearish crossover");
            return Some(TradeIntent::sell(symbol, self.timeframe, held, close, timestamp));
        }
        None
    }
}

fn sma(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    Some(tail.iter().sum::<f64>() / window as f64)
}

impl Strategy for SmaCrossover {
    fn name(&self) -> &str {
        "SmaCrossover"
    }

    fn primary_resolution(&self) -> Resolution {
        self.timeframe
    }

    fn required_resolutions(&self) -> Vec<Resolution> {
        let mut all = vec![self.timeframe];
        all.extend(self.extra.iter().copied());
        all
    }

    fn on_data(
        &mut self,
        ledger: &LedgerView<'_>,
        _timestamp: DateTime<Utc>,
        packet: &DataPacket<'_>,
        _is_live: bool,
    ) -> Vec<TradeIntent> {
        let mut intents = Vec::new();
        let symbols: Vec<String> = packet.symbols(self.timeframe).map(str::to_string).collect();
        for symbol in symbols {
            let bars = packet.series(self.timeframe, &symbol);
            let Some(last) = bars.last() else {
                continue;
            };
            if self.last_seen.get(&symbol) == Some(&last.timestamp) {
                continue;
            }
            self.last_seen.insert(symbol.clone(), last.timestamp);
            if let Some(intent) = self.evaluate(ledger, &symbol, bars, last.timestamp) {
                intents.push(intent);
            }
        }
        intents
    }
}
