//! Trading session rules: entry window, trading mode and intraday forced exits.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Offset, Utc};
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{info, warn};

use super::error::BarsimError;
use super::execution::{OrderSimulator, SubmitOutcome, TradeIntent};
use super::ledger::{Ledger, PriceMap};
use super::position::{Slot, Trade};
use crate::ports::metadata_port::TradingCalendar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TradingMode {
    /// Every position is closed before the session ends.
    #[default]
    Intraday,
    /// Positions may be carried overnight.
    Positional,
}

impl FromStr for TradingMode {
    type Err = BarsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "intraday" => Ok(TradingMode::Intraday),
            "positional" => Ok(TradingMode::Positional),
            other => Err(BarsimError::ConfigInvalid {
                section: "backtest".into(),
                key: "mode".into(),
                reason: format!("expected intraday or positional, got '{other}'"),
            }),
        }
    }
}

/// Exchange-local session parameters. Bar timestamps are UTC; all time-of-day
/// comparisons happen in the exchange's offset.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub mode: TradingMode,
    pub entry_start: NaiveTime,
    pub entry_end: NaiveTime,
    pub utc_offset: FixedOffset,
    /// Forced exits start this long before the market close.
    pub exit_buffer: Duration,
}

/// Exchange offset used when none is configured (UTC+05:30).
pub const DEFAULT_UTC_OFFSET_MINUTES: i32 = 330;

pub(crate) fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            mode: TradingMode::Intraday,
            entry_start: hm(9, 15),
            entry_end: hm(15, 30),
            utc_offset: FixedOffset::east_opt(DEFAULT_UTC_OFFSET_MINUTES * 60).unwrap_or(Utc.fix()),
            exit_buffer: Duration::minutes(16),
        }
    }
}

impl SessionConfig {
    pub fn local(&self, ts: DateTime<Utc>) -> NaiveDateTime {
        ts.with_timezone(&self.utc_offset).naive_local()
    }

    /// `entry_start <= local time <= entry_end`.
    pub fn in_entry_window(&self, ts: DateTime<Utc>) -> bool {
        let t = self.local(ts).time();
        self.entry_start <= t && t <= self.entry_end
    }

    pub fn exit_cutoff(&self, calendar: &dyn TradingCalendar, date: NaiveDate) -> NaiveTime {
        calendar.market_close(date) - self.exit_buffer
    }

    /// Intraday mode only: at or after the day's forced-exit cutoff.
    pub fn is_past_cutoff(&self, calendar: &dyn TradingCalendar, ts: DateTime<Utc>) -> bool {
        if self.mode != TradingMode::Intraday {
            return false;
        }
        let local = self.local(ts);
        local.time() >= self.exit_cutoff(calendar, local.date())
    }
}

/// Slots already force-closed today. Resets when the local date changes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForcedExitTracker {
    day: Option<NaiveDate>,
    closed: BTreeSet<Slot>,
}

impl ForcedExitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, day: NaiveDate) {
        if self.day != Some(day) {
            self.day = Some(day);
            self.closed.clear();
        }
    }

    pub fn is_closed(&self, slot: &Slot) -> bool {
        self.closed.contains(slot)
    }

    pub fn mark_closed(&mut self, slot: Slot) {
        self.closed.insert(slot);
    }

    pub fn closed_count(&self) -> usize {
        self.closed.len()
    }

    /// Sell every open slot not yet force-closed today, at the last known
    /// price (average entry when none is known). A slot counts as closed only
    /// once its exit is applied.
    pub fn close_open_positions(
        &mut self,
        session: &SessionConfig,
        ledger: &mut Ledger,
        simulator: &OrderSimulator,
        prices: &PriceMap,
        ts: DateTime<Utc>,
    ) -> Result<Vec<Trade>, BarsimError> {
        self.observe(session.local(ts).date());
        let due: Vec<(Slot, i64, f64)> = ledger
            .positions()
            .iter()
            .filter(|(slot, _)| !self.closed.contains(*slot))
            .map(|(slot, pos)| {
                let price = prices.get(&slot.symbol).copied().unwrap_or(pos.avg_price);
                (slot.clone(), pos.quantity, price)
            })
            .collect();

        let mut trades = Vec::new();
        for (slot, quantity, price) in due {
            info!(slot = %slot, quantity, price, timestamp = %ts, "intraday exit");
            let intent = TradeIntent::sell(slot.symbol.clone(), slot.timeframe, quantity, price, ts);
            match simulator.submit(ledger, &intent)? {
                SubmitOutcome::Applied(trade) => {
                    trades.push(trade);
                    self.mark_closed(slot);
                }
                // Left unmarked so the next bar retries.
                SubmitOutcome::Rejected(reason) => {
                    warn!(slot = %slot, quantity, reason = %reason, timestamp = %ts, "intraday exit rejected");
                }
            }
        }
        Ok(trades)
    }
}
