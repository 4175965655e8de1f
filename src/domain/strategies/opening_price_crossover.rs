//! Opening price crossover.
//!
//! Long-only momentum entries filtered by intraday sentiment:
//! - fast EMA above slow EMA and a bullish primary candle;
//! - close above the session open and the previous session's close (below
//!   both for put options, whose symbols end in `PE`);
//! - a crossover spike: more 1-minute bars inside the primary bar traded above
//!   its open than the recent average.
//!
//! Exits scale out at three risk multiples and a stop set from the recent lows
//! and ATR. Size comes from the slot's compounding capital.

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, info};

use crate::domain::bar::Bar;
use crate::domain::execution::TradeIntent;
use crate::domain::ledger::LedgerView;
use crate::domain::packet::DataPacket;
use crate::domain::position::Slot;
use crate::domain::resolution::Resolution;
use crate::domain::strategy::Strategy;

#[derive(Debug, Clone, PartialEq)]
pub struct OpeningPriceParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub atr_period: usize,
    pub atr_multiplier: f64,
    /// Reward-to-risk multiples for the three targets.
    pub targets: [f64; 3],
    /// Fractions of the entry quantity sold at the first and second target.
    pub exit_fractions: [f64; 2],
    /// Crossover counts averaged for the spike filter.
    pub spike_window: usize,
}

impl Default for OpeningPriceParams {
    fn default() -> Self {
        OpeningPriceParams {
            ema_fast: 9,
            ema_slow: 21,
            atr_period: 14,
            atr_multiplier: 1.5,
            targets: [1.0, 1.5, 3.0],
            exit_fractions: [0.5, 0.2],
            spike_window: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ActiveTrade {
    stop_loss: f64,
    targets: [f64; 3],
    initial_quantity: i64,
    t1_hit: bool,
    t2_hit: bool,
}

#[derive(Debug, Clone)]
pub struct OpeningPriceCrossover {
    timeframe: Resolution,
    auxiliary: Resolution,
    params: OpeningPriceParams,
    utc_offset: FixedOffset,
    active: BTreeMap<String, ActiveTrade>,
    crossovers: BTreeMap<String, VecDeque<usize>>,
    session_open: BTreeMap<String, (NaiveDate, f64)>,
    last_seen: BTreeMap<String, DateTime<Utc>>,
}

impl OpeningPriceCrossover {
    pub fn new(timeframe: Resolution, params: OpeningPriceParams) -> Self {
        let ema_fast = params.ema_fast.max(1);
        let params = OpeningPriceParams {
            ema_fast,
            ema_slow: params.ema_slow.max(ema_fast + 1),
            atr_period: params.atr_period.max(1),
            spike_window: params.spike_window.max(1),
            ..params
        };
        OpeningPriceCrossover {
            timeframe,
            auxiliary: Resolution::ONE_MINUTE,
            params,
            utc_offset: Utc.fix(),
            active: BTreeMap::new(),
            crossovers: BTreeMap::new(),
            session_open: BTreeMap::new(),
            last_seen: BTreeMap::new(),
        }
    }

    /// Exchange offset used to decide where a session starts.
    pub fn with_utc_offset(mut self, offset: FixedOffset) -> Self {
        self.utc_offset = offset;
        self
    }

    pub fn params(&self) -> &OpeningPriceParams {
        &self.params
    }

    /// Open of the first primary bar of the bar's local day.
    fn session_open_price(&mut self, symbol: &str, bar: &Bar) -> f64 {
        let day = bar.timestamp.with_timezone(&self.utc_offset).date_naive();
        match self.session_open.get(symbol) {
            Some((seen, open)) if *seen == day => *open,
            _ => {
                self.session_open.insert(symbol.to_string(), (day, bar.open));
                bar.open
            }
        }
    }

    /// Bars inside the primary bar whose high traded above its open.
    fn crossover_count(&self, packet: &DataPacket<'_>, symbol: &str, bars: &[Bar]) -> usize {
        let Some(last) = bars.last() else {
            return 0;
        };
        let window = if self.auxiliary < self.timeframe {
            packet.series(self.auxiliary, symbol)
        } else {
            std::slice::from_ref(last)
        };
        window.iter().filter(|b| b.high > last.open).count()
    }

    /// Record `count` and report whether it beats the rolling average.
    fn is_spike(&mut self, symbol: &str, count: usize) -> bool {
        let history = self.crossovers.entry(symbol.to_string()).or_default();
        history.push_back(count);
        while history.len() > self.params.spike_window {
            history.pop_front();
        }
        let average = history.iter().sum::<usize>() as f64 / history.len() as f64;
        count as f64 > average
    }

    fn manage_exit(
        &mut self,
        symbol: &str,
        held: i64,
        last: &Bar,
        timestamp: DateTime<Utc>,
    ) -> Vec<TradeIntent> {
        let Some(trade) = self.active.get_mut(symbol) else {
            return Vec::new();
        };
        let tf = self.timeframe;
        let [t1, t2, t3] = trade.targets;

        if last.high >= t3 {
            info!(symbol, quantity = held, price = t3, "third target hit");
            self.active.remove(symbol);
            return vec![TradeIntent::sell(symbol, tf, held, t3, timestamp)];
        }

        let mut intents = Vec::new();
        let mut remaining = held;
        let partials = [
            (t2, self.params.exit_fractions[1], &mut trade.t2_hit),
            (t1, self.params.exit_fractions[0], &mut trade.t1_hit),
        ];
        for (target, fraction, hit) in partials {
            if *hit || last.high < target {
                continue;
            }
            let quantity = (trade.initial_quantity as f64 * fraction).floor() as i64;
            if quantity > 0 && remaining >= quantity {
                info!(symbol, quantity, price = target, "partial target hit");
                intents.push(TradeIntent::sell(symbol, tf, quantity, target, timestamp));
                remaining -= quantity;
                *hit = true;
            }
        }

        if last.low <= trade.stop_loss {
            let stop = trade.stop_loss;
            self.active.remove(symbol);
            if remaining > 0 {
                info!(symbol, quantity = remaining, price = stop, "stop loss hit");
                intents.push(TradeIntent::sell(symbol, tf, remaining, stop, timestamp));
            }
        }
        intents
    }

    fn consider_entry(
        &mut self,
        ledger: &LedgerView<'_>,
        packet: &DataPacket<'_>,
        symbol: &str,
        bars: &[Bar],
        timestamp: DateTime<Utc>,
    ) -> Option<TradeIntent> {
        let n = bars.len();
        let last = &bars[n - 1];
        let previous = &bars[n.saturating_sub(2)];
        let session_open = self.session_open_price(symbol, last);
        let prior_session = packet.latest(Resolution::Daily, symbol)?;
        if n < self.params.ema_slow {
            return None;
        }

        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let ema_fast = ema(&closes, self.params.ema_fast)?;
        let ema_slow = ema(&closes, self.params.ema_slow)?;
        let atr = atr(bars, self.params.atr_period).unwrap_or(0.0);

        let count = self.crossover_count(packet, symbol, bars);
        let spike = self.is_spike(symbol, count);
        let ema_bullish = ema_fast > ema_slow;
        let candle_bullish = last.close >= last.open;
        let sentiment = if is_put(symbol) {
            last.close < session_open && last.close < prior_session.close
        } else {
            last.close > session_open && last.close > prior_session.close
        };
        let enter = ema_bullish && candle_bullish && sentiment && spike;
        debug!(
            symbol,
            timestamp = %timestamp,
            close = last.close,
            session_open,
            prior_close = prior_session.close,
            ema_fast,
            ema_slow,
            crossovers = count,
            ema_bullish,
            candle_bullish,
            sentiment,
            spike,
            enter,
            "entry check"
        );
        if !enter {
            return None;
        }

        let entry = last.close;
        let stop_loss = last.low.min(previous.low).min(entry - atr * self.params.atr_multiplier);
        let risk = entry - stop_loss;
        if risk <= 0.0 || entry <= 0.0 {
            return None;
        }
        let slot = Slot::new(symbol, self.timeframe);
        let quantity = (ledger.capital_for_slot(&slot) / entry).floor() as i64;
        if quantity <= 0 {
            return None;
        }
        let targets = self.params.targets.map(|rr| entry + risk * rr);
        info!(slot = %slot, quantity, entry, stop_loss, target = targets[0], "opening price entry");
        self.active.insert(
            symbol.to_string(),
            ActiveTrade {
                stop_loss,
                targets,
                initial_quantity: quantity,
                t1_hit: false,
                t2_hit: false,
            },
        );
        Some(TradeIntent::buy(symbol, self.timeframe, quantity, entry, timestamp))
    }
}

fn is_put(symbol: &str) -> bool {
    symbol.to_uppercase().ends_with("PE")
}

/// Exponential average seeded with the simple average of the first `period`
/// values.
fn ema(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = values[..period].iter().sum::<f64>() / period as f64;
    Some(values[period..].iter().fold(seed, |acc, v| acc + alpha * (v - acc)))
}

/// Wilder-smoothed average true range.
fn atr(bars: &[Bar], period: usize) -> Option<f64> {
    let ranges: Vec<f64> = bars
        .windows(2)
        .map(|w| {
            let prev_close = w[0].close;
            let bar = &w[1];
            (bar.high - bar.low)
                .max((bar.high - prev_close).abs())
                .max((bar.low - prev_close).abs())
        })
        .collect();
    if period == 0 || ranges.len() < period {
        return None;
    }
    let seed = ranges[..period].iter().sum::<f64>() / period as f64;
    let n = period as f64;
    Some(ranges[period..].iter().fold(seed, |acc, tr| (acc * (n - 1.0) + tr) / n))
}

impl Strategy for OpeningPriceCrossover {
    fn name(&self) -> &str {
        "OpeningPriceCrossover"
    }

    fn primary_resolution(&self) -> Resolution {
        self.timeframe
    }

    fn required_resolutions(&self) -> Vec<Resolution> {
        let mut all = vec![self.timeframe, self.auxiliary, Resolution::Daily];
        all.sort();
        all.dedup();
        all
    }

    fn auxiliary_resolution(&self) -> Option<Resolution> {
        Some(self.auxiliary)
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
            let timestamp = last.timestamp;

            let held = ledger.quantity(&Slot::new(&symbol, self.timeframe));
            if held > 0 {
                intents.extend(self.manage_exit(&symbol, held, last, timestamp));
                continue;
            }
            // Flat: any remembered trade was closed elsewhere (e.g. forced exit).
            self.active.remove(&symbol);
            if let Some(intent) = self.consider_entry(ledger, packet, &symbol, bars, timestamp) {
                intents.push(intent);
            }
        }
        intents
    }
}
