//! Historical replay driver.
//!
//! Runs `Loading → WarmingUp → Iterating → Finalizing → Done` over bars from a
//! [`HistoricalBarStore`], feeding every registered strategy the bars of its
//! timeframe in completion order. Single-threaded and deterministic.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, info, warn};

use super::bar::Bar;
use super::bar_history::BarHistoryStore;
use super::error::BarsimError;
use super::execution::{OrderSimulator, SubmitOutcome};
use super::ledger::{Ledger, PerformanceSummary, PriceMap};
use super::packet::PacketLayout;
use super::resolution::Resolution;
use super::session::{ForcedExitTracker, SessionConfig};
use super::strategy::StrategyRegistry;
use crate::ports::data_port::HistoricalBarStore;
use crate::ports::metadata_port::TradingCalendar;
use crate::ports::sink_port::{PersistenceSink, Record};

pub const DEFAULT_WARMUP_DEPTH: usize = 100;
pub const DEFAULT_LOAD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    pub run_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub initial_cash: f64,
    pub symbols: Vec<String>,
    /// Finer resolution delivered as the bars inside each primary bar.
    pub auxiliary: Option<Resolution>,
    /// Bars per symbol and resolution seeded from before `start`.
    pub warmup_depth: usize,
    /// Cap on the rolling history; `None` keeps every bar of the run.
    pub max_history: Option<usize>,
    pub load_attempts: u32,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Loading,
    WarmingUp,
    Iterating,
    Finalizing,
    Done,
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplayState::Loading => "loading",
            ReplayState::WarmingUp => "warming_up",
            ReplayState::Iterating => "iterating",
            ReplayState::Finalizing => "finalizing",
            ReplayState::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub ledger: Ledger,
    pub last_prices: PriceMap,
}

impl RunResult {
    pub fn summary(&self) -> PerformanceSummary {
        self.ledger.performance_summary(&self.last_prices)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayOutcome {
    Completed(RunResult),
    /// No primary bars inside the requested window.
    NoData { run_id: String, resolution: Resolution },
}

pub struct ReplayDriver<'a> {
    config: ReplayConfig,
    data: &'a dyn HistoricalBarStore,
    calendar: &'a dyn TradingCalendar,
    simulator: OrderSimulator,
    strategies: StrategyRegistry,
    sink: Option<Box<dyn PersistenceSink + 'a>>,
    state: ReplayState,
}

impl<'a> ReplayDriver<'a> {
    pub fn new(
        config: ReplayConfig,
        data: &'a dyn HistoricalBarStore,
        calendar: &'a dyn TradingCalendar,
        simulator: OrderSimulator,
        strategies: StrategyRegistry,
    ) -> Self {
        ReplayDriver {
            config,
            data,
            calendar,
            simulator,
            strategies,
            sink: None,
            state: ReplayState::Loading,
        }
    }

    /// Record trades and equity snapshots as they happen. Storage-backed
    /// sinks go behind a [`QueuedSink`](crate::adapters::queued_sink::QueuedSink)
    /// with backpressure so the loop never waits on disk per record.
    pub fn with_sink(mut self, sink: Box<dyn PersistenceSink + 'a>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> ReplayState {
        self.state
    }

    fn transition(&mut self, next: ReplayState) {
        debug!(run_id = %self.config.run_id, from = %self.state, to = %next, "replay state");
        self.state = next;
    }

    pub fn run(mut self) -> Result<ReplayOutcome, BarsimError> {
        if self.strategies.is_empty() {
            return Err(BarsimError::ConfigInvalid {
                section: "strategy".into(),
                key: "timeframes".into(),
                reason: "no strategy registered".into(),
            });
        }

        let timeframes: Vec<Resolution> = self.strategies.timeframes().collect();
        let layouts = self.strategies.layouts(self.config.auxiliary);

        // Loading
        let mut loaded: BTreeMap<Resolution, Vec<Bar>> = BTreeMap::new();
        for res in self.strategies.required_resolutions() {
            let bars = self.load_with_retry(res)?;
            info!(resolution = %res, bars = bars.len(), "loaded history");
            loaded.insert(res, bars);
        }

        // WarmingUp
        self.transition(ReplayState::WarmingUp);
        let start = self.config.start;
        let end = self.config.end;
        let mut history = match self.config.max_history {
            Some(cap) => BarHistoryStore::with_max_len(cap.max(1)),
            None => BarHistoryStore::new(),
        };
        let mut events: BTreeSet<(DateTime<Utc>, Resolution, DateTime<Utc>)> = BTreeSet::new();
        let mut pending: BTreeMap<(Resolution, DateTime<Utc>), Vec<Bar>> = BTreeMap::new();

        for (res, bars) in &loaded {
            let primary = timeframes.contains(res);
            // Primary bars are seeded when they open before start; other
            // resolutions only once they have closed.
            let (seed, live): (Vec<&Bar>, Vec<&Bar>) = bars
                .iter()
                .filter(|b| b.timestamp <= end)
                .partition(|b| if primary { b.timestamp < start } else { b.end() <= start });
            for symbol in &self.config.symbols {
                let tail: Vec<Bar> = seed
                    .iter()
                    .filter(|b| &b.symbol == symbol)
                    .map(|b| (*b).clone())
                    .collect();
                let skip = tail.len().saturating_sub(self.config.warmup_depth);
                history.warm_up(symbol, *res, tail.into_iter().skip(skip));
            }
            for bar in live {
                events.insert((bar.end(), *res, bar.timestamp));
                pending.entry((*res, bar.timestamp)).or_default().push(bar.clone());
            }
        }

        if !events.iter().any(|(_, res, _)| timeframes.contains(res)) {
            let resolution = timeframes.first().copied().unwrap_or(Resolution::ONE_MINUTE);
            warn!(
                run_id = %self.config.run_id,
                resolution = %resolution,
                "no primary data in the requested window"
            );
            self.transition(ReplayState::Done);
            return Ok(ReplayOutcome::NoData {
                run_id: self.config.run_id.clone(),
                resolution,
            });
        }

        // Iterating
        self.transition(ReplayState::Iterating);
        let finest_timeframe = timeframes[0];
        let default_trade_value = self.simulator.default_trade_value();
        let mut ledger = Ledger::new(self.config.run_id.clone(), self.config.initial_cash);
        let mut last_prices = PriceMap::new();
        let mut exits = ForcedExitTracker::new();
        let mut last_ts = start;

        for (_, res, ts) in events {
            let Some(bars) = pending.remove(&(res, ts)) else {
                continue;
            };
            let primary = timeframes.contains(&res);
            for bar in bars {
                if primary {
                    last_prices.insert(bar.symbol.clone(), bar.close);
                }
                history.append(bar);
            }
            if !primary {
                continue;
            }
            last_ts = ts;

            let in_window = self.config.session.in_entry_window(ts);
            let intents = match (self.strategies.get_mut(res), layouts.get(&res)) {
                (Some(strategy), Some(layout)) if in_window => {
                    let packet = layout.build(&self.config.symbols, &history, ts);
                    strategy.on_data(&ledger.view(default_trade_value), ts, &packet, false)
                }
                _ => Vec::new(),
            };
            for intent in intents {
                if let SubmitOutcome::Applied(trade) = self.simulator.submit(&mut ledger, &intent)? {
                    self.persist(Record::Trade(trade));
                }
            }

            if res != finest_timeframe {
                continue;
            }

            fill_missing_prices(&mut last_prices, &ledger, &layouts, &history, ts);
            if self.config.session.is_past_cutoff(self.calendar, ts) {
                let trades = exits.close_open_positions(
                    &self.config.session,
                    &mut ledger,
                    &self.simulator,
                    &last_prices,
                    ts,
                )?;
                for trade in trades {
                    self.persist(Record::Trade(trade));
                }
            }
            let point = ledger.record_equity_snapshot(ts, &last_prices).clone();
            self.persist(Record::Equity {
                run_id: self.config.run_id.clone(),
                point,
            });
        }

        // Finalizing
        self.transition(ReplayState::Finalizing);
        fill_missing_prices(&mut last_prices, &ledger, &layouts, &history, last_ts);
        let point = ledger.record_equity_snapshot(last_ts, &last_prices).clone();
        self.persist(Record::Equity {
            run_id: self.config.run_id.clone(),
            point,
        });
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.flush() {
                warn!(error = %e, "failed to flush sink");
            }
        }

        let summary = ledger.performance_summary(&last_prices);
        info!(
            run_id = %self.config.run_id,
            trades = summary.trade_count,
            total = summary.total,
            pnl = summary.total_pnl,
            "replay finished"
        );

        self.transition(ReplayState::Done);
        Ok(ReplayOutcome::Completed(RunResult {
            run_id: self.config.run_id.clone(),
            ledger,
            last_prices,
        }))
    }

    fn load_with_retry(&self, res: Resolution) -> Result<Vec<Bar>, BarsimError> {
        let from = self.config.start - res.load_lookback();
        let attempts = self.config.load_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.data.load_bars(&self.config.symbols, res, from, self.config.end) {
                Ok(bars) => return Ok(bars),
                Err(e) if attempt < attempts => {
                    warn!(resolution = %res, attempt, error = %e, "history load failed, retrying");
                    attempt += 1;
                }
                Err(e) => {
                    warn!(resolution = %res, attempt, error = %e, "history load failed, giving up");
                    return Err(e);
                }
            }
        }
    }

    fn persist(&mut self, record: Record) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.append(&record) {
                warn!(kind = record.kind(), error = %e, "dropping record");
            }
        }
    }
}

/// Price held symbols with no primary bar yet from the latest closed bar of
/// any other resolution.
fn fill_missing_prices(
    prices: &mut PriceMap,
    ledger: &Ledger,
    layouts: &BTreeMap<Resolution, PacketLayout>,
    history: &BarHistoryStore,
    at: DateTime<Utc>,
) {
    for slot in ledger.positions().keys() {
        if prices.contains_key(&slot.symbol) {
            continue;
        }
        let found = layouts
            .values()
            .flat_map(|l| l.resolutions())
            .filter_map(|res| history.latest_at(&slot.symbol, res, at))
            .max_by_key(|b| b.timestamp);
        if let Some(bar) = found {
            prices.insert(slot.symbol.clone(), bar.close);
        }
    }
}
