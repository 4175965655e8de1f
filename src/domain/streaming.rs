//! Live streaming driver.
//!
//! One task owns the aggregator, history, ledger and every strategy. Feed
//! observations arrive over a channel; dashboards read [`LiveSnapshot`]s
//! published through a watch channel.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::aggregator::{Observation, ResolutionAggregator};
use super::bar::Bar;
use super::bar_history::BarHistoryStore;
use super::error::BarsimError;
use super::execution::{OrderSimulator, SubmitOutcome, TradeIntent};
use super::ledger::{EquityPoint, Ledger, PriceMap};
use super::packet::PacketLayout;
use super::position::Slot;
use super::resolution::Resolution;
use super::run::{RunControl, RunStatus};
use super::session::{ForcedExitTracker, SessionConfig};
use super::strategy::StrategyRegistry;
use crate::ports::data_port::HistoricalBarStore;
use crate::ports::feed_port::LiveFeed;
use crate::ports::metadata_port::TradingCalendar;
use crate::ports::sink_port::{PersistenceSink, Record};

pub const DEFAULT_MAX_HISTORY: usize = 500;
pub const DEFAULT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SNAPSHOT_TAIL: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingConfig {
    pub run_id: String,
    pub symbols: Vec<String>,
    pub initial_cash: f64,
    pub auxiliary: Option<Resolution>,
    pub max_history: usize,
    pub disconnect_timeout: Duration,
    /// Sell remaining positions through the simulator on shutdown instead of
    /// only reporting them.
    pub close_on_shutdown: bool,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Connecting,
    Subscribed,
    Streaming,
    ShuttingDown,
    Disconnected,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Connecting => "connecting",
            StreamState::Subscribed => "subscribed",
            StreamState::Streaming => "streaming",
            StreamState::ShuttingDown => "shutting_down",
            StreamState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    StopRequested,
    /// The feed closed its channel. Not retried.
    UpstreamDisconnected,
}

/// Mark-to-market view of one open slot.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionMark {
    pub slot: Slot,
    pub quantity: i64,
    pub avg_price: f64,
    pub last_price: f64,
    pub mtm: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot {
    pub run_id: String,
    pub state: StreamState,
    pub timestamp: Option<DateTime<Utc>>,
    pub cash: f64,
    pub equity_tail: Vec<EquityPoint>,
    pub positions: Vec<PositionMark>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamReport {
    pub run_id: String,
    pub end_reason: EndReason,
    pub ledger: Ledger,
    pub last_prices: PriceMap,
    /// Positions still open at shutdown, marked at the last known price.
    pub pending_exits: Vec<PositionMark>,
}

pub struct StreamingDriver {
    config: StreamingConfig,
    feed: Box<dyn LiveFeed>,
    calendar: Arc<dyn TradingCalendar>,
    simulator: OrderSimulator,
    strategies: StrategyRegistry,
    layouts: BTreeMap<Resolution, PacketLayout>,
    aggregator: ResolutionAggregator,
    history: BarHistoryStore,
    ledger: Ledger,
    last_prices: PriceMap,
    exits: ForcedExitTracker,
    sink: Option<Box<dyn PersistenceSink>>,
    snapshots: watch::Sender<LiveSnapshot>,
    state: StreamState,
    shut_down: bool,
}

impl StreamingDriver {
    pub fn new(
        config: StreamingConfig,
        feed: Box<dyn LiveFeed>,
        calendar: Arc<dyn TradingCalendar>,
        simulator: OrderSimulator,
        strategies: StrategyRegistry,
    ) -> Self {
        let derived: Vec<Resolution> = strategies.required_resolutions();
        let aggregator = ResolutionAggregator::new(Resolution::ONE_MINUTE, &derived);
        let layouts = strategies.layouts(config.auxiliary);
        let ledger = Ledger::new(config.run_id.clone(), config.initial_cash);
        let (snapshots, _) = watch::channel(LiveSnapshot {
            run_id: config.run_id.clone(),
            state: StreamState::Connecting,
            timestamp: None,
            cash: config.initial_cash,
            equity_tail: Vec::new(),
            positions: Vec::new(),
        });
        StreamingDriver {
            history: BarHistoryStore::with_max_len(config.max_history.max(1)),
            config,
            feed,
            calendar,
            simulator,
            strategies,
            layouts,
            aggregator,
            ledger,
            last_prices: PriceMap::new(),
            exits: ForcedExitTracker::new(),
            sink: None,
            snapshots,
            state: StreamState::Connecting,
            shut_down: false,
        }
    }

    /// Fire-and-forget persistence. `append` must not block; wrap slow sinks
    /// in a [`QueuedSink`](crate::adapters::queued_sink::QueuedSink).
    pub fn with_sink(mut self, sink: Box<dyn PersistenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn subscribe_snapshots(&self) -> watch::Receiver<LiveSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Seed history with bars loaded before the session (e.g. daily bars).
    pub fn warm_up(&mut self, bars: Vec<Bar>) {
        let count = bars.len();
        for bar in bars {
            self.history.append(bar);
        }
        debug!(bars = count, "warmed up live history");
    }

    /// Seed every required resolution with up to `depth` bars per symbol that
    /// had closed by `until`. Returns the number of bars added.
    pub fn warm_up_from(
        &mut self,
        store: &dyn HistoricalBarStore,
        until: DateTime<Utc>,
        depth: usize,
    ) -> Result<usize, BarsimError> {
        let mut added = 0;
        for res in self.strategies.required_resolutions() {
            let bars = store.load_bars(&self.config.symbols, res, until - res.load_lookback(), until)?;
            let mut seeded = 0;
            for symbol in &self.config.symbols {
                let closed: Vec<Bar> = bars
                    .iter()
                    .filter(|b| &b.symbol == symbol && b.end() <= until)
                    .cloned()
                    .collect();
                let skip = closed.len().saturating_sub(depth);
                seeded += self.history.warm_up(symbol, res, closed.into_iter().skip(skip));
            }
            info!(resolution = %res, loaded = bars.len(), seeded, "warmed up live history");
            added += seeded;
        }
        Ok(added)
    }

    fn transition(&mut self, next: StreamState) {
        info!(run_id = %self.config.run_id, from = %self.state, to = %next, "stream state");
        self.state = next;
        self.publish(None);
    }

    /// Drive the session until a stop is requested or the feed goes away.
    pub async fn run(mut self, mut control: RunControl) -> Result<StreamReport, BarsimError> {
        control.set_status(RunStatus::Starting);
        let mut rx = match self.feed.subscribe(&self.config.symbols).await {
            Ok(rx) => rx,
            Err(e) => {
                error!(error = %e, "subscribe failed");
                control.set_status(RunStatus::Stopped);
                return Err(e);
            }
        };
        self.transition(StreamState::Subscribed);
        self.transition(StreamState::Streaming);
        control.set_status(RunStatus::Running);

        let end_reason = loop {
            let next = tokio::select! {
                biased;
                _ = control.stopped() => None,
                msg = rx.recv() => Some(msg),
            };
            match next {
                None => break EndReason::StopRequested,
                Some(None) => {
                    warn!(run_id = %self.config.run_id, "feed channel closed");
                    break EndReason::UpstreamDisconnected;
                }
                Some(Some(obs)) => {
                    if let Err(e) = self.on_observation(obs) {
                        error!(error = %e, "stream aborted");
                        control.set_status(RunStatus::Stopping);
                        self.shutdown().await;
                        control.set_status(RunStatus::Stopped);
                        return Err(e);
                    }
                }
            }
        };

        control.set_status(RunStatus::Stopping);
        let pending_exits = self.shutdown().await;
        control.set_status(RunStatus::Stopped);

        Ok(StreamReport {
            run_id: self.config.run_id.clone(),
            end_reason,
            ledger: self.ledger,
            last_prices: self.last_prices,
            pending_exits,
        })
    }

    /// Handle one observation: persist it, aggregate it and process every bar
    /// it completes.
    pub fn on_observation(&mut self, obs: Observation) -> Result<(), BarsimError> {
        self.persist(Record::Tick(obs.clone()));
        let bars = match self.aggregator.on_observation(&obs) {
            Ok(bars) => bars,
            Err(BarsimError::MalformedObservation { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        for bar in bars {
            self.on_bar(bar)?;
        }
        Ok(())
    }

    fn on_bar(&mut self, bar: Bar) -> Result<(), BarsimError> {
        let ts = bar.timestamp;
        let resolution = bar.resolution;
        let finest = resolution == self.aggregator.finest();
        if finest {
            self.last_prices.insert(bar.symbol.clone(), bar.close);
        }
        self.persist(Record::Bar(bar.clone()));
        self.history.append(bar);

        let in_window = self.config.session.in_entry_window(ts);
        let default_trade_value = self.simulator.default_trade_value();
        let intents: Vec<TradeIntent> =
            match (self.strategies.get_mut(resolution), self.layouts.get(&resolution)) {
                (Some(strategy), Some(layout)) if in_window => {
                    let packet = layout.build(&self.config.symbols, &self.history, ts);
                    strategy.on_data(&self.ledger.view(default_trade_value), ts, &packet, true)
                }
                _ => Vec::new(),
            };
        for intent in intents {
            if let SubmitOutcome::Applied(trade) = self.simulator.submit(&mut self.ledger, &intent)? {
                self.persist(Record::Trade(trade));
            }
        }

        if finest {
            if self.config.session.is_past_cutoff(self.calendar.as_ref(), ts) {
                let trades = self.exits.close_open_positions(
                    &self.config.session,
                    &mut self.ledger,
                    &self.simulator,
                    &self.last_prices,
                    ts,
                )?;
                for trade in trades {
                    self.persist(Record::Trade(trade));
                }
            }
            let point = self.ledger.record_equity_snapshot(ts, &self.last_prices).clone();
            self.persist(Record::Equity {
                run_id: self.config.run_id.clone(),
                point,
            });
            self.publish(Some(ts));
        }
        Ok(())
    }

    /// Flush open bars, settle or report open positions, then disconnect under
    /// a timeout. Safe to call more than once.
    pub async fn shutdown(&mut self) -> Vec<PositionMark> {
        if self.shut_down {
            return self.marks();
        }
        self.shut_down = true;
        self.transition(StreamState::ShuttingDown);

        for bar in self.aggregator.flush() {
            if let Err(e) = self.on_bar(bar) {
                warn!(error = %e, "failed to process flushed bar");
            }
        }

        let pending = self.marks();
        if self.config.close_on_shutdown {
            let now = self
                .ledger
                .equity_curve()
                .last()
                .map_or_else(Utc::now, |p| p.timestamp);
            for mark in &pending {
                let intent = TradeIntent::sell(
                    mark.slot.symbol.clone(),
                    mark.slot.timeframe,
                    mark.quantity,
                    mark.last_price,
                    now,
                );
                match self.simulator.submit(&mut self.ledger, &intent) {
                    Ok(SubmitOutcome::Applied(trade)) => self.persist(Record::Trade(trade)),
                    Ok(SubmitOutcome::Rejected(reason)) => {
                        warn!(slot = %mark.slot, reason = %reason, "shutdown exit rejected");
                    }
                    Err(e) => warn!(slot = %mark.slot, error = %e, "shutdown exit failed"),
                }
            }
        } else {
            for mark in &pending {
                info!(slot = %mark.slot, quantity = mark.quantity, price = mark.last_price, "position left open at shutdown");
            }
        }

        let symbols = self.config.symbols.clone();
        let feed = &mut self.feed;
        let teardown = async move {
            feed.unsubscribe(&symbols).await?;
            feed.disconnect().await
        };
        match tokio::time::timeout(self.config.disconnect_timeout, teardown).await {
            Ok(Ok(())) => debug!("feed disconnected"),
            Ok(Err(e)) => warn!(error = %e, "feed disconnect failed"),
            Err(_) => warn!(timeout = ?self.config.disconnect_timeout, "feed disconnect timed out"),
        }

        // Flushing and dropping a queued sink waits on its writer thread.
        if let Some(mut sink) = self.sink.take() {
            let closed = tokio::task::spawn_blocking(move || {
                let flushed = sink.flush();
                drop(sink);
                flushed
            })
            .await;
            match closed {
                Ok(Ok(())) => debug!("sink closed"),
                Ok(Err(e)) => warn!(error = %e, "failed to flush sink"),
                Err(e) => warn!(error = %e, "sink close task failed"),
            }
        }
        self.transition(StreamState::Disconnected);
        self.marks()
    }

    fn marks(&self) -> Vec<PositionMark> {
        self.ledger
            .positions()
            .iter()
            .map(|(slot, pos)| {
                let last_price = self
                    .last_prices
                    .get(&slot.symbol)
                    .copied()
                    .unwrap_or(pos.avg_price);
                PositionMark {
                    slot: slot.clone(),
                    quantity: pos.quantity,
                    avg_price: pos.avg_price,
                    last_price,
                    mtm: pos.unrealized_pnl(last_price),
                }
            })
            .collect()
    }

    fn publish(&self, timestamp: Option<DateTime<Utc>>) {
        let curve = self.ledger.equity_curve();
        let tail = &curve[curve.len().saturating_sub(SNAPSHOT_TAIL)..];
        self.snapshots.send_replace(LiveSnapshot {
            run_id: self.config.run_id.clone(),
            state: self.state,
            timestamp: timestamp.or_else(|| curve.last().map(|p| p.timestamp)),
            cash: self.ledger.cash(),
            equity_tail: tail.to_vec(),
            positions: self.marks(),
        });
    }

    fn persist(&mut self, record: Record) {
        if let Some(sink) = self.sink.as_mut() {
            if let Err(e) = sink.append(&record) {
                warn!(kind = record.kind(), error = %e, "dropping record");
            }
        }
    }
}
