#![allow(dead_code)]

use async_trait::async_trait;
use barsim::domain::bar::Bar;
use barsim::domain::aggregator::Observation;
use barsim::domain::error::BarsimError;
use barsim::domain::execution::TradeIntent;
use barsim::domain::ledger::LedgerView;
use barsim::domain::packet::DataPacket;
use barsim::domain::resolution::Resolution;
use barsim::domain::session::{SessionConfig, TradingMode};
use barsim::domain::strategy::Strategy;
use barsim::ports::data_port::HistoricalBarStore;
use barsim::ports::feed_port::LiveFeed;
use barsim::ports::metadata_port::{SymbolMetadata, TradingCalendar};
use barsim::ports::sink_port::{PersistenceSink, Record};
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub struct MockBarStore {
    pub bars: Vec<Bar>,
    pub errors: HashMap<Resolution, String>,
}

impl MockBarStore {
    pub fn new() -> Self {
        Self {
            bars: Vec::new(),
            errors: HashMap::new(),
        }
    }

    pub fn with_bars(mut self, bars: Vec<Bar>) -> Self {
        self.bars.extend(bars);
        self
    }

    pub fn with_error(mut self, resolution: Resolution, reason: &str) -> Self {
        self.errors.insert(resolution, reason.to_string());
        self
    }
}

impl HistoricalBarStore for MockBarStore {
    fn load_bars(
        &self,
        symbols: &[String],
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BarsimError> {
        if let Some(reason) = self.errors.get(&resolution) {
            return Err(BarsimError::Database {
                reason: reason.clone(),
            });
        }
        Ok(self
            .bars
            .iter()
            .filter(|b| {
                b.resolution == resolution
                    && symbols.contains(&b.symbol)
                    && b.timestamp >= from
                    && b.timestamp <= to
            })
            .cloned()
            .collect())
    }

    fn list_symbols(&self, resolution: Resolution) -> Result<Vec<String>, BarsimError> {
        let mut symbols: Vec<String> = self
            .bars
            .iter()
            .filter(|b| b.resolution == resolution)
            .map(|b| b.symbol.clone())
            .collect();
        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }
}

/// Every day trades 09:15 to 15:30.
pub struct EveryDay;

impl TradingCalendar for EveryDay {
    fn is_trading_day(&self, _date: NaiveDate) -> bool {
        true
    }

    fn market_open(&self, _date: NaiveDate) -> NaiveTime {
        NaiveTime::from_hms_opt(9, 15, 0).unwrap()
    }

    fn market_close(&self, _date: NaiveDate) -> NaiveTime {
        NaiveTime::from_hms_opt(15, 30, 0).unwrap()
    }
}

pub struct Lots(pub HashMap<String, i64>);

impl Lots {
    pub fn ones() -> Self {
        Lots(HashMap::new())
    }

    pub fn with(symbol: &str, lot: i64) -> Self {
        Lots(HashMap::from([(symbol.to_string(), lot)]))
    }
}

impl SymbolMetadata for Lots {
    fn lot_size(&self, symbol: &str) -> Result<i64, BarsimError> {
        Ok(self.0.get(symbol).copied().unwrap_or(1))
    }
}

/// One `on_data` call as observed by [`ScriptedStrategy`].
#[derive(Debug, Clone, PartialEq)]
pub struct Seen {
    pub resolution: Resolution,
    pub timestamp: DateTime<Utc>,
    pub is_live: bool,
    /// Longest primary series in the packet.
    pub history_len: usize,
    /// Close of the newest bar visible at every other required resolution.
    pub latest: Vec<(Resolution, Option<f64>)>,
}

/// Emits pre-arranged intents keyed by bar timestamp, and records what it saw.
pub struct ScriptedStrategy {
    pub timeframe: Resolution,
    pub required: Vec<Resolution>,
    pub script: HashMap<DateTime<Utc>, Vec<TradeIntent>>,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl ScriptedStrategy {
    pub fn new(timeframe: Resolution) -> Self {
        Self {
            timeframe,
            required: vec![timeframe],
            script: HashMap::new(),
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn at(mut self, ts: DateTime<Utc>, intent: TradeIntent) -> Self {
        self.script.entry(ts).or_default().push(intent);
        self
    }

    pub fn requiring(mut self, resolutions: &[Resolution]) -> Self {
        self.required = resolutions.to_vec();
        self
    }

    pub fn sharing(mut self, seen: &Arc<Mutex<Vec<Seen>>>) -> Self {
        self.seen = Arc::clone(seen);
        self
    }
}

impl Strategy for ScriptedStrategy {
    fn name(&self) -> &str {
        "ScriptedStrategy"
    }

    fn primary_resolution(&self) -> Resolution {
        self.timeframe
    }

    fn required_resolutions(&self) -> Vec<Resolution> {
        self.required.clone()
    }

    fn on_data(
        &mut self,
        _ledger: &LedgerView<'_>,
        timestamp: DateTime<Utc>,
        packet: &DataPacket<'_>,
        is_live: bool,
    ) -> Vec<TradeIntent> {
        let history_len = packet
            .symbols(self.timeframe)
            .map(|s| packet.series(self.timeframe, s).len())
            .max()
            .unwrap_or(0);
        let latest = self
            .required
            .iter()
            .filter(|r| **r != self.timeframe)
            .map(|r| {
                let close = packet
                    .symbols(*r)
                    .next()
                    .and_then(|s| packet.latest(*r, s))
                    .map(|b| b.close);
                (*r, close)
            })
            .collect();
        self.seen.lock().unwrap().push(Seen {
            resolution: self.timeframe,
            timestamp,
            is_live,
            history_len,
            latest,
        });
        self.script.remove(&timestamp).unwrap_or_default()
    }
}

/// Collects every record; clone the handle before boxing.
#[derive(Clone, Default)]
pub struct MemorySink {
    pub records: Arc<Mutex<Vec<Record>>>,
    pub flushes: Arc<Mutex<usize>>,
}

impl MemorySink {
    pub fn count(&self, kind: &str) -> usize {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.kind() == kind)
            .count()
    }
}

impl PersistenceSink for MemorySink {
    fn append(&mut self, record: &Record) -> Result<(), BarsimError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), BarsimError> {
        *self.flushes.lock().unwrap() += 1;
        Ok(())
    }
}

/// Feed backed by a channel the test holds the sending end of.
pub struct ChannelFeed {
    rx: Option<mpsc::Receiver<Observation>>,
    pub hang_on_disconnect: bool,
    pub disconnects: Arc<Mutex<usize>>,
}

impl ChannelFeed {
    pub fn new() -> (Self, mpsc::Sender<Observation>) {
        let (tx, rx) = mpsc::channel(256);
        (
            Self {
                rx: Some(rx),
                hang_on_disconnect: false,
                disconnects: Arc::new(Mutex::new(0)),
            },
            tx,
        )
    }
}

#[async_trait]
impl LiveFeed for ChannelFeed {
    async fn subscribe(
        &mut self,
        _symbols: &[String],
    ) -> Result<mpsc::Receiver<Observation>, BarsimError> {
        self.rx.take().ok_or_else(|| BarsimError::UpstreamDisconnected {
            reason: "already subscribed".into(),
        })
    }

    async fn unsubscribe(&mut self, _symbols: &[String]) -> Result<(), BarsimError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BarsimError> {
        *self.disconnects.lock().unwrap() += 1;
        if self.hang_on_disconnect {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

/// UTC session so bar labels read as exchange-local times.
pub fn utc_session(mode: TradingMode) -> SessionConfig {
    SessionConfig {
        mode,
        utc_offset: FixedOffset::east_opt(0).unwrap(),
        ..SessionConfig::default()
    }
}

pub fn at(day: u32, h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, h, m, 0).unwrap()
}

pub fn make_bar(symbol: &str, resolution: Resolution, ts: DateTime<Utc>, close: f64) -> Bar {
    Bar {
        timestamp: ts,
        symbol: symbol.to_string(),
        resolution,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 100,
    }
}

/// Consecutive bars starting at `from`, one per period.
pub fn make_series(
    symbol: &str,
    resolution: Resolution,
    from: DateTime<Utc>,
    closes: &[f64],
) -> Vec<Bar> {
    let step = resolution.period();
    closes
        .iter()
        .enumerate()
        .map(|(i, c)| make_bar(symbol, resolution, from + step * i as i32, *c))
        .collect()
}

pub fn tick(symbol: &str, price: f64, ts: DateTime<Utc>) -> Observation {
    Observation::new(symbol, price, ts)
}

pub fn minutes(n: i64) -> Duration {
    Duration::minutes(n)
}
