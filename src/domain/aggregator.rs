//! Raw price observations to completed bars, plus higher-timeframe derivation.

use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

use super::bar::Bar;
use super::error::BarsimError;
use super::resolution::Resolution;

/// One price print from a feed or a replayed tick file.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub symbol: String,
    pub price: f64,
    /// Cumulative traded volume for the day, when the feed reports it.
    pub volume: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn new(symbol: impl Into<String>, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            volume: None,
            timestamp,
        }
    }

    pub fn with_volume(mut self, cumulative: u64) -> Self {
        self.volume = Some(cumulative);
        self
    }
}

/// Open accumulator for the current bucket of one (symbol, resolution).
#[derive(Debug, Clone, PartialEq)]
pub struct IncompleteBar {
    pub bucket_start: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

impl IncompleteBar {
    fn open_at(bucket_start: DateTime<Utc>, price: f64, volume: i64) -> Self {
        Self {
            bucket_start,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }

    fn update(&mut self, price: f64, volume: i64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.volume += volume;
    }

    fn complete(self, symbol: &str, resolution: Resolution) -> Bar {
        Bar {
            timestamp: self.bucket_start,
            symbol: symbol.to_string(),
            resolution,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
        }
    }
}

/// Turns observations into finest-resolution bars and derives the configured
/// higher timeframes from them.
///
/// Only the finest resolution is accumulated tick by tick, so there is at most
/// one [`IncompleteBar`] per symbol. Derived bars are assembled from completed
/// finest bars when the last finest bucket of a derived bucket closes.
#[derive(Debug)]
pub struct ResolutionAggregator {
    finest: Resolution,
    derived: Vec<(Resolution, u32)>,
    open: BTreeMap<String, IncompleteBar>,
    recent: BTreeMap<String, VecDeque<Bar>>,
    day_volume: BTreeMap<String, (NaiveDate, u64)>,
    flushed: bool,
}

impl ResolutionAggregator {
    /// `derived` resolutions that are not whole multiples of `finest` (or are
    /// daily) are ignored; daily bars come from warm-up loads.
    pub fn new(finest: Resolution, derived: &[Resolution]) -> Self {
        let mut targets: Vec<(Resolution, u32)> = Vec::new();
        for res in derived {
            if *res == finest {
                continue;
            }
            if !res.is_intraday() {
                debug!(resolution = %res, "daily bars are not derived from live data");
                continue;
            }
            match res.multiple_of(finest) {
                Some(multiple) if !targets.iter().any(|(r, _)| r == res) => {
                    targets.push((*res, multiple));
                }
                Some(_) => {}
                None => {
                    warn!(resolution = %res, finest = %finest, "resolution is not a multiple of the finest bar, skipping");
                }
            }
        }
        targets.sort();
        Self {
            finest,
            derived: targets,
            open: BTreeMap::new(),
            recent: BTreeMap::new(),
            day_volume: BTreeMap::new(),
            flushed: false,
        }
    }

    pub fn finest(&self) -> Resolution {
        self.finest
    }

    pub fn derived_resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.derived.iter().map(|(r, _)| *r)
    }

    pub fn incomplete(&self, symbol: &str) -> Option<&IncompleteBar> {
        self.open.get(symbol)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Apply one observation.
    ///
    /// Returns the bars it completed: the previous finest bar for the symbol,
    /// followed by any derived bars that bar closed, finest first.
    pub fn on_observation(&mut self, obs: &Observation) -> Result<Vec<Bar>, BarsimError> {
        if let Err(reason) = self.validate(obs) {
            warn!(
                symbol = %obs.symbol,
                timestamp = %obs.timestamp,
                price = obs.price,
                reason = %reason,
                "rejected observation"
            );
            return Err(BarsimError::MalformedObservation {
                symbol: obs.symbol.clone(),
                reason,
            });
        }

        let bucket = self.finest.bucket_start(obs.timestamp);
        let volume = self.volume_delta(obs);

        if let Some(acc) = self.open.get_mut(&obs.symbol) {
            if acc.bucket_start == bucket {
                acc.update(obs.price, volume);
                return Ok(Vec::new());
            }
        }

        let fresh = IncompleteBar::open_at(bucket, obs.price, volume);
        match self.open.insert(obs.symbol.clone(), fresh) {
            Some(prev) => {
                let bar = prev.complete(&obs.symbol, self.finest);
                Ok(self.complete_finest(bar))
            }
            None => Ok(Vec::new()),
        }
    }

    /// Force-complete every open accumulator. Runs once; later calls return
    /// nothing and later observations are rejected.
    pub fn flush(&mut self) -> Vec<Bar> {
        if self.flushed {
            return Vec::new();
        }
        self.flushed = true;
        let open = std::mem::take(&mut self.open);
        let mut completed = Vec::new();
        for (symbol, acc) in open {
            let bar = acc.complete(&symbol, self.finest);
            completed.extend(self.complete_finest(bar));
        }
        debug!(bars = completed.len(), "flushed open bars");
        completed
    }

    /// Record a completed finest bar and return it with any derived bars it closes.
    ///
    /// Feeds that already deliver finest bars can call this directly.
    pub fn complete_finest(&mut self, bar: Bar) -> Vec<Bar> {
        let derived = self.derive(&bar);
        let mut out = Vec::with_capacity(1 + derived.len());
        out.push(bar);
        out.extend(derived);
        out
    }

    fn derive(&mut self, bar: &Bar) -> Vec<Bar> {
        let capacity = self
            .derived
            .iter()
            .map(|(_, m)| *m as usize)
            .max()
            .unwrap_or(0);
        if capacity == 0 {
            return Vec::new();
        }

        let recent = self.recent.entry(bar.symbol.clone()).or_default();
        recent.push_back(bar.clone());
        while recent.len() > capacity {
            recent.pop_front();
        }

        let index = self.finest.bucket_index(bar.timestamp);
        let mut out = Vec::new();
        for (res, multiple) in &self.derived {
            if (index + 1) % i64::from(*multiple) != 0 {
                continue;
            }
            let start = res.bucket_start(bar.timestamp);
            let window: Vec<Bar> = recent
                .iter()
                .filter(|b| b.timestamp >= start && b.timestamp <= bar.timestamp)
                .cloned()
                .collect();
            if window.len() < *multiple as usize {
                debug!(
                    symbol = %bar.symbol,
                    resolution = %res,
                    have = window.len(),
                    need = multiple,
                    "not enough finer bars, skipping"
                );
                continue;
            }
            if let Some(merged) = Bar::merge(&window, *res) {
                out.push(merged);
            }
        }
        out
    }

    fn validate(&self, obs: &Observation) -> Result<(), String> {
        if self.flushed {
            return Err("aggregator already flushed".into());
        }
        if obs.symbol.trim().is_empty() {
            return Err("empty symbol".into());
        }
        if !obs.price.is_finite() || obs.price <= 0.0 {
            return Err(format!("invalid price {}", obs.price));
        }
        let bucket = self.finest.bucket_start(obs.timestamp);
        if let Some(acc) = self.open.get(&obs.symbol) {
            if bucket < acc.bucket_start {
                return Err(format!(
                    "bucket {bucket} is older than open bucket {}",
                    acc.bucket_start
                ));
            }
        }
        if let (Some(volume), Some((day, last))) = (obs.volume, self.day_volume.get(&obs.symbol)) {
            if *day == obs.timestamp.date_naive() && volume < *last {
                return Err(format!("cumulative volume went backwards ({last} -> {volume})"));
            }
        }
        Ok(())
    }

    /// Per-observation volume from a cumulative day counter. The first print of
    /// a day only sets the baseline.
    fn volume_delta(&mut self, obs: &Observation) -> i64 {
        let Some(volume) = obs.volume else {
            return 0;
        };
        let day = obs.timestamp.date_naive();
        let delta = match self.day_volume.get(&obs.symbol) {
            Some((last_day, last)) if *last_day == day => volume - last,
            _ => 0,
        };
        self.day_volume.insert(obs.symbol.clone(), (day, volume));
        i64::try_from(delta).unwrap_or(i64::MAX)
    }
}
