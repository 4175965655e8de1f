//! Per (symbol, resolution) ordered bar history.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

use super::bar::Bar;
use super::resolution::Resolution;

/// Ordered, optionally bounded sequences of completed bars.
///
/// Each sequence stays ascending by timestamp. Duplicate timestamps are kept;
/// producers are expected to complete each bucket only once.
#[derive(Debug, Clone, Default)]
pub struct BarHistoryStore {
    series: BTreeMap<(String, Resolution), Vec<Bar>>,
    max_len: Option<usize>,
}

impl BarHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that trims every sequence to `max_len` bars on append.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            series: BTreeMap::new(),
            max_len: Some(max_len),
        }
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    pub fn append(&mut self, bar: Bar) {
        let key = (bar.symbol.clone(), bar.resolution);
        let bars = self.series.entry(key.clone()).or_default();
        match bars.last() {
            Some(last) if last.timestamp > bar.timestamp => {
                let at = bars.partition_point(|b| b.timestamp <= bar.timestamp);
                bars.insert(at, bar);
            }
            _ => bars.push(bar),
        }
        if let Some(max_len) = self.max_len {
            self.trim(&key.0, key.1, max_len);
        }
    }

    /// Seed a sequence with a pre-fetched tail of historical bars.
    pub fn warm_up<I>(&mut self, symbol: &str, resolution: Resolution, bars: I) -> usize
    where
        I: IntoIterator<Item = Bar>,
    {
        let key = (symbol.to_string(), resolution);
        let series = self.series.entry(key).or_default();
        let before = series.len();
        series.extend(
            bars.into_iter()
                .filter(|b| b.symbol == symbol && b.resolution == resolution),
        );
        series.sort_by_key(|b| b.timestamp);
        let added = series.len() - before;
        if let Some(max_len) = self.max_len {
            self.trim(symbol, resolution, max_len);
        }
        added
    }

    /// Drop the oldest bars so at most `max_len` remain.
    pub fn trim(&mut self, symbol: &str, resolution: Resolution, max_len: usize) {
        if let Some(bars) = self.series.get_mut(&(symbol.to_string(), resolution)) {
            if bars.len() > max_len {
                let excess = bars.len() - max_len;
                bars.drain(..excess);
            }
        }
    }

    pub fn history(&self, symbol: &str, resolution: Resolution) -> &[Bar] {
        self.series
            .get(&(symbol.to_string(), resolution))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn last(&self, symbol: &str, resolution: Resolution) -> Option<&Bar> {
        self.history(symbol, resolution).last()
    }

    /// Most recent bar with `timestamp <= at`.
    pub fn latest_at(&self, symbol: &str, resolution: Resolution, at: DateTime<Utc>) -> Option<&Bar> {
        let bars = self.history(symbol, resolution);
        let idx = bars.partition_point(|b| b.timestamp <= at);
        idx.checked_sub(1).map(|i| &bars[i])
    }

    /// Most recent bar whose period ended at or before `at`.
    pub fn latest_closed_by(&self, symbol: &str, resolution: Resolution, at: DateTime<Utc>) -> Option<&Bar> {
        let bars = self.history(symbol, resolution);
        let idx = bars.partition_point(|b| b.end() <= at);
        idx.checked_sub(1).map(|i| &bars[i])
    }

    /// Bars with `from <= timestamp < to`.
    pub fn range(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> &[Bar] {
        let bars = self.history(symbol, resolution);
        let lo = bars.partition_point(|b| b.timestamp < from);
        let hi = bars.partition_point(|b| b.timestamp < to);
        if lo >= hi { &[] } else { &bars[lo..hi] }
    }

    pub fn len(&self, symbol: &str, resolution: Resolution) -> usize {
        self.history(symbol, resolution).len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.values().all(Vec::is_empty)
    }

    /// Symbols with at least one bar at `resolution`, in sorted order.
    pub fn symbols(&self, resolution: Resolution) -> impl Iterator<Item = &str> {
        self.series
            .iter()
            .filter(move |((_, res), bars)| *res == resolution && !bars.is_empty())
            .map(|((symbol, _), _)| symbol.as_str())
    }

    /// Distinct timestamps at `resolution` across all symbols, ascending.
    pub fn timeline(&self, resolution: Resolution) -> Vec<DateTime<Utc>> {
        let unique: BTreeSet<DateTime<Utc>> = self
            .series
            .iter()
            .filter(|((_, res), _)| *res == resolution)
            .flat_map(|(_, bars)| bars.iter().map(|b| b.timestamp))
            .collect();
        unique.into_iter().collect()
    }

    /// Bars at `resolution` stamped exactly `at`, one per symbol.
    pub fn bars_at(&self, resolution: Resolution, at: DateTime<Utc>) -> Vec<&Bar> {
        self.series
            .iter()
            .filter(|((_, res), _)| *res == resolution)
            .flat_map(|(_, bars)| {
                let lo = bars.partition_point(|b| b.timestamp < at);
                bars[lo..].iter().take_while(move |b| b.timestamp == at)
            })
            .collect()
    }
}
