//! CSV directory adapter: historical bars in, trades and equity curves out.
//!
//! Bars live in `<dir>/<symbol>_<resolution>.csv` with a
//! `timestamp,open,high,low,close,volume` header. Timestamps are RFC 3339, or
//! naive `YYYY-MM-DD[ HH:MM:SS]` read as UTC.

use crate::domain::bar::Bar;
use crate::domain::error::BarsimError;
use crate::domain::ledger::EquityPoint;
use crate::domain::position::Trade;
use crate::domain::resolution::Resolution;
use crate::ports::data_port::HistoricalBarStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub struct CsvAdapter {
    base_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct BarRow {
    timestamp: String,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    #[serde(default)]
    volume: i64,
}

impl CsvAdapter {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn csv_path(&self, symbol: &str, resolution: Resolution) -> PathBuf {
        self.base_path
            .join(format!("{}_{}.csv", file_stem(symbol), resolution))
    }

    fn read_symbol(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BarsimError> {
        let path = self.csv_path(symbol, resolution);
        if !path.exists() {
            warn!(symbol, resolution = %resolution, path = %path.display(), "no bar file");
            return Ok(Vec::new());
        }
        let mut rdr = csv::Reader::from_path(&path)?;
        let mut bars = Vec::new();
        for (line, row) in rdr.deserialize::<BarRow>().enumerate() {
            let row = row.map_err(|e| BarsimError::DatabaseQuery {
                reason: format!("{} row {}: {}", path.display(), line + 2, e),
            })?;
            let timestamp = parse_timestamp(&row.timestamp).ok_or_else(|| BarsimError::DatabaseQuery {
                reason: format!(
                    "{} row {}: invalid timestamp '{}'",
                    path.display(),
                    line + 2,
                    row.timestamp
                ),
            })?;
            if timestamp < from || timestamp > to {
                continue;
            }
            bars.push(Bar {
                timestamp,
                symbol: symbol.to_string(),
                resolution,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        bars.sort_by_key(|b| b.timestamp);
        debug!(symbol, resolution = %resolution, bars = bars.len(), "read bar file");
        Ok(bars)
    }
}

impl HistoricalBarStore for CsvAdapter {
    fn load_bars(
        &self,
        symbols: &[String],
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BarsimError> {
        let mut bars = Vec::new();
        for symbol in symbols {
            bars.extend(self.read_symbol(symbol, resolution, from, to)?);
        }
        Ok(bars)
    }

    fn list_symbols(&self, resolution: Resolution) -> Result<Vec<String>, BarsimError> {
        let suffix = format!("_{resolution}.csv");
        let mut symbols: Vec<String> = fs::read_dir(&self.base_path)?
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().into_owned();
                name.strip_suffix(&suffix).map(str::to_string)
            })
            .collect();
        symbols.sort();
        Ok(symbols)
    }
}

/// File-name-safe form of a symbol such as `NSE:SBIN-EQ`.
pub fn file_stem(symbol: &str) -> String {
    symbol.replace([':', '/', '\\'], "_")
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Some(dt.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

#[derive(Debug, Serialize)]
struct TradeRow<'a> {
    run_id: &'a str,
    timestamp: String,
    symbol: &'a str,
    timeframe: String,
    action: &'a str,
    quantity: i64,
    price: f64,
}

#[derive(Debug, Serialize)]
struct EquityRow {
    timestamp: String,
    total: f64,
    cash: f64,
    holdings: f64,
}

pub fn write_trades(path: &Path, trades: &[Trade]) -> Result<(), BarsimError> {
    let mut wtr = csv::Writer::from_path(path)?;
    for trade in trades {
        wtr.serialize(TradeRow {
            run_id: &trade.run_id,
            timestamp: trade.timestamp.to_rfc3339(),
            symbol: &trade.symbol,
            timeframe: trade.timeframe.to_string(),
            action: trade.action.as_str(),
            quantity: trade.quantity,
            price: trade.price,
        })?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_equity_curve(path: &Path, curve: &[EquityPoint]) -> Result<(), BarsimError> {
    let mut wtr = csv::Writer::from_path(path)?;
    for point in curve {
        wtr.serialize(EquityRow {
            timestamp: point.timestamp.to_rfc3339(),
            total: point.total,
            cash: point.cash,
            holdings: point.holdings,
        })?;
    }
    wtr.flush()?;
    Ok(())
}
