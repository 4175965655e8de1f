//! SQLite adapter: historical bar store and run persistence sink.

use crate::domain::bar::Bar;
use crate::domain::error::BarsimError;
use crate::domain::resolution::Resolution;
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::HistoricalBarStore;
use crate::ports::sink_port::{PersistenceSink, Record};
use chrono::{DateTime, NaiveDateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;
use tracing::debug;

/// Stored timestamps sort lexically in this layout.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn pool_err(e: r2d2::Error) -> BarsimError {
    BarsimError::Database {
        reason: e.to_string(),
    }
}

fn query_err(e: rusqlite::Error) -> BarsimError {
    BarsimError::DatabaseQuery {
        reason: e.to_string(),
    }
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

#[derive(Clone)]
pub struct SqliteAdapter {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteAdapter {
    pub fn from_config(config: &dyn ConfigPort) -> Result<Self, BarsimError> {
        let db_path =
            config
                .get_string("data", "sqlite_path")
                .ok_or_else(|| BarsimError::ConfigMissing {
                    section: "data".into(),
                    key: "sqlite_path".into(),
                })?;

        let pool_size = config.get_int("data", "pool_size", 4).max(1) as u32;

        let manager = SqliteConnectionManager::file(&db_path);
        let pool = Pool::builder()
            .max_size(pool_size)
            .build(manager)
            .map_err(pool_err)?;

        let adapter = Self { pool };
        adapter.initialize_schema()?;
        Ok(adapter)
    }

    pub fn in_memory() -> Result<Self, BarsimError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(pool_err)?;

        Ok(Self { pool })
    }

    pub fn initialize_schema(&self) -> Result<(), BarsimError> {
        let conn = self.pool.get().map_err(pool_err)?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS historical_data (
                symbol TEXT NOT NULL,
                resolution TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (symbol, resolution, timestamp)
            );
            CREATE INDEX IF NOT EXISTS idx_historical_res_ts ON historical_data(resolution, timestamp);
            CREATE TABLE IF NOT EXISTS ticks (
                symbol TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                price REAL NOT NULL,
                volume INTEGER
            );
            CREATE TABLE IF NOT EXISTS live_bars (
                symbol TEXT NOT NULL,
                resolution TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                volume INTEGER NOT NULL,
                PRIMARY KEY (symbol, resolution, timestamp)
            );
            CREATE TABLE IF NOT EXISTS trades (
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                symbol TEXT NOT NULL,
                timeframe TEXT NOT NULL,
                action TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                price REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_trades_run ON trades(run_id);
            CREATE TABLE IF NOT EXISTS equity_curve (
                run_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                total REAL NOT NULL,
                cash REAL NOT NULL,
                holdings REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_equity_run ON equity_curve(run_id);",
        )
        .map_err(query_err)?;

        Ok(())
    }

    pub fn insert_bars(&self, bars: &[Bar]) -> Result<(), BarsimError> {
        let mut conn = self.pool.get().map_err(pool_err)?;
        let tx = conn.transaction().map_err(query_err)?;

        for bar in bars {
            tx.execute(
                "INSERT OR REPLACE INTO historical_data
                 (symbol, resolution, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    bar.symbol,
                    bar.resolution.to_string(),
                    format_ts(bar.timestamp),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ],
            )
            .map_err(query_err)?;
        }

        tx.commit().map_err(query_err)?;
        Ok(())
    }

    /// Number of trades persisted under `run_id`.
    pub fn trade_count(&self, run_id: &str) -> Result<usize, BarsimError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM trades WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(query_err)?;
        Ok(count as usize)
    }

    pub fn equity_point_count(&self, run_id: &str) -> Result<usize, BarsimError> {
        let conn = self.pool.get().map_err(pool_err)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM equity_curve WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .map_err(query_err)?;
        Ok(count as usize)
    }
}

impl HistoricalBarStore for SqliteAdapter {
    fn load_bars(
        &self,
        symbols: &[String],
        resolution: Resolution,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Bar>, BarsimError> {
        let conn = self.pool.get().map_err(pool_err)?;

        let query = "SELECT timestamp, open, high, low, close, volume
                     FROM historical_data
                     WHERE symbol = ?1 AND resolution = ?2 AND timestamp >= ?3 AND timestamp <= ?4
                     ORDER BY timestamp ASC";
        let mut stmt = conn.prepare(query).map_err(query_err)?;

        let res_str = resolution.to_string();
        let from_str = format_ts(from);
        let to_str = format_ts(to);
        let mut bars = Vec::new();

        for symbol in symbols {
            let rows = stmt
                .query_map(params![symbol, res_str, from_str, to_str], |row| {
                    let ts_str: String = row.get(0)?;
                    let timestamp = NaiveDateTime::parse_from_str(&ts_str, TS_FORMAT)
                        .map_err(|e| {
                            rusqlite::Error::FromSqlConversionFailure(
                                ts_str.len(),
                                rusqlite::types::Type::Text,
                                Box::new(e),
                            )
                        })?
                        .and_utc();
                    Ok(Bar {
                        timestamp,
                        symbol: symbol.clone(),
                        resolution,
                        open: row.get(1)?,
                        high: row.get(2)?,
                        low: row.get(3)?,
                        close: row.get(4)?,
                        volume: row.get(5)?,
                    })
                })
                .map_err(query_err)?;

            for row in rows {
                bars.push(row.map_err(query_err)?);
            }
        }

        debug!(resolution = %resolution, bars = bars.len(), "loaded bars from sqlite");
        Ok(bars)
    }

    fn list_symbols(&self, resolution: Resolution) -> Result<Vec<String>, BarsimError> {
        let conn = self.pool.get().map_err(pool_err)?;

        let query =
            "SELECT DISTINCT symbol FROM historical_data WHERE resolution = ?1 ORDER BY symbol";
        let mut stmt = conn.prepare(query).map_err(query_err)?;
        let rows = stmt
            .query_map(params![resolution.to_string()], |row| row.get(0))
            .map_err(query_err)?;

        let mut symbols = Vec::new();
        for row in rows {
            symbols.push(row.map_err(query_err)?);
        }
        Ok(symbols)
    }
}

impl PersistenceSink for SqliteAdapter {
    fn append(&mut self, record: &Record) -> Result<(), BarsimError> {
        let conn = self.pool.get().map_err(pool_err)?;
        match record {
            Record::Tick(obs) => conn.execute(
                "INSERT INTO ticks (symbol, timestamp, price, volume) VALUES (?1, ?2, ?3, ?4)",
                params![
                    obs.symbol,
                    format_ts(obs.timestamp),
                    obs.price,
                    obs.volume.map(|v| v as i64)
                ],
            ),
            Record::Bar(bar) => conn.execute(
                "INSERT OR REPLACE INTO live_bars
                 (symbol, resolution, timestamp, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    bar.symbol,
                    bar.resolution.to_string(),
                    format_ts(bar.timestamp),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume
                ],
            ),
            Record::Trade(trade) => conn.execute(
                "INSERT INTO trades (run_id, timestamp, symbol, timeframe, action, quantity, price)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    trade.run_id,
                    format_ts(trade.timestamp),
                    trade.symbol,
                    trade.timeframe.to_string(),
                    trade.action.as_str(),
                    trade.quantity,
                    trade.price
                ],
            ),
            Record::Equity { run_id, point } => conn.execute(
                "INSERT INTO equity_curve (run_id, timestamp, total, cash, holdings)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    run_id,
                    format_ts(point.timestamp),
                    point.total,
                    point.cash,
                    point.holdings
                ],
            ),
        }
        .map_err(query_err)?;
        Ok(())
    }
}
