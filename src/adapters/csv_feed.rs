//! Tick file replayed through the live feed interface.
//!
//! Rows are `timestamp,symbol,price[,volume]`, volume being the cumulative
//! day volume. The file is read at subscribe time and streamed from a tokio
//! task; the channel closes after the last row, which the streaming driver
//! sees as an upstream disconnect.

use crate::adapters::csv_adapter::parse_timestamp;
use crate::domain::aggregator::Observation;
use crate::domain::error::BarsimError;
use crate::ports::feed_port::LiveFeed;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Deserialize)]
struct TickRow {
    timestamp: String,
    symbol: String,
    price: f64,
    #[serde(default)]
    volume: Option<u64>,
}

pub struct CsvTickFeed {
    path: PathBuf,
    pace: Option<Duration>,
    task: Option<JoinHandle<()>>,
}

impl CsvTickFeed {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            pace: None,
            task: None,
        }
    }

    /// Sleep this long between rows instead of sending as fast as possible.
    pub fn with_pace(mut self, pace: Duration) -> Self {
        self.pace = Some(pace);
        self
    }

    fn read_ticks(&self, symbols: &BTreeSet<&str>) -> Result<Vec<Observation>, BarsimError> {
        let mut rdr = csv::Reader::from_path(&self.path)?;
        let mut ticks = Vec::new();
        for (line, row) in rdr.deserialize::<TickRow>().enumerate() {
            let row = row?;
            if !symbols.contains(row.symbol.as_str()) {
                continue;
            }
            let Some(timestamp) = parse_timestamp(&row.timestamp) else {
                warn!(line = line + 2, value = %row.timestamp, "skipping tick with bad timestamp");
                continue;
            };
            let mut obs = Observation::new(row.symbol, row.price, timestamp);
            obs.volume = row.volume;
            ticks.push(obs);
        }
        Ok(ticks)
    }

    fn stop_task(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl LiveFeed for CsvTickFeed {
    async fn subscribe(
        &mut self,
        symbols: &[String],
    ) -> Result<mpsc::Receiver<Observation>, BarsimError> {
        self.stop_task();
        let wanted: BTreeSet<&str> = symbols.iter().map(String::as_str).collect();
        let ticks = self.read_ticks(&wanted)?;
        info!(path = %self.path.display(), ticks = ticks.len(), "replaying tick file");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pace = self.pace;
        self.task = Some(tokio::spawn(async move {
            for obs in ticks {
                if tx.send(obs).await.is_err() {
                    debug!("tick receiver dropped");
                    return;
                }
                if let Some(pace) = pace {
                    tokio::time::sleep(pace).await;
                }
            }
        }));
        Ok(rx)
    }

    async fn unsubscribe(&mut self, _symbols: &[String]) -> Result<(), BarsimError> {
        self.stop_task();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BarsimError> {
        self.stop_task();
        Ok(())
    }
}

impl Drop for CsvTickFeed {
    fn drop(&mut self) {
        self.stop_task();
    }
}
