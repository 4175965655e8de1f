//! Run identity and lifecycle.

use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// Short symbol label: exchange prefix and series suffix stripped.
fn short_symbol(symbol: &str) -> &str {
    let s = symbol.rsplit(':').next().unwrap_or(symbol);
    s.strip_suffix("-EQ").unwrap_or(s)
}

/// `bt_<YYYYmmdd_HHMMSS>_<strategy>_<sym1-sym2>[_Nmore]`.
pub fn backtest_run_id(now: DateTime<Utc>, strategy: &str, symbols: &[String]) -> String {
    let strategy = strategy.replace("Strategy", "");
    let mut label = symbols
        .iter()
        .take(2)
        .map(|s| short_symbol(s))
        .collect::<Vec<_>>()
        .join("-");
    if symbols.len() > 2 {
        label.push_str(&format!("_{}more", symbols.len() - 2));
    }
    format!("bt_{}_{}_{}", now.format("%Y%m%d_%H%M%S"), strategy, label)
}

/// `live_<YYYYmmdd_HHMMSS>`.
pub fn live_run_id(now: DateTime<Utc>) -> String {
    format!("live_{}", now.format("%Y%m%d_%H%M%S"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Starting => "starting",
            RunStatus::Running => "running",
            RunStatus::Stopping => "stopping",
            RunStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Driver side of a run: publishes status, observes stop requests.
#[derive(Debug)]
pub struct RunControl {
    status: watch::Sender<RunStatus>,
    stop: watch::Receiver<bool>,
}

/// Supervisor side of a run: reads status, requests a stop.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: String,
    status: watch::Receiver<RunStatus>,
    stop: Arc<watch::Sender<bool>>,
}

/// Create a linked control/handle pair for `run_id`.
pub fn run_lifecycle(run_id: impl Into<String>) -> (RunControl, RunHandle) {
    let (status_tx, status_rx) = watch::channel(RunStatus::Starting);
    let (stop_tx, stop_rx) = watch::channel(false);
    (
        RunControl {
            status: status_tx,
            stop: stop_rx,
        },
        RunHandle {
            run_id: run_id.into(),
            status: status_rx,
            stop: Arc::new(stop_tx),
        },
    )
}

impl RunControl {
    pub fn set_status(&self, status: RunStatus) {
        self.status.send_replace(status);
    }

    pub fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Resolves once a stop has been requested or every handle is gone.
    pub async fn stopped(&mut self) {
        while !*self.stop.borrow_and_update() {
            if self.stop.changed().await.is_err() {
                return;
            }
        }
    }
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> RunStatus {
        *self.status.borrow()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status(), RunStatus::Starting | RunStatus::Running)
    }

    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }

    /// Wait until the driver reports [`RunStatus::Stopped`].
    pub async fn wait_stopped(&mut self) {
        while *self.status.borrow_and_update() != RunStatus::Stopped {
            if self.status.changed().await.is_err() {
                return;
            }
        }
    }
}
