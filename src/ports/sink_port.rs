//! Persistence sink port trait.

use crate::domain::aggregator::Observation;
use crate::domain::bar::Bar;
use crate::domain::error::BarsimError;
use crate::domain::ledger::EquityPoint;
use crate::domain::position::Trade;

/// Something worth keeping after a run.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Tick(Observation),
    Bar(Bar),
    Trade(Trade),
    Equity { run_id: String, point: EquityPoint },
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::Tick(_) => "tick",
            Record::Bar(_) => "bar",
            Record::Trade(_) => "trade",
            Record::Equity { .. } => "equity",
        }
    }
}

pub trait PersistenceSink: Send {
    fn append(&mut self, record: &Record) -> Result<(), BarsimError>;

    fn flush(&mut self) -> Result<(), BarsimError> {
        Ok(())
    }
}
