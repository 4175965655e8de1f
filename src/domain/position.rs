//! Position slots, holdings and the trade record.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use super::error::BarsimError;
use super::resolution::Resolution;

/// Ledger key: one symbol traded by the strategy running on one timeframe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot {
    pub symbol: String,
    pub timeframe: Resolution,
}

impl Slot {
    pub fn new(symbol: impl Into<String>, timeframe: Resolution) -> Self {
        Slot {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeAction::Buy => "BUY",
            TradeAction::Sell => "SELL",
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> i64 {
        match self {
            TradeAction::Buy => 1,
            TradeAction::Sell => -1,
        }
    }
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeAction {
    type Err = BarsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(TradeAction::Buy),
            "SELL" => Ok(TradeAction::Sell),
            other => Err(BarsimError::MalformedIntent {
                reason: format!("unknown action '{other}'"),
            }),
        }
    }
}

/// Long holding in one slot. Slots at zero quantity are removed from the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub quantity: i64,
    pub avg_price: f64,
}

impl Position {
    pub fn market_value(&self, price: f64) -> f64 {
        self.quantity as f64 * price
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        (price - self.avg_price) * self.quantity as f64
    }

    /// Fold a buy into the weighted-average entry price.
    pub fn add(&mut self, quantity: i64, price: f64) {
        let total = self.quantity + quantity;
        if total > 0 {
            self.avg_price =
                (self.avg_price * self.quantity as f64 + price * quantity as f64) / total as f64;
        }
        self.quantity = total;
    }
}

/// Immutable fill record.
#[derive(Debug, Clone, PartialEq)]
pub struct Trade {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub timeframe: Resolution,
    pub action: TradeAction,
    pub quantity: i64,
    pub price: f64,
    pub run_id: String,
}

impl Trade {
    pub fn value(&self) -> f64 {
        self.quantity as f64 * self.price
    }
}
