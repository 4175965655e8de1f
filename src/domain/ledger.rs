//! Portfolio ledger: cash, slot positions, compounding capital, trades and equity.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::position::{Position, Slot, Trade, TradeAction};

/// Last known price per symbol.
pub type PriceMap = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub total: f64,
    pub cash: f64,
    pub holdings: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceSummary {
    pub initial_cash: f64,
    pub cash: f64,
    pub holdings: f64,
    pub total: f64,
    pub total_pnl: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub trade_count: usize,
}

impl PerformanceSummary {
    pub fn total_return_pct(&self) -> f64 {
        if self.initial_cash == 0.0 {
            return 0.0;
        }
        self.total_pnl / self.initial_cash * 100.0
    }
}

/// Result of applying an order to the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderOutcome {
    Filled(Trade),
    /// A sell larger than the slot's holding. Nothing was changed.
    InsufficientPosition { requested: i64, held: i64 },
}

/// Single source of truth for one run's money and holdings.
///
/// Not synchronised; the owning driver is the only writer.
#[derive(Debug, Clone, PartialEq)]
pub struct Ledger {
    run_id: String,
    initial_cash: f64,
    cash: f64,
    positions: BTreeMap<Slot, Position>,
    position_capital: BTreeMap<Slot, f64>,
    trades: Vec<Trade>,
    equity_curve: Vec<EquityPoint>,
}

impl Ledger {
    pub fn new(run_id: impl Into<String>, initial_cash: f64) -> Self {
        Ledger {
            run_id: run_id.into(),
            initial_cash,
            cash: initial_cash,
            positions: BTreeMap::new(),
            position_capital: BTreeMap::new(),
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn initial_cash(&self) -> f64 {
        self.initial_cash
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    pub fn positions(&self) -> &BTreeMap<Slot, Position> {
        &self.positions
    }

    pub fn position(&self, slot: &Slot) -> Option<&Position> {
        self.positions.get(slot)
    }

    pub fn quantity(&self, slot: &Slot) -> i64 {
        self.positions.get(slot).map_or(0, |p| p.quantity)
    }

    /// Apply a fill. Buys always succeed; sells need enough holding in the slot.
    pub fn execute_order(
        &mut self,
        slot: &Slot,
        action: TradeAction,
        quantity: i64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> OrderOutcome {
        match action {
            TradeAction::Buy => {
                self.positions
                    .entry(slot.clone())
                    .or_insert(Position {
                        quantity: 0,
                        avg_price: 0.0,
                    })
                    .add(quantity, price);
            }
            TradeAction::Sell => {
                let held = self.quantity(slot);
                if held < quantity {
                    return OrderOutcome::InsufficientPosition {
                        requested: quantity,
                        held,
                    };
                }
                if let Some(pos) = self.positions.get_mut(slot) {
                    let realized = (price - pos.avg_price) * quantity as f64;
                    pos.quantity -= quantity;
                    if pos.quantity == 0 {
                        self.positions.remove(slot);
                    }
                    if let Some(capital) = self.position_capital.get_mut(slot) {
                        *capital += realized;
                    }
                    debug!(slot = %slot, realized, "realized pnl");
                }
            }
        }

        self.cash -= (action.sign() * quantity) as f64 * price;
        let trade = Trade {
            timestamp,
            symbol: slot.symbol.clone(),
            timeframe: slot.timeframe,
            action,
            quantity,
            price,
            run_id: self.run_id.clone(),
        };
        info!(
            slot = %slot,
            action = %action,
            quantity,
            price,
            timestamp = %timestamp,
            cash = self.cash,
            "trade executed"
        );
        self.trades.push(trade.clone());
        OrderOutcome::Filled(trade)
    }

    /// Compounding allocation for a slot, seeded with `default` on first use.
    pub fn capital_for_slot(&mut self, slot: &Slot, default: f64) -> f64 {
        *self
            .position_capital
            .entry(slot.clone())
            .or_insert(default)
    }

    /// Mark-to-market value of all holdings, falling back to the average entry
    /// price for symbols without a known price.
    pub fn holdings_value(&self, prices: &PriceMap) -> f64 {
        self.positions
            .iter()
            .map(|(slot, pos)| {
                let price = prices.get(&slot.symbol).copied().unwrap_or(pos.avg_price);
                pos.market_value(price)
            })
            .sum()
    }

    pub fn record_equity_snapshot(&mut self, timestamp: DateTime<Utc>, prices: &PriceMap) -> &EquityPoint {
        let holdings = self.holdings_value(prices);
        self.equity_curve.push(EquityPoint {
            timestamp,
            total: self.cash + holdings,
            cash: self.cash,
            holdings,
        });
        &self.equity_curve[self.equity_curve.len() - 1]
    }

    pub fn performance_summary(&self, prices: &PriceMap) -> PerformanceSummary {
        let holdings = self.holdings_value(prices);
        let total = self.cash + holdings;
        let unrealized_pnl: f64 = self
            .positions
            .iter()
            .map(|(slot, pos)| {
                let price = prices.get(&slot.symbol).copied().unwrap_or(pos.avg_price);
                pos.unrealized_pnl(price)
            })
            .sum();
        let total_pnl = total - self.initial_cash;
        PerformanceSummary {
            initial_cash: self.initial_cash,
            cash: self.cash,
            holdings,
            total,
            total_pnl,
            realized_pnl: total_pnl - unrealized_pnl,
            unrealized_pnl,
            trade_count: self.trades.len(),
        }
    }

    /// Read-only handle for strategies.
    pub fn view(&self, default_trade_value: f64) -> LedgerView<'_> {
        LedgerView {
            ledger: self,
            default_trade_value,
        }
    }
}

/// What a strategy may see of the ledger. Capital lookups never initialise a slot.
#[derive(Debug, Clone, Copy)]
pub struct LedgerView<'a> {
    ledger: &'a Ledger,
    default_trade_value: f64,
}

impl<'a> LedgerView<'a> {
    pub fn cash(&self) -> f64 {
        self.ledger.cash
    }

    pub fn position(&self, slot: &Slot) -> Option<&'a Position> {
        self.ledger.positions.get(slot)
    }

    pub fn quantity(&self, slot: &Slot) -> i64 {
        self.ledger.quantity(slot)
    }

    pub fn positions(&self) -> &'a BTreeMap<Slot, Position> {
        &self.ledger.positions
    }

    pub fn capital_for_slot(&self, slot: &Slot) -> f64 {
        self.ledger
            .position_capital
            .get(slot)
            .copied()
            .unwrap_or(self.default_trade_value)
    }

    pub fn default_trade_value(&self) -> f64 {
        self.default_trade_value
    }
}
