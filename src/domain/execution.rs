//! Order execution simulation: validates trade intents and applies them to the ledger.
//!
//! Checks run in a fixed order: shape validation, lot-size rounding, the
//! zero-quantity drop, the long-only guard, then the fill. Fills happen at the
//! intent's own price.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::error::BarsimError;
use super::ledger::{Ledger, OrderOutcome};
use super::position::{Slot, Trade, TradeAction};
use super::resolution::Resolution;
use crate::ports::metadata_port::SymbolMetadata;

/// A strategy's request to trade. Never applied directly; goes through
/// [`OrderSimulator::submit`].
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub symbol: String,
    pub timeframe: Resolution,
    pub action: TradeAction,
    pub quantity: i64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl TradeIntent {
    pub fn buy(
        symbol: impl Into<String>,
        timeframe: Resolution,
        quantity: i64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TradeIntent {
            symbol: symbol.into(),
            timeframe,
            action: TradeAction::Buy,
            quantity,
            price,
            timestamp,
        }
    }

    pub fn sell(
        symbol: impl Into<String>,
        timeframe: Resolution,
        quantity: i64,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        TradeIntent {
            action: TradeAction::Sell,
            ..TradeIntent::buy(symbol, timeframe, quantity, price, timestamp)
        }
    }

    pub fn slot(&self) -> Slot {
        Slot::new(self.symbol.clone(), self.timeframe)
    }
}

/// What to do with a sell larger than the slot's holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SellPolicy {
    /// Log and ignore.
    #[default]
    Lenient,
    /// Fail the run with [`BarsimError::InsufficientPosition`].
    Strict,
}

impl FromStr for SellPolicy {
    type Err = BarsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "lenient" => Ok(SellPolicy::Lenient),
            "strict" => Ok(SellPolicy::Strict),
            other => Err(BarsimError::ConfigInvalid {
                section: "execution".into(),
                key: "sell_policy".into(),
                reason: format!("expected lenient or strict, got '{other}'"),
            }),
        }
    }
}

/// Why an intent was not applied. None of these change the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    ZeroQuantityAfterRounding { requested: i64, lot_size: i64 },
    NoPosition,
    InsufficientPosition { requested: i64, held: i64 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::ZeroQuantityAfterRounding {
                requested,
                lot_size,
            } => write!(f, "quantity {requested} rounds to zero with lot size {lot_size}"),
            Rejection::NoPosition => write!(f, "no open position to sell"),
            Rejection::InsufficientPosition { requested, held } => {
                write!(f, "requested {requested}, held {held}")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Applied(Trade),
    Rejected(Rejection),
}

impl SubmitOutcome {
    pub fn trade(&self) -> Option<&Trade> {
        match self {
            SubmitOutcome::Applied(trade) => Some(trade),
            SubmitOutcome::Rejected(_) => None,
        }
    }
}

/// Applies intents to a ledger it does not own.
#[derive(Clone)]
pub struct OrderSimulator {
    metadata: Arc<dyn SymbolMetadata>,
    sell_policy: SellPolicy,
    default_trade_value: f64,
}

impl fmt::Debug for OrderSimulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderSimulator")
            .field("sell_policy", &self.sell_policy)
            .field("default_trade_value", &self.default_trade_value)
            .finish_non_exhaustive()
    }
}

impl OrderSimulator {
    pub fn new(metadata: Arc<dyn SymbolMetadata>, sell_policy: SellPolicy, default_trade_value: f64) -> Self {
        OrderSimulator {
            metadata,
            sell_policy,
            default_trade_value,
        }
    }

    pub fn sell_policy(&self) -> SellPolicy {
        self.sell_policy
    }

    pub fn default_trade_value(&self) -> f64 {
        self.default_trade_value
    }

    pub fn submit(&self, ledger: &mut Ledger, intent: &TradeIntent) -> Result<SubmitOutcome, BarsimError> {
        validate(intent)?;

        let lot_size = self.metadata.lot_size(&intent.symbol)?.max(1);
        let quantity = (intent.quantity / lot_size) * lot_size;
        if quantity == 0 {
            debug!(
                symbol = %intent.symbol,
                timeframe = %intent.timeframe,
                requested = intent.quantity,
                lot_size,
                "dropping order below one lot"
            );
            return Ok(SubmitOutcome::Rejected(Rejection::ZeroQuantityAfterRounding {
                requested: intent.quantity,
                lot_size,
            }));
        }

        let slot = intent.slot();
        let held = ledger.quantity(&slot);
        if intent.action == TradeAction::Sell && held <= 0 {
            return self.reject_sell(intent, Rejection::NoPosition, quantity, held);
        }

        if intent.action == TradeAction::Buy {
            ledger.capital_for_slot(&slot, self.default_trade_value);
        }

        match ledger.execute_order(&slot, intent.action, quantity, intent.price, intent.timestamp) {
            OrderOutcome::Filled(trade) => Ok(SubmitOutcome::Applied(trade)),
            OrderOutcome::InsufficientPosition { requested, held } => self.reject_sell(
                intent,
                Rejection::InsufficientPosition { requested, held },
                requested,
                held,
            ),
        }
    }

    fn reject_sell(
        &self,
        intent: &TradeIntent,
        rejection: Rejection,
        requested: i64,
        held: i64,
    ) -> Result<SubmitOutcome, BarsimError> {
        warn!(
            symbol = %intent.symbol,
            timeframe = %intent.timeframe,
            timestamp = %intent.timestamp,
            reason = %rejection,
            "sell rejected"
        );
        match self.sell_policy {
            SellPolicy::Lenient => Ok(SubmitOutcome::Rejected(rejection)),
            SellPolicy::Strict => Err(BarsimError::InsufficientPosition {
                symbol: intent.symbol.clone(),
                timeframe: intent.timeframe.to_string(),
                requested,
                held,
            }),
        }
    }
}

fn validate(intent: &TradeIntent) -> Result<(), BarsimError> {
    let reason = if intent.symbol.trim().is_empty() {
        Some("empty symbol".to_string())
    } else if intent.quantity <= 0 {
        Some(format!("non-positive quantity {}", intent.quantity))
    } else if !intent.price.is_finite() || intent.price <= 0.0 {
        Some(format!("invalid price {}", intent.price))
    } else {
        None
    };
    match reason {
        Some(reason) => {
            warn!(
                symbol = %intent.symbol,
                timeframe = %intent.timeframe,
                timestamp = %intent.timestamp,
                reason = %reason,
                "malformed intent"
            );
            Err(BarsimError::MalformedIntent { reason })
        }
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    struct FixedLots(i64);

    impl SymbolMetadata for FixedLots {
        fn lot_size(&self, _symbol: &str) -> Result<i64, BarsimError> {
            Ok(self.0)
        }
    }

    struct Unloaded;

    impl SymbolMetadata for Unloaded {
        fn lot_size(&self, _symbol: &str) -> Result<i64, BarsimError> {
            Err(BarsimError::MetadataNotLoaded)
        }
    }

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap()
    }

    fn simulator(lot: i64, policy: SellPolicy) -> OrderSimulator {
        OrderSimulator::new(Arc::new(FixedLots(lot)), policy, 10_000.0)
    }

    const TF: Resolution = Resolution::Minutes(15);

    #[test]
    fn rounds_down_to_lot() {
        let sim = simulator(50, SellPolicy::Lenient);
        let mut ledger = Ledger::new("run", 100_000.0);
        let outcome = sim.submit(&mut ledger, &TradeIntent::buy("X", TF, 120, 10.0, ts())).unwrap();
        assert_eq!(outcome.trade().unwrap().quantity, 100);
        assert_eq!(ledger.quantity(&Slot::new("X", TF)), 100);
    }

    #[test]
    fn below_one_lot_is_dropped() {
        let sim = simulator(50, SellPolicy::Lenient);
        let mut ledger = Ledger::new("run", 100_000.0);
        let outcome = sim.submit(&mut ledger, &TradeIntent::buy("X", TF, 40, 10.0, ts())).unwrap();
        assert_eq!(
            outcome,
            SubmitOutcome::Rejected(Rejection::ZeroQuantityAfterRounding {
                requested: 40,
                lot_size: 50
            })
        );
        assert!(ledger.trades().is_empty());
    }

    #[test]
    fn sell_without_position_is_rejected() {
        let sim = simulator(1, SellPolicy::Lenient);
        let mut ledger = Ledger::new("run", 100_000.0);
        let outcome = sim.submit(&mut ledger, &TradeIntent::sell("X", TF, 10, 10.0, ts())).unwrap();
        assert_eq!(outcome, SubmitOutcome::Rejected(Rejection::NoPosition));
        assert!((ledger.cash() - 100_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn strict_policy_turns_oversized_sell_into_error() {
        let sim = simulator(1, SellPolicy::Strict);
        let mut ledger = Ledger::new("run", 100_000.0);
        sim.submit(&mut ledger, &TradeIntent::buy("X", TF, 10, 10.0, ts())).unwrap();
        let err = sim
            .submit(&mut ledger, &TradeIntent::sell("X", TF, 20, 10.0, ts()))
            .unwrap_err();
        assert!(matches!(
            err,
            BarsimError::InsufficientPosition {
                requested: 20,
                held: 10,
                ..
            }
        ));
        assert_eq!(ledger.quantity(&Slot::new("X", TF)), 10);
    }

    #[test]
    fn malformed_intents_are_errors() {
        let sim = simulator(1, SellPolicy::Lenient);
        let mut ledger = Ledger::new("run", 100_000.0);
        for intent in [
            TradeIntent::buy("", TF, 10, 10.0, ts()),
            TradeIntent::buy("X", TF, 0, 10.0, ts()),
            TradeIntent::buy("X", TF, -5, 10.0, ts()),
            TradeIntent::buy("X", TF, 10, f64::INFINITY, ts()),
            TradeIntent::buy("X", TF, 10, 0.0, ts()),
        ] {
            assert!(matches!(
                sim.submit(&mut ledger, &intent),
                Err(BarsimError::MalformedIntent { .. })
            ));
        }
        assert!(ledger.trades().is_empty());
    }

    #[test]
    fn fills_at_intent_price_and_seeds_slot_capital() {
        let sim = simulator(1, SellPolicy::Lenient);
        let mut ledger = Ledger::new("run", 100_000.0);
        sim.submit(&mut ledger, &TradeIntent::buy("X", TF, 10, 123.45, ts())).unwrap();
        assert!((ledger.trades()[0].price - 123.45).abs() < f64::EPSILON);
        assert!((ledger.view(0.0).capital_for_slot(&Slot::new("X", TF)) - 10_000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn unloaded_metadata_is_an_error() {
        let sim = OrderSimulator::new(Arc::new(Unloaded), SellPolicy::Lenient, 0.0);
        let mut ledger = Ledger::new("run", 1_000.0);
        assert!(matches!(
            sim.submit(&mut ledger, &TradeIntent::buy("X", TF, 1, 1.0, ts())),
            Err(BarsimError::MetadataNotLoaded)
        ));
    }

    #[test]
    fn sell_policy_parsing() {
        assert_eq!("Strict".parse::<SellPolicy>().unwrap(), SellPolicy::Strict);
        assert_eq!("lenient".parse::<SellPolicy>().unwrap(), SellPolicy::Lenient);
        assert!("yolo".parse::<SellPolicy>().is_err());
    }
}
