//! Strategy seam and the per-timeframe registry that shares one ledger.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::collections::btree_map::{IterMut, Values};

use super::error::BarsimError;
use super::execution::TradeIntent;
use super::ledger::LedgerView;
use super::packet::{DataPacket, PacketLayout};
use super::resolution::Resolution;

/// A decision algorithm. Reads bars and the ledger, returns intents.
///
/// Strategies never mutate the ledger; the driver routes their intents through
/// the order simulator.
pub trait Strategy: Send {
    fn name(&self) -> &str;

    /// Timeframe whose completed bars trigger [`Strategy::on_data`].
    fn primary_resolution(&self) -> Resolution;

    /// Every resolution the strategy reads, primary included.
    fn required_resolutions(&self) -> Vec<Resolution> {
        vec![self.primary_resolution()]
    }

    /// Finer resolution the strategy wants as the bars inside each primary
    /// bar. `None` defers to the run's configured auxiliary resolution.
    fn auxiliary_resolution(&self) -> Option<Resolution> {
        None
    }

    fn on_data(
        &mut self,
        ledger: &LedgerView<'_>,
        timestamp: DateTime<Utc>,
        packet: &DataPacket<'_>,
        is_live: bool,
    ) -> Vec<TradeIntent>;
}

/// Timeframe → strategy. One strategy per timeframe.
#[derive(Default)]
pub struct StrategyRegistry {
    strategies: BTreeMap<Resolution, Box<dyn Strategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Box<dyn Strategy>) -> Result<(), BarsimError> {
        let timeframe = strategy.primary_resolution();
        if self.strategies.contains_key(&timeframe) {
            return Err(BarsimError::ConfigInvalid {
                section: "strategy".into(),
                key: "timeframes".into(),
                reason: format!("more than one strategy on timeframe {timeframe}"),
            });
        }
        self.strategies.insert(timeframe, strategy);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn timeframes(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.strategies.keys().copied()
    }

    pub fn get_mut(&mut self, timeframe: Resolution) -> Option<&mut (dyn Strategy + 'static)> {
        self.strategies.get_mut(&timeframe).map(|s| s.as_mut())
    }

    pub fn iter_mut(&mut self) -> IterMut<'_, Resolution, Box<dyn Strategy>> {
        self.strategies.iter_mut()
    }

    pub fn strategies(&self) -> Values<'_, Resolution, Box<dyn Strategy>> {
        self.strategies.values()
    }

    /// Union of every strategy's required resolutions, finest first.
    pub fn required_resolutions(&self) -> Vec<Resolution> {
        let mut all: Vec<Resolution> = self
            .strategies
            .values()
            .flat_map(|s| s.required_resolutions())
            .collect();
        all.sort();
        all.dedup();
        all
    }

    /// Packet layout for each registered timeframe.
    pub fn layouts(&self, auxiliary: Option<Resolution>) -> BTreeMap<Resolution, PacketLayout> {
        self.strategies
            .iter()
            .map(|(tf, s)| {
                let aux = s.auxiliary_resolution().or(auxiliary);
                (*tf, PacketLayout::new(*tf, &s.required_resolutions(), aux))
            })
            .collect()
    }

    /// Names joined for run ids and logs.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.strategies.values().map(|s| s.name().to_string()).collect();
        names.dedup();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle(Resolution, Vec<Resolution>);

    impl Strategy for Idle {
        fn name(&self) -> &str {
            "Idle"
        }

        fn primary_resolution(&self) -> Resolution {
            self.0
        }

        fn required_resolutions(&self) -> Vec<Resolution> {
            self.1.clone()
        }

        fn on_data(
            &mut self,
            _ledger: &LedgerView<'_>,
            _timestamp: DateTime<Utc>,
            _packet: &DataPacket<'_>,
            _is_live: bool,
        ) -> Vec<TradeIntent> {
            Vec::new()
        }
    }

    #[test]
    fn one_strategy_per_timeframe() {
        let mut registry = StrategyRegistry::new();
        registry
            .register(Box::new(Idle(Resolution::Minutes(15), vec![Resolution::Minutes(15)])))
            .unwrap();
        assert!(registry
            .register(Box::new(Idle(Resolution::Minutes(15), vec![])))
            .is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn required_resolutions_are_merged() {
        let mut registry = StrategyRegistry::new();
        registry
            .register(Box::new(Idle(
                Resolution::Minutes(15),
                vec![Resolution::Minutes(15), Resolution::Daily],
            )))
            .unwrap();
        registry
            .register(Box::new(Idle(
                Resolution::Minutes(5),
                vec![Resolution::Minutes(5), Resolution::Daily],
            )))
            .unwrap();
        assert_eq!(
            registry.required_resolutions(),
            vec![Resolution::Minutes(5), Resolution::Minutes(15), Resolution::Daily]
        );
        assert_eq!(
            registry.timeframes().collect::<Vec<_>>(),
            vec![Resolution::Minutes(5), Resolution::Minutes(15)]
        );
        assert_eq!(registry.names(), vec!["Idle".to_string()]);
    }
}
