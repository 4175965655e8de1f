//! Multi-resolution bar packets handed to strategies.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use super::bar::Bar;
use super::bar_history::BarHistoryStore;
use super::resolution::Resolution;

/// How one resolution is presented for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResolutionView<'a> {
    /// Ordered bars, oldest first.
    Series(&'a [Bar]),
    /// The most recent bar that had closed when the primary bar closed.
    Latest(&'a Bar),
}

impl<'a> ResolutionView<'a> {
    pub fn latest(&self) -> Option<&'a Bar> {
        match self {
            ResolutionView::Series(bars) => bars.last(),
            ResolutionView::Latest(bar) => Some(bar),
        }
    }

    pub fn bars(&self) -> &'a [Bar] {
        match self {
            ResolutionView::Series(bars) => bars,
            ResolutionView::Latest(bar) => std::slice::from_ref(*bar),
        }
    }
}

/// Resolution → symbol → view, borrowed from the driver's history stores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataPacket<'a> {
    frames: BTreeMap<Resolution, BTreeMap<String, ResolutionView<'a>>>,
}

impl<'a> DataPacket<'a> {
    pub fn insert(&mut self, resolution: Resolution, symbol: &str, view: ResolutionView<'a>) {
        self.frames
            .entry(resolution)
            .or_default()
            .insert(symbol.to_string(), view);
    }

    pub fn get(&self, resolution: Resolution, symbol: &str) -> Option<&ResolutionView<'a>> {
        self.frames.get(&resolution)?.get(symbol)
    }

    pub fn series(&self, resolution: Resolution, symbol: &str) -> &'a [Bar] {
        self.get(resolution, symbol).map_or(&[], |v| v.bars())
    }

    pub fn latest(&self, resolution: Resolution, symbol: &str) -> Option<&'a Bar> {
        self.get(resolution, symbol).and_then(|v| v.latest())
    }

    pub fn symbols(&self, resolution: Resolution) -> impl Iterator<Item = &str> {
        self.frames
            .get(&resolution)
            .into_iter()
            .flat_map(|m| m.keys().map(String::as_str))
    }

    pub fn resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        self.frames.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.values().all(BTreeMap::is_empty)
    }
}

/// Which resolutions a strategy sees, and in which role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketLayout {
    pub primary: Resolution,
    /// Finer resolution delivered as the bars inside the current primary bar.
    pub auxiliary: Option<Resolution>,
    pub secondary: Vec<Resolution>,
}

impl PacketLayout {
    /// `auxiliary` only applies when it is one of the required resolutions
    /// and finer than `primary`.
    pub fn new(primary: Resolution, required: &[Resolution], auxiliary: Option<Resolution>) -> Self {
        let mut secondary: Vec<Resolution> =
            required.iter().copied().filter(|r| *r != primary).collect();
        secondary.sort();
        secondary.dedup();
        let auxiliary = auxiliary.filter(|a| *a < primary && secondary.contains(a));
        PacketLayout {
            primary,
            auxiliary,
            secondary,
        }
    }

    pub fn resolutions(&self) -> impl Iterator<Item = Resolution> + '_ {
        std::iter::once(self.primary).chain(self.secondary.iter().copied())
    }

    /// Assemble the packet for the primary bar stamped `at`.
    ///
    /// Secondary bars are only visible once closed: a coarser bar still open
    /// when the primary bar closes is left out, and the previous one is used.
    pub fn build<'a>(&self, symbols: &[String], store: &'a BarHistoryStore, at: DateTime<Utc>) -> DataPacket<'a> {
        let closes_at = at + self.primary.period();
        let mut packet = DataPacket::default();
        for symbol in symbols {
            let history = store.history(symbol, self.primary);
            if !history.is_empty() {
                packet.insert(self.primary, symbol, ResolutionView::Series(history));
            }
            for res in &self.secondary {
                if Some(*res) == self.auxiliary {
                    let bars = store.range(symbol, *res, at, closes_at);
                    if !bars.is_empty() {
                        packet.insert(*res, symbol, ResolutionView::Series(bars));
                    }
                } else if let Some(bar) = store.latest_closed_by(symbol, *res, closes_at) {
                    packet.insert(*res, symbol, ResolutionView::Latest(bar));
                }
            }
        }
        packet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 9, 15, 0).unwrap()
    }

    fn bar(res: Resolution, ts: DateTime<Utc>, close: f64) -> Bar {
        Bar {
            timestamp: ts,
            symbol: "X".into(),
            resolution: res,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0,
        }
    }

    #[test]
    fn layout_roles() {
        let layout = PacketLayout::new(
            Resolution::Minutes(15),
            &[Resolution::Minutes(15), Resolution::Daily, Resolution::ONE_MINUTE],
            Some(Resolution::ONE_MINUTE),
        );
        assert_eq!(layout.secondary, vec![Resolution::ONE_MINUTE, Resolution::Daily]);
        assert_eq!(layout.auxiliary, Some(Resolution::ONE_MINUTE));

        let coarse_aux = PacketLayout::new(
            Resolution::Minutes(15),
            &[Resolution::Daily],
            Some(Resolution::Daily),
        );
        assert_eq!(coarse_aux.auxiliary, None);
    }

    #[test]
    fn build_assigns_views_by_role() {
        let m15 = Resolution::Minutes(15);
        let mut store = BarHistoryStore::new();
        store.append(bar(m15, t0() - Duration::minutes(15), 99.0));
        store.append(bar(m15, t0(), 100.0));
        for i in -5..20 {
            store.append(bar(Resolution::ONE_MINUTE, t0() + Duration::minutes(i), 100.0 + i as f64));
        }
        let midnight = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
        store.append(bar(Resolution::Daily, midnight - Duration::days(1), 90.0));
        store.append(bar(Resolution::Daily, midnight, 95.0));

        let layout = PacketLayout::new(
            m15,
            &[Resolution::ONE_MINUTE, Resolution::Daily],
            Some(Resolution::ONE_MINUTE),
        );
        let packet = layout.build(&["X".to_string()], &store, t0());

        assert_eq!(packet.series(m15, "X").len(), 2);
        let minutes = packet.series(Resolution::ONE_MINUTE, "X");
        assert_eq!(minutes.len(), 15);
        assert_eq!(minutes[0].timestamp, t0());
        // Today's daily bar is still open.
        assert!(matches!(
            packet.get(Resolution::Daily, "X"),
            Some(ResolutionView::Latest(b)) if b.close == 90.0
        ));
        assert!(packet.get(m15, "Y").is_none());
    }

    #[test]
    fn coarser_bar_hidden_until_closed() {
        let m15 = Resolution::Minutes(15);
        let m60 = Resolution::Minutes(60);
        let mut store = BarHistoryStore::new();
        store.append(bar(m60, t0() - Duration::minutes(60), 50.0));
        store.append(bar(m60, t0(), 999.0));
        for i in 0..4 {
            store.append(bar(m15, t0() + Duration::minutes(15 * i), 100.0));
        }
        let layout = PacketLayout::new(m15, &[m60], None);

        for i in 0..3 {
            let at = t0() + Duration::minutes(15 * i);
            let packet = layout.build(&["X".to_string()], &store, at);
            assert_eq!(packet.latest(m60, "X").map(|b| b.close), Some(50.0));
        }
        let last = layout.build(&["X".to_string()], &store, t0() + Duration::minutes(45));
        assert_eq!(last.latest(m60, "X").map(|b| b.close), Some(999.0));
    }
}
