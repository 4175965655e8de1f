//! Lot-size lookup loaded from a `symbol,lot_size` CSV file.

use crate::domain::error::BarsimError;
use crate::ports::metadata_port::SymbolMetadata;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct LotRow {
    symbol: String,
    lot_size: i64,
}

/// Symbol metadata. Lookups fail until [`SymbolMaster::load`] or
/// [`SymbolMaster::from_lots`] has populated it.
#[derive(Debug, Default)]
pub struct SymbolMaster {
    lots: Option<BTreeMap<String, i64>>,
}

impl SymbolMaster {
    pub fn unloaded() -> Self {
        Self::default()
    }

    pub fn from_lots<I, S>(lots: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<String>,
    {
        Self {
            lots: Some(lots.into_iter().map(|(s, l)| (s.into(), l)).collect()),
        }
    }

    pub fn load(path: &Path) -> Result<Self, BarsimError> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut lots = BTreeMap::new();
        for row in rdr.deserialize::<LotRow>() {
            let row = row?;
            if row.lot_size < 1 {
                warn!(symbol = %row.symbol, lot_size = row.lot_size, "ignoring non-positive lot size");
                continue;
            }
            lots.insert(row.symbol, row.lot_size);
        }
        info!(path = %path.display(), symbols = lots.len(), "loaded symbol master");
        Ok(Self { lots: Some(lots) })
    }

    pub fn is_loaded(&self) -> bool {
        self.lots.is_some()
    }

    pub fn len(&self) -> usize {
        self.lots.as_ref().map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SymbolMetadata for SymbolMaster {
    fn lot_size(&self, symbol: &str) -> Result<i64, BarsimError> {
        let lots = self.lots.as_ref().ok_or(BarsimError::MetadataNotLoaded)?;
        Ok(lots.get(symbol).copied().unwrap_or(1))
    }
}
