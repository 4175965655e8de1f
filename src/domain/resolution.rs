//! Bar resolutions (timeframes) and bucket arithmetic.

use chrono::{DateTime, Duration, Utc};
use std::fmt;
use std::str::FromStr;

use super::error::BarsimError;

/// Width of the time bucket a bar summarises.
///
/// Ordering puts finer resolutions first, so `Minutes(1) < Minutes(15) < Daily`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    Minutes(u32),
    Daily,
}

impl Resolution {
    pub const ONE_MINUTE: Resolution = Resolution::Minutes(1);

    pub fn period(&self) -> Duration {
        match self {
            Resolution::Minutes(m) => Duration::minutes(i64::from(*m)),
            Resolution::Daily => Duration::days(1),
        }
    }

    fn period_secs(&self) -> i64 {
        self.period().num_seconds()
    }

    pub fn is_intraday(&self) -> bool {
        matches!(self, Resolution::Minutes(_))
    }

    /// Index of the bucket containing `ts`, counted from the Unix epoch.
    pub fn bucket_index(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.period_secs())
    }

    /// `ts` truncated to the start of its bucket.
    pub fn bucket_start(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let start = secs - secs.rem_euclid(self.period_secs());
        DateTime::from_timestamp(start, 0).unwrap_or(ts)
    }

    /// Number of `finer` bars that make up one bar of `self`, when `self` is an
    /// exact multiple of `finer`.
    pub fn multiple_of(&self, finer: Resolution) -> Option<u32> {
        let coarse = self.period_secs();
        let fine = finer.period_secs();
        if coarse <= fine || coarse % fine != 0 {
            return None;
        }
        u32::try_from(coarse / fine).ok()
    }

    /// How far back to load before a run's start so indicators have context.
    pub fn load_lookback(&self) -> Duration {
        match self {
            Resolution::Daily => Duration::days(365),
            Resolution::Minutes(_) => Duration::days(30),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Minutes(m) => write!(f, "{m}"),
            Resolution::Daily => write!(f, "D"),
        }
    }
}

impl FromStr for Resolution {
    type Err = BarsimError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match trimmed.to_uppercase().as_str() {
            "D" | "1D" | "DAY" | "DAILY" => Ok(Resolution::Daily),
            other => match other.parse::<u32>() {
                Ok(m) if m > 0 => Ok(Resolution::Minutes(m)),
                _ => Err(BarsimError::UnknownResolution(trimmed.to_string())),
            },
        }
    }
}

/// Parse a comma-separated resolution list such as `"15, D, 1"`.
pub fn parse_resolutions(list: &str) -> Result<Vec<Resolution>, BarsimError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}
