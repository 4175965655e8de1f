//! Configuration validation.
//!
//! Validates every config section before a run starts. The parse helpers are
//! shared with the CLI, which builds the typed configs from the same values.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::domain::error::BarsimError;
use crate::domain::execution::SellPolicy;
use crate::domain::resolution::{parse_resolutions, Resolution};
use crate::domain::session::TradingMode;
use crate::ports::config_port::ConfigPort;

pub const KNOWN_STRATEGIES: &[&str] = &["sma_crossover", "opening_price_crossover"];

pub fn validate_backtest_config(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    validate_initial_cash(config)?;
    validate_dates(config)?;
    validate_symbols(config)?;
    validate_resolutions(config)?;
    validate_mode(config)?;
    validate_positive_int(config, "backtest", "warmup_depth", 100)?;
    validate_positive_int(config, "backtest", "load_attempts", 3)?;
    if config.get_string("backtest", "max_history").is_some() {
        validate_positive_int(config, "backtest", "max_history", 1)?;
    }
    Ok(())
}

/// Streaming sessions share `[backtest]` symbols and resolutions but have no
/// date window.
pub fn validate_stream_config(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    validate_initial_cash(config)?;
    validate_symbols(config)?;
    validate_resolutions(config)?;
    validate_mode(config)?;
    validate_positive_int(config, "backtest", "warmup_depth", 100)?;
    validate_live_config(config)
}

pub fn validate_session_config(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    let entry_start = time_or(config, "entry_start", "09:15")?;
    let entry_end = time_or(config, "entry_end", "15:30")?;
    if entry_start > entry_end {
        return Err(invalid("session", "entry_start", "entry_start must not be after entry_end"));
    }
    let open = time_or(config, "market_open", "09:15")?;
    let close = time_or(config, "market_close", "15:30")?;
    if open >= close {
        return Err(invalid("session", "market_open", "market_open must be before market_close"));
    }
    let offset = config.get_int("session", "utc_offset_minutes", 330);
    if offset.abs() > 14 * 60 {
        return Err(invalid("session", "utc_offset_minutes", "offset must be within +/-14 hours"));
    }
    let buffer = config.get_int("session", "exit_buffer_minutes", 16);
    if buffer < 0 {
        return Err(invalid("session", "exit_buffer_minutes", "exit_buffer_minutes must be non-negative"));
    }
    if let Some(list) = config.get_string("session", "holidays") {
        parse_holidays(&list)?;
    }
    Ok(())
}

pub fn validate_execution_config(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    if let Some(policy) = config.get_string("execution", "sell_policy") {
        policy.parse::<SellPolicy>()?;
    }
    let value = config.get_double("execution", "default_trade_value", 10_000.0);
    if value <= 0.0 {
        return Err(invalid("execution", "default_trade_value", "default_trade_value must be positive"));
    }
    Ok(())
}

pub fn validate_strategy_config(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    let name = config.get_string("strategy", "name").unwrap_or_else(|| "sma_crossover".into());
    if !KNOWN_STRATEGIES.contains(&name.trim()) {
        return Err(invalid(
            "strategy",
            "name",
            &format!("unknown strategy '{}', expected one of {}", name.trim(), KNOWN_STRATEGIES.join(", ")),
        ));
    }
    let (lookback_key, lookback) = match name.trim() {
        "opening_price_crossover" => validate_opening_price_params(config)?,
        _ => validate_sma_params(config)?,
    };
    let depth = config.get_int("backtest", "warmup_depth", 100);
    if lookback > depth {
        return Err(invalid(
            "strategy",
            lookback_key,
            &format!("{lookback_key} {lookback} exceeds [backtest] warmup_depth {depth}"),
        ));
    }
    if let Some(list) = config.get_string("strategy", "timeframes") {
        let timeframes = resolutions_for(&list, "strategy", "timeframes")?;
        if timeframes.is_empty() {
            return Err(invalid("strategy", "timeframes", "at least one timeframe is required"));
        }
    }
    Ok(())
}

/// Returns the key and value of the longest lookback.
fn validate_sma_params(config: &dyn ConfigPort) -> Result<(&'static str, i64), BarsimError> {
    let short = config.get_int("strategy", "short_window", 5);
    if short < 1 {
        return Err(invalid("strategy", "short_window", "short_window must be at least 1"));
    }
    let long = config.get_int("strategy", "long_window", 20);
    if long <= short {
        return Err(invalid("strategy", "long_window", "long_window must be greater than short_window"));
    }
    Ok(("long_window", long))
}

fn validate_opening_price_params(config: &dyn ConfigPort) -> Result<(&'static str, i64), BarsimError> {
    let fast = config.get_int("strategy", "ema_fast", 9);
    if fast < 1 {
        return Err(invalid("strategy", "ema_fast", "ema_fast must be at least 1"));
    }
    let slow = config.get_int("strategy", "ema_slow", 21);
    if slow <= fast {
        return Err(invalid("strategy", "ema_slow", "ema_slow must be greater than ema_fast"));
    }
    validate_positive_int(config, "strategy", "atr_period", 14)?;
    validate_positive_int(config, "strategy", "spike_window", 10)?;
    if config.get_double("strategy", "atr_multiplier", 1.5) <= 0.0 {
        return Err(invalid("strategy", "atr_multiplier", "atr_multiplier must be positive"));
    }
    Ok(("ema_slow", slow))
}

pub fn validate_live_config(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    validate_positive_int(config, "live", "max_history", 500)?;
    if config.get_int("live", "disconnect_timeout_ms", 5_000) < 0 {
        return Err(invalid("live", "disconnect_timeout_ms", "disconnect_timeout_ms must be non-negative"));
    }
    Ok(())
}

fn validate_initial_cash(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    let value = config.get_double("backtest", "initial_cash", 0.0);
    if value <= 0.0 {
        return Err(invalid("backtest", "initial_cash", "initial_cash must be positive"));
    }
    Ok(())
}

fn validate_dates(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    let start = parse_datetime(config.get_string("backtest", "start").as_deref(), "start", false)?;
    let end = parse_datetime(config.get_string("backtest", "end").as_deref(), "end", true)?;
    if start >= end {
        return Err(invalid("backtest", "start", "start must be before end"));
    }
    Ok(())
}

fn validate_symbols(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    match config.get_string("backtest", "symbols") {
        Some(s) if !parse_list(&s).is_empty() => Ok(()),
        _ => Err(BarsimError::ConfigMissing {
            section: "backtest".to_string(),
            key: "symbols".to_string(),
        }),
    }
}

fn validate_resolutions(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    let list = config.get_string("backtest", "resolutions").ok_or_else(|| BarsimError::ConfigMissing {
        section: "backtest".to_string(),
        key: "resolutions".to_string(),
    })?;
    let resolutions = resolutions_for(&list, "backtest", "resolutions")?;
    let Some(primary) = resolutions.first().copied() else {
        return Err(invalid("backtest", "resolutions", "at least one resolution is required"));
    };
    if let Some(aux) = config.get_string("backtest", "auxiliary_resolution") {
        let aux = resolutions_for(&aux, "backtest", "auxiliary_resolution")?;
        if aux.first().is_some_and(|a| *a >= primary) {
            return Err(invalid(
                "backtest",
                "auxiliary_resolution",
                "auxiliary_resolution must be finer than the primary resolution",
            ));
        }
    }
    Ok(())
}

fn validate_mode(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    if let Some(mode) = config.get_string("backtest", "mode") {
        mode.parse::<TradingMode>()?;
    }
    Ok(())
}

fn validate_positive_int(config: &dyn ConfigPort, section: &str, key: &str, default: i64) -> Result<(), BarsimError> {
    if config.get_int(section, key, default) < 1 {
        return Err(invalid(section, key, &format!("{key} must be at least 1")));
    }
    Ok(())
}

/// Integer key converted to `T`; negative or oversized values are a config
/// error rather than a wrapped cast.
pub fn get_count<T: TryFrom<i64>>(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
    default: i64,
) -> Result<T, BarsimError> {
    let value = config.get_int(section, key, default);
    T::try_from(value).map_err(|_| invalid(section, key, &format!("{value} is out of range for {key}")))
}

fn time_or(config: &dyn ConfigPort, key: &str, default: &str) -> Result<NaiveTime, BarsimError> {
    let value = config.get_string("session", key).unwrap_or_else(|| default.to_string());
    parse_time(&value, "session", key)
}

fn invalid(section: &str, key: &str, reason: &str) -> BarsimError {
    BarsimError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// Split a comma list, dropping blanks.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn resolutions_for(value: &str, section: &str, key: &str) -> Result<Vec<Resolution>, BarsimError> {
    parse_resolutions(value).map_err(|e| invalid(section, key, &e.to_string()))
}

/// `HH:MM` or `HH:MM:SS`.
pub fn parse_time(value: &str, section: &str, key: &str) -> Result<NaiveTime, BarsimError> {
    let value = value.trim();
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| invalid(section, key, &format!("invalid time '{value}', expected HH:MM")))
}

/// `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS`, in exchange-local time. A bare date
/// means the start of that day, or its last second when `end_of_day` is set.
pub fn parse_datetime(value: Option<&str>, field: &str, end_of_day: bool) -> Result<NaiveDateTime, BarsimError> {
    let Some(s) = value.map(str::trim) else {
        return Err(BarsimError::ConfigMissing {
            section: "backtest".to_string(),
            key: field.to_string(),
        });
    };
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(dt);
    }
    let date = NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| {
        invalid(
            "backtest",
            field,
            &format!("invalid {field} format, expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS"),
        )
    })?;
    let time = if end_of_day {
        NaiveTime::from_hms_opt(23, 59, 59).unwrap_or(NaiveTime::MIN)
    } else {
        NaiveTime::MIN
    };
    Ok(date.and_time(time))
}

pub fn parse_holidays(value: &str) -> Result<Vec<NaiveDate>, BarsimError> {
    parse_list(value)
        .iter()
        .map(|s| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| invalid("session", "holidays", &format!("invalid date '{s}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::file_config_adapter::FileConfigAdapter;

    fn make_config(content: &str) -> FileConfigAdapter {
        FileConfigAdapter::from_string(content).unwrap()
    }

    const BASE: &str = "[backtest]\ninitial_cash = 100000\nstart = 2024-01-01\nend = 2024-01-31\nsymbols = SBIN\nresolutions = 15, D\n";

    #[test]
    fn valid_backtest_config_passes() {
        let config = make_config(
            r#"
[backtest]
initial_cash = 100000.0
start = 2024-01-01 09:15:00
end = 2024-03-31
symbols = NSE:SBIN-EQ, NSE:TCS-EQ
resolutions = 15, D, 1
auxiliary_resolution = 1
mode = intraday
warmup_depth = 100
"#,
        );
        assert!(validate_backtest_config(&config).is_ok());
    }

    #[test]
    fn initial_cash_must_be_positive() {
        let config = make_config(&BASE.replace("initial_cash = 100000", "initial_cash = -1"));
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "initial_cash"));
    }

    #[test]
    fn start_after_end_fails() {
        let config = make_config(&BASE.replace("start = 2024-01-01", "start = 2024-02-01"));
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "start"));
    }

    #[test]
    fn same_day_window_is_valid() {
        let config = make_config(&BASE.replace("end = 2024-01-31", "end = 2024-01-01"));
        assert!(validate_backtest_config(&config).is_ok());
    }

    #[test]
    fn missing_symbols_fails() {
        let config = make_config(&BASE.replace("symbols = SBIN\n", ""));
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigMissing { key, .. } if key == "symbols"));
    }

    #[test]
    fn unknown_resolution_fails() {
        let config = make_config(&BASE.replace("resolutions = 15, D", "resolutions = 15, W"));
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "resolutions"));
    }

    #[test]
    fn auxiliary_must_be_finer_than_primary() {
        let config = make_config(&format!("{BASE}auxiliary_resolution = 60\n"));
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "auxiliary_resolution"));
    }

    #[test]
    fn unknown_mode_fails() {
        let config = make_config(&format!("{BASE}mode = swing\n"));
        let err = validate_backtest_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "mode"));
    }

    #[test]
    fn session_defaults_pass() {
        let config = make_config("[session]\n");
        assert!(validate_session_config(&config).is_ok());
    }

    #[test]
    fn session_window_order() {
        let config = make_config("[session]\nentry_start = 15:00\nentry_end = 09:30\n");
        let err = validate_session_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "entry_start"));
    }

    #[test]
    fn bad_holiday_fails() {
        let config = make_config("[session]\nholidays = 2024-01-26, 2024-13-01\n");
        let err = validate_session_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "holidays"));
    }

    #[test]
    fn sell_policy_must_be_known() {
        let config = make_config("[execution]\nsell_policy = maybe\n");
        assert!(validate_execution_config(&config).is_err());
        let config = make_config("[execution]\nsell_policy = strict\ndefault_trade_value = 5000\n");
        assert!(validate_execution_config(&config).is_ok());
    }

    #[test]
    fn strategy_windows_are_ordered() {
        let config = make_config("[strategy]\nname = sma_crossover\nshort_window = 20\nlong_window = 5\n");
        let err = validate_strategy_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "long_window"));
    }

    #[test]
    fn unknown_strategy_fails() {
        let config = make_config("[strategy]\nname = martingale\n");
        let err = validate_strategy_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "name"));
    }

    #[test]
    fn lookback_must_fit_in_warmup() {
        let config = make_config(&format!("{BASE}warmup_depth = 10\n[strategy]\nshort_window = 5\nlong_window = 30\n"));
        let err = validate_strategy_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "long_window"));

        let config = make_config(&format!("{BASE}warmup_depth = 30\n[strategy]\nshort_window = 5\nlong_window = 30\n"));
        assert!(validate_strategy_config(&config).is_ok());
    }

    #[test]
    fn opening_price_params() {
        let config = make_config("[strategy]\nname = opening_price_crossover\n");
        assert!(validate_strategy_config(&config).is_ok());

        let config = make_config("[strategy]\nname = opening_price_crossover\nema_fast = 21\nema_slow = 9\n");
        let err = validate_strategy_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "ema_slow"));

        let config = make_config(&format!("{BASE}warmup_depth = 15\n[strategy]\nname = opening_price_crossover\n"));
        let err = validate_strategy_config(&config).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "ema_slow"));
    }

    #[test]
    fn get_count_rejects_negative_values() {
        let config = make_config("[backtest]\nwarmup_depth = -3\nload_attempts = 4\n");
        let err = get_count::<usize>(&config, "backtest", "warmup_depth", 100).unwrap_err();
        assert!(matches!(err, BarsimError::ConfigInvalid { key, .. } if key == "warmup_depth"));
        assert_eq!(get_count::<u32>(&config, "backtest", "load_attempts", 3).unwrap(), 4);
        assert_eq!(get_count::<usize>(&config, "backtest", "missing", 7).unwrap(), 7);
    }

    #[test]
    fn stream_config_does_not_need_dates() {
        let config = make_config("[backtest]\ninitial_cash = 5000\nsymbols = SBIN\nresolutions = 1, 5\n");
        assert!(validate_stream_config(&config).is_ok());
        assert!(validate_backtest_config(&config).is_err());
    }

    #[test]
    fn live_history_must_be_positive() {
        let config = make_config("[live]\nmax_history = 0\n");
        assert!(validate_live_config(&config).is_err());
    }

    #[test]
    fn parse_datetime_variants() {
        let start = parse_datetime(Some("2024-01-15"), "start", false).unwrap();
        assert_eq!(start.to_string(), "2024-01-15 00:00:00");
        let end = parse_datetime(Some("2024-01-15"), "end", true).unwrap();
        assert_eq!(end.to_string(), "2024-01-15 23:59:59");
        let exact = parse_datetime(Some("2024-01-15 09:15:00"), "start", false).unwrap();
        assert_eq!(exact.to_string(), "2024-01-15 09:15:00");
        assert!(parse_datetime(None, "start", false).is_err());
    }
}
