//! CLI definition and dispatch.

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Utc};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::adapters::calendar::StaticCalendar;
use crate::adapters::csv_adapter::{self, CsvAdapter};
use crate::adapters::csv_feed::CsvTickFeed;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::symbol_master::SymbolMaster;
use crate::domain::config_validation::{
    get_count, parse_datetime, parse_holidays, parse_list, parse_time, resolutions_for,
    validate_backtest_config, validate_execution_config, validate_session_config,
    validate_strategy_config, validate_stream_config,
};
use crate::domain::error::BarsimError;
use crate::domain::execution::{OrderSimulator, SellPolicy};
use crate::domain::ledger::{Ledger, PerformanceSummary};
use crate::domain::replay::{
    ReplayConfig, ReplayDriver, ReplayOutcome, DEFAULT_LOAD_ATTEMPTS, DEFAULT_WARMUP_DEPTH,
};
use crate::domain::resolution::Resolution;
use crate::domain::run::{backtest_run_id, live_run_id, run_lifecycle};
use crate::domain::session::{hm, SessionConfig, TradingMode, DEFAULT_UTC_OFFSET_MINUTES};
use crate::domain::strategies::opening_price_crossover::{OpeningPriceCrossover, OpeningPriceParams};
use crate::domain::strategies::sma_crossover::{SmaCrossover, DEFAULT_LONG_WINDOW, DEFAULT_SHORT_WINDOW};
use crate::domain::strategy::StrategyRegistry;
use crate::domain::streaming::{EndReason, StreamingConfig, StreamingDriver, DEFAULT_MAX_HISTORY};
use crate::ports::config_port::ConfigPort;
use crate::ports::data_port::HistoricalBarStore;
use crate::ports::sink_port::PersistenceSink;

#[derive(Parser, Debug)]
#[command(name = "barsim", about = "Multi-resolution bar replay and paper trading")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Replay stored bars through the configured strategies
    Backtest {
        #[arg(short, long)]
        config: PathBuf,
        /// Directory for trades.csv and equity.csv
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Paper-trade a tick file through the streaming driver
    Stream {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(short, long)]
        ticks: Option<PathBuf>,
    },
    /// Validate a configuration file without running anything
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Backtest { config, output } => run_backtest(&config, output.as_deref()),
        Command::Stream { config, ticks } => run_stream(&config, ticks.as_deref()),
        Command::Validate { config } => run_validate(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "run failed");
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

pub fn load_config(path: &Path) -> Result<FileConfigAdapter, BarsimError> {
    info!(path = %path.display(), "loading config");
    FileConfigAdapter::from_file(path)
}

fn run_validate(config_path: &Path) -> Result<(), BarsimError> {
    let config = load_config(config_path)?;
    validate_backtest_config(&config)?;
    validate_common(&config)?;
    println!("{}: ok", config_path.display());
    Ok(())
}

fn validate_common(config: &dyn ConfigPort) -> Result<(), BarsimError> {
    validate_session_config(config)?;
    validate_execution_config(config)?;
    validate_strategy_config(config)
}

fn run_backtest(config_path: &Path, output: Option<&Path>) -> Result<(), BarsimError> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = output {
        config.set("backtest", "output_dir", &dir.display().to_string());
    }
    validate_backtest_config(&config)?;
    validate_common(&config)?;

    let resolutions = configured_resolutions(&config)?;
    let strategies = build_strategies(&config, &resolutions)?;
    let symbols = configured_symbols(&config);
    let strategy_name = strategies.names().join("+");
    let run_id = backtest_run_id(Utc::now(), &strategy_name, &symbols);

    let replay_config = build_replay_config(&config, run_id.clone())?;
    let calendar = build_calendar(&config)?;
    let simulator = build_simulator(&config)?;
    let store = open_history(&config)?.ok_or_else(|| BarsimError::ConfigMissing {
        section: "data".into(),
        key: "csv_dir".into(),
    })?;
    let sink = open_run_sink(&config, true)?;

    info!(
        run_id = %run_id,
        symbols = symbols.len(),
        start = %replay_config.start,
        end = %replay_config.end,
        "starting backtest"
    );

    let mut driver = ReplayDriver::new(replay_config, store.as_ref(), &calendar, simulator, strategies);
    if let Some(sink) = sink {
        driver = driver.with_sink(sink);
    }

    let result = match driver.run()? {
        ReplayOutcome::Completed(result) => result,
        ReplayOutcome::NoData { run_id, resolution } => {
            warn!(run_id = %run_id, resolution = %resolution, "no bars in window");
            return Err(BarsimError::DataUnavailable {
                resolution: resolution.to_string(),
                symbols: symbols.join(","),
            });
        }
    };

    print_report(&result.run_id, &result.summary());

    if let Some(dir) = config.get_string("backtest", "output_dir") {
        export_results(Path::new(&dir), &result.ledger)?;
    }
    Ok(())
}

fn run_stream(config_path: &Path, ticks: Option<&Path>) -> Result<(), BarsimError> {
    let mut config = load_config(config_path)?;
    if let Some(path) = ticks {
        config.set("live", "ticks", &path.display().to_string());
    }
    validate_stream_config(&config)?;
    validate_common(&config)?;

    let ticks_path = config
        .get_string("live", "ticks")
        .map(PathBuf::from)
        .ok_or_else(|| BarsimError::ConfigMissing {
            section: "live".into(),
            key: "ticks".into(),
        })?;

    let resolutions = configured_resolutions(&config)?;
    let strategies = build_strategies(&config, &resolutions)?;
    let stream_config = build_streaming_config(&config, live_run_id(Utc::now()))?;
    let calendar = Arc::new(build_calendar(&config)?);
    let simulator = build_simulator(&config)?;
    let run_id = stream_config.run_id.clone();
    let utc_offset = stream_config.session.utc_offset;

    let mut driver = StreamingDriver::new(
        stream_config,
        Box::new(CsvTickFeed::new(ticks_path)),
        calendar,
        simulator,
        strategies,
    );
    if let Some(sink) = open_run_sink(&config, false)? {
        driver = driver.with_sink(sink);
    }

    if let Some(store) = open_history(&config)? {
        let depth = get_count::<usize>(&config, "backtest", "warmup_depth", DEFAULT_WARMUP_DEPTH as i64)?;
        let until = match config.get_string("live", "warmup_until") {
            Some(value) => local_to_utc(
                parse_datetime(Some(value.as_str()), "warmup_until", false).map_err(|_| BarsimError::ConfigInvalid {
                    section: "live".into(),
                    key: "warmup_until".into(),
                    reason: format!("invalid datetime '{value}'"),
                })?,
                utc_offset,
            ),
            None => Utc::now(),
        };
        let added = driver.warm_up_from(store.as_ref(), until, depth)?;
        info!(bars = added, until = %until, depth, "live history warmed up");
        println!("Warm-up bars:     {added}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let report = runtime.block_on(async move {
        let (control, handle) = run_lifecycle(run_id);
        let interrupt = handle.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(run_id = %interrupt.run_id(), "interrupt received, stopping");
                interrupt.request_stop();
            }
        });
        driver.run(control).await
    })?;

    let reason = match report.end_reason {
        EndReason::StopRequested => "stop requested",
        EndReason::UpstreamDisconnected => "feed ended",
    };
    info!(run_id = %report.run_id, reason, "stream finished");
    print_report(&report.run_id, &report.ledger.performance_summary(&report.last_prices));
    for mark in &report.pending_exits {
        println!(
            "  open {}: {} @ {:.2} (last {:.2}, mtm {:.2})",
            mark.slot, mark.quantity, mark.avg_price, mark.last_price, mark.mtm
        );
    }
    Ok(())
}

fn configured_symbols(config: &dyn ConfigPort) -> Vec<String> {
    config
        .get_string("backtest", "symbols")
        .map(|s| parse_list(&s))
        .unwrap_or_default()
}

/// `[backtest] resolutions` in listed order; the first is the primary.
pub fn configured_resolutions(config: &dyn ConfigPort) -> Result<Vec<Resolution>, BarsimError> {
    let list = config
        .get_string("backtest", "resolutions")
        .ok_or_else(|| BarsimError::ConfigMissing {
            section: "backtest".into(),
            key: "resolutions".into(),
        })?;
    let mut resolutions: Vec<Resolution> = Vec::new();
    for res in resolutions_for(&list, "backtest", "resolutions")? {
        if !resolutions.contains(&res) {
            resolutions.push(res);
        }
    }
    Ok(resolutions)
}

fn configured_auxiliary(config: &dyn ConfigPort) -> Result<Option<Resolution>, BarsimError> {
    match config.get_string("backtest", "auxiliary_resolution") {
        Some(value) => Ok(resolutions_for(&value, "backtest", "auxiliary_resolution")?
            .first()
            .copied()),
        None => Ok(None),
    }
}

fn session_time(
    config: &dyn ConfigPort,
    key: &str,
    default: chrono::NaiveTime,
) -> Result<chrono::NaiveTime, BarsimError> {
    match config.get_string("session", key) {
        Some(v) => parse_time(&v, "session", key),
        None => Ok(default),
    }
}

pub fn build_session(config: &dyn ConfigPort) -> Result<SessionConfig, BarsimError> {
    let defaults = SessionConfig::default();
    let mode = match config.get_string("backtest", "mode") {
        Some(m) => m.parse::<TradingMode>()?,
        None => TradingMode::default(),
    };
    let offset_minutes = config.get_int(
        "session",
        "utc_offset_minutes",
        i64::from(DEFAULT_UTC_OFFSET_MINUTES),
    );
    let utc_offset = i32::try_from(offset_minutes * 60)
        .ok()
        .and_then(FixedOffset::east_opt)
        .ok_or_else(|| BarsimError::ConfigInvalid {
            section: "session".into(),
            key: "utc_offset_minutes".into(),
            reason: format!("offset {offset_minutes} is out of range"),
        })?;
    Ok(SessionConfig {
        mode,
        entry_start: session_time(config, "entry_start", defaults.entry_start)?,
        entry_end: session_time(config, "entry_end", defaults.entry_end)?,
        utc_offset,
        exit_buffer: Duration::minutes(config.get_int(
            "session",
            "exit_buffer_minutes",
            defaults.exit_buffer.num_minutes(),
        )),
    })
}

pub fn build_calendar(config: &dyn ConfigPort) -> Result<StaticCalendar, BarsimError> {
    let open = session_time(config, "market_open", hm(9, 15))?;
    let close = session_time(config, "market_close", hm(15, 30))?;
    let holidays = match config.get_string("session", "holidays") {
        Some(list) => parse_holidays(&list)?,
        None => Vec::new(),
    };
    Ok(StaticCalendar::new(open, close).with_holidays(holidays))
}

pub fn build_simulator(config: &dyn ConfigPort) -> Result<OrderSimulator, BarsimError> {
    let metadata = match config.get_string("data", "lot_sizes") {
        Some(path) => SymbolMaster::load(Path::new(&path))?,
        None => SymbolMaster::from_lots(Vec::<(String, i64)>::new()),
    };
    let sell_policy = match config.get_string("execution", "sell_policy") {
        Some(p) => p.parse::<SellPolicy>()?,
        None => SellPolicy::default(),
    };
    Ok(OrderSimulator::new(
        Arc::new(metadata),
        sell_policy,
        config.get_double("execution", "default_trade_value", 10_000.0),
    ))
}

/// One strategy instance per `[strategy] timeframes` entry (default: the
/// primary resolution). SMA crossovers receive every configured resolution.
pub fn build_strategies(
    config: &dyn ConfigPort,
    resolutions: &[Resolution],
) -> Result<StrategyRegistry, BarsimError> {
    let name = config
        .get_string("strategy", "name")
        .unwrap_or_else(|| "sma_crossover".into());
    let timeframes = match config.get_string("strategy", "timeframes") {
        Some(list) => resolutions_for(&list, "strategy", "timeframes")?,
        None => resolutions.first().copied().into_iter().collect(),
    };

    let mut registry = StrategyRegistry::new();
    match name.trim() {
        "sma_crossover" => {
            let short = get_count::<usize>(config, "strategy", "short_window", DEFAULT_SHORT_WINDOW as i64)?;
            let long = get_count::<usize>(config, "strategy", "long_window", DEFAULT_LONG_WINDOW as i64)?;
            for tf in timeframes {
                registry.register(Box::new(
                    SmaCrossover::new(tf, short, long).with_resolutions(resolutions),
                ))?;
            }
        }
        "opening_price_crossover" => {
            let params = opening_price_params(config)?;
            let utc_offset = build_session(config)?.utc_offset;
            for tf in timeframes {
                registry.register(Box::new(
                    OpeningPriceCrossover::new(tf, params.clone()).with_utc_offset(utc_offset),
                ))?;
            }
        }
        other => {
            return Err(BarsimError::ConfigInvalid {
                section: "strategy".into(),
                key: "name".into(),
                reason: format!("unknown strategy '{other}'"),
            });
        }
    }
    Ok(registry)
}

fn opening_price_params(config: &dyn ConfigPort) -> Result<OpeningPriceParams, BarsimError> {
    let defaults = OpeningPriceParams::default();
    Ok(OpeningPriceParams {
        ema_fast: get_count(config, "strategy", "ema_fast", defaults.ema_fast as i64)?,
        ema_slow: get_count(config, "strategy", "ema_slow", defaults.ema_slow as i64)?,
        atr_period: get_count(config, "strategy", "atr_period", defaults.atr_period as i64)?,
        atr_multiplier: config.get_double("strategy", "atr_multiplier", defaults.atr_multiplier),
        spike_window: get_count(config, "strategy", "spike_window", defaults.spike_window as i64)?,
        ..defaults
    })
}

fn local_to_utc(local: NaiveDateTime, offset: FixedOffset) -> DateTime<Utc> {
    (local - Duration::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

pub fn build_replay_config(config: &dyn ConfigPort, run_id: String) -> Result<ReplayConfig, BarsimError> {
    let session = build_session(config)?;
    let start = parse_datetime(config.get_string("backtest", "start").as_deref(), "start", false)?;
    let end = parse_datetime(config.get_string("backtest", "end").as_deref(), "end", true)?;
    Ok(ReplayConfig {
        run_id,
        start: local_to_utc(start, session.utc_offset),
        end: local_to_utc(end, session.utc_offset),
        initial_cash: config.get_double("backtest", "initial_cash", 0.0),
        symbols: configured_symbols(config),
        auxiliary: configured_auxiliary(config)?,
        warmup_depth: get_count(config, "backtest", "warmup_depth", DEFAULT_WARMUP_DEPTH as i64)?,
        max_history: match config.get_string("backtest", "max_history") {
            Some(_) => Some(get_count(config, "backtest", "max_history", 0)?),
            None => None,
        },
        load_attempts: get_count(config, "backtest", "load_attempts", i64::from(DEFAULT_LOAD_ATTEMPTS))?,
        session,
    })
}

pub fn build_streaming_config(config: &dyn ConfigPort, run_id: String) -> Result<StreamingConfig, BarsimError> {
    Ok(StreamingConfig {
        run_id,
        symbols: configured_symbols(config),
        initial_cash: config.get_double("backtest", "initial_cash", 0.0),
        auxiliary: configured_auxiliary(config)?,
        max_history: get_count(config, "live", "max_history", DEFAULT_MAX_HISTORY as i64)?,
        disconnect_timeout: std::time::Duration::from_millis(get_count(
            config,
            "live",
            "disconnect_timeout_ms",
            5_000,
        )?),
        close_on_shutdown: config.get_bool("live", "close_on_shutdown", false),
        session: build_session(config)?,
    })
}

/// Historical bar source from `[data]`: a CSV directory or a SQLite file.
fn open_history(config: &dyn ConfigPort) -> Result<Option<Box<dyn HistoricalBarStore>>, BarsimError> {
    if let Some(dir) = config.get_string("data", "csv_dir") {
        return Ok(Some(Box::new(CsvAdapter::new(PathBuf::from(dir)))));
    }

    #[cfg(feature = "sqlite")]
    if config.get_string("data", "sqlite_path").is_some() {
        use crate::adapters::sqlite_adapter::SqliteAdapter;
        return Ok(Some(Box::new(SqliteAdapter::from_config(config)?)));
    }

    Ok(None)
}

/// Runs with a SQLite file record through a writer thread. Replays wait for
/// queue room; live runs drop records rather than stall the feed.
fn open_run_sink(
    config: &dyn ConfigPort,
    backpressure: bool,
) -> Result<Option<Box<dyn PersistenceSink>>, BarsimError> {
    #[cfg(feature = "sqlite")]
    if config.get_string("data", "sqlite_path").is_some() {
        use crate::adapters::queued_sink::{QueuedSink, DEFAULT_QUEUE_CAPACITY};
        use crate::adapters::sqlite_adapter::SqliteAdapter;
        let adapter = SqliteAdapter::from_config(config)?;
        let sink = QueuedSink::new(Box::new(adapter), DEFAULT_QUEUE_CAPACITY);
        let sink = if backpressure { sink.with_backpressure() } else { sink };
        return Ok(Some(Box::new(sink)));
    }
    #[cfg(not(feature = "sqlite"))]
    let _ = (config, backpressure);
    Ok(None)
}

pub fn print_report(run_id: &str, summary: &PerformanceSummary) {
    println!("\n=== {run_id} ===");
    println!("Initial Cash:     {:.2}", summary.initial_cash);
    println!("Final Equity:     {:.2}", summary.total);
    println!("  Cash:           {:.2}", summary.cash);
    println!("  Holdings:       {:.2}", summary.holdings);
    println!("Total P&L:        {:.2} ({:.2}%)", summary.total_pnl, summary.total_return_pct());
    println!("  Realized:       {:.2}", summary.realized_pnl);
    println!("  Unrealized:     {:.2}", summary.unrealized_pnl);
    println!("Trades:           {}", summary.trade_count);
}

pub fn export_results(dir: &Path, ledger: &Ledger) -> Result<(), BarsimError> {
    fs::create_dir_all(dir)?;
    let trades = dir.join("trades.csv");
    let equity = dir.join("equity.csv");
    csv_adapter::write_trades(&trades, ledger.trades())?;
    csv_adapter::write_equity_curve(&equity, ledger.equity_curve())?;
    info!(trades = %trades.display(), equity = %equity.display(), "exported results");
    Ok(())
}
