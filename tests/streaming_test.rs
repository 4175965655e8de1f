//! Streaming driver tests over an in-memory channel feed.

mod common;

use barsim::domain::aggregator::Observation;
use barsim::domain::error::BarsimError;
use barsim::domain::execution::{OrderSimulator, SellPolicy, TradeIntent};
use barsim::domain::position::TradeAction;
use barsim::domain::resolution::Resolution;
use barsim::domain::run::{run_lifecycle, RunStatus};
use barsim::domain::session::TradingMode;
use barsim::domain::strategy::StrategyRegistry;
use barsim::domain::streaming::{EndReason, StreamState, StreamingConfig, StreamingDriver, DEFAULT_MAX_HISTORY};
use barsim::ports::feed_port::LiveFeed;
use barsim::ports::sink_port::{PersistenceSink, Record};
use chrono::{DateTime, Utc};
use common::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const M1: Resolution = Resolution::Minutes(1);
const M5: Resolution = Resolution::Minutes(5);

fn stream_config(close_on_shutdown: bool) -> StreamingConfig {
    StreamingConfig {
        run_id: "live_test".into(),
        symbols: vec!["SBIN".into()],
        initial_cash: 100_000.0,
        auxiliary: None,
        max_history: DEFAULT_MAX_HISTORY,
        disconnect_timeout: Duration::from_millis(100),
        close_on_shutdown,
        session: utc_session(TradingMode::Positional),
    }
}

fn driver(feed: ChannelFeed, strategy: ScriptedStrategy, close_on_shutdown: bool) -> StreamingDriver {
    let mut registry = StrategyRegistry::new();
    registry.register(Box::new(strategy)).unwrap();
    StreamingDriver::new(
        stream_config(close_on_shutdown),
        Box::new(feed),
        Arc::new(EveryDay),
        OrderSimulator::new(Arc::new(Lots::ones()), SellPolicy::Lenient, 10_000.0),
        registry,
    )
}

/// Two prints per minute from `from`: `100 + i` at :00 and `100.5 + i` at :30.
fn minute_ticks(from: DateTime<Utc>, count: i64) -> Vec<Observation> {
    (0..count)
        .flat_map(|i| {
            let base = 100.0 + i as f64;
            let ts = from + minutes(i);
            [
                tick("SBIN", base, ts),
                tick("SBIN", base + 0.5, ts + chrono::Duration::seconds(30)),
            ]
        })
        .collect()
}

async fn send_all(tx: &tokio::sync::mpsc::Sender<Observation>, ticks: Vec<Observation>) {
    for obs in ticks {
        tx.send(obs).await.unwrap();
    }
}

mod aggregation {
    use super::*;

    #[tokio::test]
    async fn ticks_become_minute_and_derived_bars() {
        let (feed, tx) = ChannelFeed::new();
        let strategy = ScriptedStrategy::new(M1).requiring(&[M1, M5]);
        let seen = Arc::clone(&strategy.seen);
        let sink = MemorySink::default();
        let driver = driver(feed, strategy, false).with_sink(Box::new(sink.clone()));

        send_all(&tx, minute_ticks(at(15, 9, 15), 6)).await;
        drop(tx);

        let (control, _handle) = run_lifecycle("live_test");
        let report = driver.run(control).await.unwrap();
        assert_eq!(report.end_reason, EndReason::UpstreamDisconnected);

        // 09:15..09:20 one-minute bars (the last from the shutdown flush) and
        // the single complete 5-minute bucket.
        assert_eq!(sink.count("tick"), 12);
        assert_eq!(sink.count("bar"), 7);
        assert_eq!(sink.count("equity"), 6);

        let records = sink.records.lock().unwrap();
        let five: Vec<_> = records
            .iter()
            .filter_map(|r| match r {
                Record::Bar(b) if b.resolution == M5 => Some(b.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(five.len(), 1);
        assert_eq!(five[0].timestamp, at(15, 9, 15));
        assert!((five[0].open - 100.0).abs() < f64::EPSILON);
        assert!((five[0].close - 104.5).abs() < f64::EPSILON);
        assert!((five[0].high - 104.5).abs() < f64::EPSILON);
        assert!((five[0].low - 100.0).abs() < f64::EPSILON);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 6);
        assert!(seen.iter().all(|s| s.is_live));
        assert_eq!(seen.last().unwrap().timestamp, at(15, 9, 20));
    }

    #[tokio::test]
    async fn malformed_ticks_are_skipped() {
        let (feed, tx) = ChannelFeed::new();
        let sink = MemorySink::default();
        let driver = driver(feed, ScriptedStrategy::new(M1), false).with_sink(Box::new(sink.clone()));

        let mut ticks = minute_ticks(at(15, 9, 15), 2);
        ticks.insert(1, tick("SBIN", -5.0, at(15, 9, 15)));
        ticks.insert(2, tick("", 100.0, at(15, 9, 15)));
        send_all(&tx, ticks).await;
        drop(tx);

        let (control, _handle) = run_lifecycle("live_test");
        let report = driver.run(control).await.unwrap();
        assert_eq!(report.end_reason, EndReason::UpstreamDisconnected);
        assert_eq!(sink.count("bar"), 2);
        assert_eq!(report.last_prices.get("SBIN"), Some(&101.5));
    }

    #[tokio::test]
    async fn warm_up_history_reaches_strategy() {
        let (feed, tx) = ChannelFeed::new();
        let strategy = ScriptedStrategy::new(M1);
        let seen = Arc::clone(&strategy.seen);
        let mut driver = driver(feed, strategy, false);
        driver.warm_up(make_series("SBIN", M1, at(15, 9, 0), &[99.0, 99.5, 98.0]));

        send_all(&tx, minute_ticks(at(15, 9, 15), 2)).await;
        drop(tx);
        let (control, _handle) = run_lifecycle("live_test");
        driver.run(control).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].history_len, 4);
        assert_eq!(seen[1].history_len, 5);
    }

    #[tokio::test]
    async fn warm_up_from_store_seeds_closed_bars_only() {
        let (feed, tx) = ChannelFeed::new();
        let strategy = ScriptedStrategy::new(M1).requiring(&[M1, Resolution::Daily]);
        let seen = Arc::clone(&strategy.seen);
        let mut driver = driver(feed, strategy, false);
        let store = MockBarStore::new()
            .with_bars(make_series("SBIN", M1, at(15, 9, 0), &[99.0, 99.5, 98.0, 97.0, 96.5]))
            .with_bars(make_series("SBIN", Resolution::Daily, at(12, 0, 0), &[90.0, 91.0, 92.0, 93.0]));

        // The 15th's daily bar is still open at 09:15.
        let added = driver.warm_up_from(&store, at(15, 9, 15), 3).unwrap();
        assert_eq!(added, 6);

        send_all(&tx, minute_ticks(at(15, 9, 15), 2)).await;
        drop(tx);
        let (control, _handle) = run_lifecycle("live_test");
        driver.run(control).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0].history_len, 4);
        assert_eq!(seen[0].latest, vec![(Resolution::Daily, Some(92.0))]);
    }

    #[tokio::test]
    async fn warm_up_load_failure_is_an_error() {
        let (feed, _tx) = ChannelFeed::new();
        let mut driver = driver(feed, ScriptedStrategy::new(M1), false);
        let store = MockBarStore::new().with_error(M1, "locked");
        assert!(driver.warm_up_from(&store, at(15, 9, 15), 3).is_err());
    }
}

mod shutdown {
    use super::*;

    /// Flush waits until another task opens the gate.
    struct GatedSink {
        gate: std::sync::mpsc::Receiver<()>,
        released: Arc<AtomicBool>,
    }

    impl PersistenceSink for GatedSink {
        fn append(&mut self, _record: &Record) -> Result<(), BarsimError> {
            Ok(())
        }

        fn flush(&mut self) -> Result<(), BarsimError> {
            if self.gate.recv_timeout(Duration::from_secs(2)).is_ok() {
                self.released.store(true, Ordering::SeqCst);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn sink_flush_leaves_the_runtime_free() {
        let (feed, _tx) = ChannelFeed::new();
        let (open, gate) = std::sync::mpsc::channel();
        let released = Arc::new(AtomicBool::new(false));
        let sink = GatedSink {
            gate,
            released: Arc::clone(&released),
        };
        let mut driver = driver(feed, ScriptedStrategy::new(M1), false).with_sink(Box::new(sink));

        // Runs only if shutdown yields while the sink is flushing.
        tokio::spawn(async move {
            let _ = open.send(());
        });
        driver.shutdown().await;
        assert!(released.load(Ordering::SeqCst));
        assert_eq!(driver.state(), StreamState::Disconnected);
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (feed, _tx) = ChannelFeed::new();
        let disconnects = Arc::clone(&feed.disconnects);
        let sink = MemorySink::default();
        let mut driver = driver(feed, ScriptedStrategy::new(M1), false).with_sink(Box::new(sink.clone()));

        for obs in minute_ticks(at(15, 9, 15), 3) {
            driver.on_observation(obs).unwrap();
        }
        assert_eq!(sink.count("bar"), 2);

        driver.shutdown().await;
        assert_eq!(sink.count("bar"), 3);
        assert_eq!(driver.state(), StreamState::Disconnected);

        driver.shutdown().await;
        assert_eq!(sink.count("bar"), 3);
        assert_eq!(*sink.flushes.lock().unwrap(), 1);
        assert_eq!(*disconnects.lock().unwrap(), 1);

        // Nothing is accepted after the flush.
        driver.on_observation(tick("SBIN", 120.0, at(15, 9, 30))).unwrap();
        assert_eq!(sink.count("bar"), 3);
    }

    #[tokio::test]
    async fn open_positions_are_reported_by_default() {
        let (feed, tx) = ChannelFeed::new();
        let strategy = ScriptedStrategy::new(M1)
            .at(at(15, 9, 15), TradeIntent::buy("SBIN", M1, 10, 100.0, at(15, 9, 15)));
        let driver = driver(feed, strategy, false);

        send_all(&tx, minute_ticks(at(15, 9, 15), 3)).await;
        drop(tx);
        let (control, _handle) = run_lifecycle("live_test");
        let report = driver.run(control).await.unwrap();

        assert_eq!(report.ledger.trades().len(), 1);
        assert_eq!(report.pending_exits.len(), 1);
        let mark = &report.pending_exits[0];
        assert_eq!(mark.quantity, 10);
        assert!((mark.last_price - 102.5).abs() < f64::EPSILON);
        approx::assert_abs_diff_eq!(mark.mtm, 25.0, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn close_on_shutdown_sells_through_simulator() {
        let (feed, tx) = ChannelFeed::new();
        let strategy = ScriptedStrategy::new(M1)
            .at(at(15, 9, 15), TradeIntent::buy("SBIN", M1, 10, 100.0, at(15, 9, 15)));
        let driver = driver(feed, strategy, true);

        send_all(&tx, minute_ticks(at(15, 9, 15), 3)).await;
        drop(tx);
        let (control, _handle) = run_lifecycle("live_test");
        let report = driver.run(control).await.unwrap();

        let trades = report.ledger.trades();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].action, TradeAction::Sell);
        assert!((trades[1].price - 102.5).abs() < f64::EPSILON);
        assert!(report.pending_exits.is_empty());
        assert!(report.ledger.positions().is_empty());
    }

    #[tokio::test]
    async fn hung_disconnect_times_out() {
        let (mut feed, tx) = ChannelFeed::new();
        feed.hang_on_disconnect = true;
        let disconnects = Arc::clone(&feed.disconnects);
        let driver = driver(feed, ScriptedStrategy::new(M1), false);
        drop(tx);

        let (control, _handle) = run_lifecycle("live_test");
        let report = tokio::time::timeout(Duration::from_secs(5), driver.run(control))
            .await
            .expect("driver should not wait on a hung disconnect")
            .unwrap();
        assert_eq!(report.end_reason, EndReason::UpstreamDisconnected);
        assert_eq!(*disconnects.lock().unwrap(), 1);
    }
}

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn stop_request_ends_the_run() {
        let (feed, tx) = ChannelFeed::new();
        let driver = driver(feed, ScriptedStrategy::new(M1), false);
        let snapshots = driver.subscribe_snapshots();
        let (control, mut handle) = run_lifecycle("live_test");

        let task = tokio::spawn(driver.run(control));
        send_all(&tx, minute_ticks(at(15, 9, 15), 2)).await;
        handle.request_stop();
        handle.wait_stopped().await;

        let report = task.await.unwrap().unwrap();
        assert_eq!(report.end_reason, EndReason::StopRequested);
        assert_eq!(handle.status(), RunStatus::Stopped);
        assert!(!handle.is_running());
        assert_eq!(snapshots.borrow().state, StreamState::Disconnected);
        assert_eq!(snapshots.borrow().run_id, "live_test");
        drop(tx);
    }

    #[tokio::test]
    async fn subscribe_failure_is_an_error() {
        let (mut feed, _tx) = ChannelFeed::new();
        let _rx = feed.subscribe(&["SBIN".to_string()]).await.unwrap();
        let driver = driver(feed, ScriptedStrategy::new(M1), false);

        let (control, handle) = run_lifecycle("live_test");
        let err = driver.run(control).await.unwrap_err();
        assert!(matches!(err, BarsimError::UpstreamDisconnected { .. }));
        assert_eq!(handle.status(), RunStatus::Stopped);
    }

    #[tokio::test]
    async fn snapshots_track_cash_and_equity() {
        let (feed, tx) = ChannelFeed::new();
        let strategy = ScriptedStrategy::new(M1)
            .at(at(15, 9, 15), TradeIntent::buy("SBIN", M1, 10, 100.0, at(15, 9, 15)));
        let driver = driver(feed, strategy, false);
        let snapshots = driver.subscribe_snapshots();

        send_all(&tx, minute_ticks(at(15, 9, 15), 3)).await;
        drop(tx);
        let (control, _handle) = run_lifecycle("live_test");
        driver.run(control).await.unwrap();

        let snap = snapshots.borrow();
        assert!((snap.cash - 99_000.0).abs() < 1e-9);
        assert_eq!(snap.equity_tail.len(), 3);
        assert_eq!(snap.positions.len(), 1);
    }
}
