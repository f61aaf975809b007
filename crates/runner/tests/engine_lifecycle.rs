//! Engine lifecycle on the paper exchange
//!
//! Tests the wired engine end to end:
//! 1. Candle closes and signals open a position
//! 2. Exchange push events (stop, take-profit, external close) reach the lifecycle,
//!    including when they race a dispatched action for the symbol lock
//! 3. Shutdown drains the queue, snapshots positions and releases locks

use chrono::Utc;
use kestrel_core::{
    Action, AnalyzerSignal, CandleClose, CloseReason, Direction, OpenPositionPayload,
    PositionStatus, TradeStatus,
};
use kestrel_gateway::{CollectingMonitor, InMemoryRepository, PaperExchange};
use kestrel_order_manager::{
    ActionQueue, EntryDecision, OrderExecutionPipeline, PositionLifecycle, RetryPolicy,
    RiskConfig,
};
use kestrel_ports::{ExchangePort, Repository, keys};
use kestrel_runner::{
    EngineConfig, EngineError, GracefulShutdownManager, ShutdownError, TradingEngine,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Setup {
    engine: TradingEngine,
    exchange: Arc<PaperExchange>,
    repository: InMemoryRepository,
    monitor: CollectingMonitor,
}

async fn setup() -> Setup {
    let _ = env_logger::try_init();

    let mut config = EngineConfig::default();
    config.aggregation.weights = HashMap::from([
        ("rsi".to_string(), dec!(1)),
        ("macd".to_string(), dec!(1)),
    ]);

    let exchange = Arc::new(PaperExchange::new(dec!(10000)));
    exchange.set_mark_price("BTCUSDT", dec!(100)).await;
    let repository = InMemoryRepository::new();
    let monitor = CollectingMonitor::new();

    let engine = TradingEngine::start(
        config,
        exchange.clone(),
        Arc::new(repository.clone()),
        Arc::new(monitor.clone()),
    )
    .await
    .unwrap();

    Setup {
        engine,
        exchange,
        repository,
        monitor,
    }
}

fn candle(close: Decimal) -> CandleClose {
    CandleClose {
        symbol: "BTCUSDT".to_string(),
        open_time: Utc::now(),
        open: close,
        high: close,
        low: close,
        close,
        volume: dec!(50),
    }
}

fn long_signals() -> Vec<AnalyzerSignal> {
    vec![
        AnalyzerSignal::long("rsi", dec!(80)),
        AnalyzerSignal::long("macd", dec!(100)),
    ]
}

async fn open_long(s: &Setup) {
    let decision = s
        .engine
        .on_candle(&candle(dec!(100)), &long_signals())
        .await
        .unwrap();
    assert!(matches!(decision, EntryDecision::Open { .. }));
    s.engine.queue().wait_drained().await;
    assert!(s.engine.lifecycle().position("BTCUSDT").unwrap().is_open());
}

/// Poll until `check` holds; push events are applied on a background task
async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_stop_fill_closes_position() {
    let s = setup().await;
    open_long(&s).await;

    s.exchange.set_mark_price("BTCUSDT", dec!(97)).await;

    let lifecycle = s.engine.lifecycle().clone();
    assert!(eventually(|| lifecycle.position("BTCUSDT").is_none()).await);

    let trades = s.repository.trades();
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert_eq!(trades[0].close_reason, Some(CloseReason::StopLoss));
    assert!(trades[0].realized_pnl < Decimal::ZERO);
}

#[tokio::test]
async fn test_stop_fill_applied_after_lock_is_released() {
    let s = setup().await;
    open_long(&s).await;
    let lifecycle = s.engine.lifecycle().clone();

    let guard = lifecycle.locks().try_acquire("BTCUSDT").unwrap();
    s.exchange.set_mark_price("BTCUSDT", dec!(97)).await;
    assert!(s.exchange.position("BTCUSDT").await.unwrap().is_none());

    // The fill lost the lock race and waits
    tokio::time::sleep(Duration::from_millis(100)).await;
    let position = lifecycle.position("BTCUSDT").unwrap();
    assert_eq!(position.status, PositionStatus::Open);

    drop(guard);
    assert!(eventually(|| lifecycle.position("BTCUSDT").is_none()).await);
    let trades = s.repository.trades();
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert_eq!(trades[0].close_reason, Some(CloseReason::StopLoss));
}

#[tokio::test]
async fn test_stop_fill_during_dispatched_action() {
    let s = setup().await;
    open_long(&s).await;
    let lifecycle = s.engine.lifecycle().clone();

    s.exchange.set_latency(Some(Duration::from_millis(200))).await;
    s.engine
        .submit(Action::activate_trailing("BTCUSDT", dec!(105), dec!(0.01)))
        .await
        .unwrap();
    assert!(eventually(|| lifecycle.locks().is_locked("BTCUSDT")).await);

    // Stop triggers while the trailing order is still on its way
    s.exchange.set_mark_price("BTCUSDT", dec!(97)).await;
    assert!(lifecycle.locks().is_locked("BTCUSDT"));

    assert!(eventually(|| lifecycle.position("BTCUSDT").is_none()).await);
    s.engine.queue().wait_drained().await;

    let trades = s.repository.trades();
    assert_eq!(trades.len(), 1);
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert_eq!(trades[0].close_reason, Some(CloseReason::StopLoss));
    assert!(s.exchange.position("BTCUSDT").await.unwrap().is_none());
}

#[tokio::test]
async fn test_take_profit_fill_moves_stop_to_breakeven() {
    let s = setup().await;
    open_long(&s).await;

    s.exchange.set_mark_price("BTCUSDT", dec!(102)).await;

    let lifecycle = s.engine.lifecycle().clone();
    assert!(
        eventually(|| {
            lifecycle
                .position("BTCUSDT")
                .map(|p| p.take_profits[0].hit && p.stop_loss == p.entry_price)
                .unwrap_or(false)
        })
        .await
    );

    let position = lifecycle.position("BTCUSDT").unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    assert_eq!(position.quantity, dec!(10));
    assert_eq!(position.realized_pnl, dec!(20));
}

#[tokio::test]
async fn test_external_close_is_synced() {
    let s = setup().await;
    open_long(&s).await;

    s.exchange.close_externally("BTCUSDT").await;

    let lifecycle = s.engine.lifecycle().clone();
    assert!(eventually(|| lifecycle.position("BTCUSDT").is_none()).await);
    let trades = s.repository.trades();
    assert_eq!(trades[0].close_reason, Some(CloseReason::External));
}

#[tokio::test]
async fn test_unknown_symbol_rejected() {
    let s = setup().await;
    let mut other = candle(dec!(100));
    other.symbol = "DOGEUSDT".to_string();

    let result = s.engine.on_candle(&other, &long_signals()).await;
    assert!(matches!(result, Err(EngineError::UnknownSymbol(_))));
}

#[tokio::test]
async fn test_shutdown_persists_snapshot() {
    let s = setup().await;
    open_long(&s).await;
    s.engine
        .submit(Action::update_stop_loss("BTCUSDT", dec!(99), "tighten"))
        .await
        .unwrap();

    let lifecycle = s.engine.lifecycle().clone();
    let report = s.engine.shutdown().await.unwrap();

    assert!(report.drained);
    assert_eq!(report.pending_actions, 0);
    assert_eq!(report.snapshot_positions, 1);
    assert_eq!(lifecycle.locks().held_count(), 0);
    assert_eq!(s.monitor.results().len(), 2);

    let snapshot = s
        .repository
        .get_value(keys::POSITIONS_SNAPSHOT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.as_array().map(Vec::len), Some(1));
    assert_eq!(snapshot[0]["stop_loss"], "99");

    let sessions = s.repository.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].ended_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_times_out_on_stuck_action() {
    let _ = env_logger::try_init();
    let exchange = Arc::new(PaperExchange::new(dec!(10000)));
    exchange.set_mark_price("BTCUSDT", dec!(100)).await;
    exchange.set_latency(Some(Duration::from_secs(60))).await;
    let repository = InMemoryRepository::new();

    let lifecycle = Arc::new(PositionLifecycle::new(
        OrderExecutionPipeline::new(
            exchange.clone(),
            RetryPolicy {
                call_timeout_ms: 120_000,
                ..Default::default()
            },
        ),
        Arc::new(repository.clone()),
        Arc::new(CollectingMonitor::new()),
        RiskConfig::default(),
    ));
    let (queue, receiver) = ActionQueue::new(8);
    let dispatcher = kestrel_order_manager::ActionDispatcher::new(
        receiver,
        lifecycle.clone(),
        Arc::new(CollectingMonitor::new()),
        Duration::from_secs(300),
    );
    tokio::spawn(dispatcher.run());

    queue
        .enqueue(Action::open_position(
            "BTCUSDT",
            OpenPositionPayload {
                direction: Direction::Long,
                reference_price: dec!(100),
                confidence: dec!(0.9),
                total_score: dec!(0.9),
                signal_count: 2,
            },
        ))
        .await
        .unwrap();

    let manager = GracefulShutdownManager::new(
        queue.clone(),
        lifecycle.clone(),
        Arc::new(repository.clone()),
        Duration::from_secs(1),
    );
    let outcome = manager.shutdown().await;

    match outcome {
        Err(ShutdownError::Timeout(report)) => {
            assert!(!report.drained);
            assert_eq!(report.pending_actions, 1);
            assert_eq!(report.in_flight_actions, 1);
            // The in-flight open is still OPENING, never persisted as OPEN
            assert_eq!(report.snapshot_positions, 1);
            assert_eq!(report.released_locks, 1);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    let snapshot = repository
        .get_value(keys::POSITIONS_SNAPSHOT)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot[0]["status"], "OPENING");

    // New work is refused after shutdown
    let refused = queue
        .enqueue(Action::close_all("BTCUSDT", CloseReason::Manual))
        .await;
    assert!(refused.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_timed_out_close() {
    let _ = env_logger::try_init();
    let exchange = Arc::new(PaperExchange::new(dec!(10000)));
    exchange.set_mark_price("BTCUSDT", dec!(100)).await;
    let repository = InMemoryRepository::new();
    let monitor = CollectingMonitor::new();

    let lifecycle = Arc::new(PositionLifecycle::new(
        OrderExecutionPipeline::new(exchange.clone(), RetryPolicy::default()),
        Arc::new(repository.clone()),
        Arc::new(monitor.clone()),
        RiskConfig::default(),
    ));
    let (queue, receiver) = ActionQueue::new(8);
    let dispatcher = kestrel_order_manager::ActionDispatcher::new(
        receiver,
        lifecycle.clone(),
        Arc::new(monitor.clone()),
        Duration::from_secs(2),
    );
    tokio::spawn(dispatcher.run());

    queue
        .enqueue(Action::open_position(
            "BTCUSDT",
            OpenPositionPayload {
                direction: Direction::Long,
                reference_price: dec!(100),
                confidence: dec!(0.9),
                total_score: dec!(0.9),
                signal_count: 2,
            },
        ))
        .await
        .unwrap();
    queue.wait_drained().await;
    assert!(lifecycle.position("BTCUSDT").unwrap().is_open());

    // Every exchange call now outlives the action deadline
    exchange.set_latency(Some(Duration::from_secs(3))).await;
    queue
        .enqueue(Action::close_all("BTCUSDT", CloseReason::Manual))
        .await
        .unwrap();

    let manager = GracefulShutdownManager::new(
        queue.clone(),
        lifecycle.clone(),
        Arc::new(repository.clone()),
        Duration::from_secs(120),
    );
    let report = manager.shutdown().await.unwrap();

    assert!(report.drained);
    assert_eq!(report.pending_actions, 0);
    assert_eq!(report.in_flight_actions, 0);
    // The close finished before the snapshot was taken
    assert_eq!(report.snapshot_positions, 0);
    assert_eq!(report.released_locks, 0);
    assert!(lifecycle.position("BTCUSDT").is_none());

    let results = monitor.results();
    assert_eq!(
        results.last().and_then(|r| r.error_kind()),
        Some(kestrel_core::ActionErrorKind::Timeout)
    );
    let trades = repository.trades();
    assert_eq!(trades[0].status, TradeStatus::Closed);
    assert_eq!(trades[0].close_reason, Some(CloseReason::Manual));
}
