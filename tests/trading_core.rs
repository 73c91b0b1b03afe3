//! Cross-module scenarios: order roundtrips through the execution engine and
//! bus, book resync, over-fill reconciliation, and backtest determinism
//! across the scalar and vectorized paths.

use parking_lot::Mutex;
use quantbot::backtest::{
    run_dual_ma, synthetic_sine, BacktestConfig, BacktestEngine, SlippageModel, VecFeed,
    VectorizedDualMaConfig,
};
use quantbot::bus::{EventBus, EventBusConfig};
use quantbot::cache::MarketCache;
use quantbot::engine::{
    ExecutionEngine, ExecutionMode, FillOutcome, OrderManager, OrderState, PositionTracker,
    SimulatedExecutor, SimulatedExecutorConfig,
};
use quantbot::events::{AccountEvent, BusEvent};
use quantbot::exchange::{OrderAck, VenueOrder};
use quantbot::orderbook::{BookLevel, BookSnapshot};
use quantbot::risk::{RiskEngine, RiskLimits};
use quantbot::strategy::StrategyParams;
use quantbot::types::{Bar, Fill, OrderRequest, Side, TradingPair};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

fn pair() -> TradingPair {
    TradingPair::new("BTC", "USDC")
}

struct PaperStack {
    bus: Arc<EventBus>,
    cache: Arc<MarketCache>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionTracker>>,
    execution: ExecutionEngine,
}

fn paper_stack() -> PaperStack {
    let bus = EventBus::new(EventBusConfig::default());
    let cache = MarketCache::new();

    // Book: best bid 49998, best ask 49999.
    let handle = cache.book("hyperliquid", &pair());
    handle.write().apply_snapshot(BookSnapshot {
        pair: pair(),
        bids: vec![BookLevel::new(dec!(49998), dec!(5))],
        asks: vec![BookLevel::new(dec!(49999), dec!(5))],
        seq: 1,
        ts: 1,
    });

    let orders = Arc::new(Mutex::new(OrderManager::new("hyperliquid", 10_000)));
    let positions = Arc::new(Mutex::new(PositionTracker::new("hyperliquid")));
    let simulator = SimulatedExecutor::new(
        "hyperliquid",
        cache.clone(),
        SimulatedExecutorConfig {
            slippage: Decimal::ZERO,
            fee_rate: dec!(0.0005),
        },
    );
    let execution = ExecutionEngine::new(
        "hyperliquid",
        ExecutionMode::Paper,
        None,
        Some(simulator),
        orders.clone(),
        positions.clone(),
        Arc::new(RiskEngine::new(RiskLimits::default())),
        cache.clone(),
        bus.clone(),
        quantbot::types::DecimalSpec::default(),
    );

    PaperStack {
        bus,
        cache,
        orders,
        positions,
        execution,
    }
}

#[tokio::test]
async fn test_single_limit_order_roundtrip() {
    let stack = paper_stack();
    let mut account_sub = stack.bus.subscribe("account.*");

    // Crossing buy limit at 50000 executes at the 49999 ask.
    let request = OrderRequest::limit("c1", pair(), Side::Buy, dec!(50000), dec!(0.001));
    let order = stack.execution.submit(request).await.unwrap();

    assert_eq!(order.state, OrderState::Filled);
    assert_eq!(order.filled_size, dec!(0.001));
    assert_eq!(order.avg_fill_price, dec!(49999));

    let position = stack.positions.lock().position(&pair()).unwrap();
    assert_eq!(position.size, dec!(0.001));
    assert_eq!(position.entry_price, dec!(49999));
    assert_eq!(position.realized_pnl, Decimal::ZERO);
    assert_eq!(position.cumulative_fees, dec!(49999) * dec!(0.001) * dec!(0.0005));

    // The paper path mirrors the live topic surface.
    let mut saw_order = false;
    let mut saw_fill = false;
    let mut saw_position = false;
    while let Some((_, event)) = account_sub.try_recv() {
        match event {
            BusEvent::Account(AccountEvent::OrderUpdate(o)) => {
                assert_eq!(o.client_id, "c1");
                saw_order = true;
            }
            BusEvent::Account(AccountEvent::Fill(f)) => {
                assert_eq!(f.size, dec!(0.001));
                saw_fill = true;
            }
            BusEvent::Account(AccountEvent::PositionSnapshot { size, .. }) => {
                assert_eq!(size, dec!(0.001));
                saw_position = true;
            }
            _ => {}
        }
    }
    assert!(saw_order && saw_fill && saw_position);
}

#[tokio::test]
async fn test_submit_is_idempotent_on_correlation_id() {
    let stack = paper_stack();
    let request = OrderRequest::market("dup-1", pair(), Side::Buy, dec!(0.5));

    let first = stack.execution.submit(request.clone()).await.unwrap();
    let second = stack.execution.submit(request).await.unwrap();

    assert_eq!(first.client_id, second.client_id);
    assert_eq!(stack.positions.lock().position(&pair()).unwrap().size, dec!(0.5));
    assert_eq!(stack.orders.lock().len(), 1);
}

#[test]
fn test_partial_fill_then_cancel() {
    let mut orders = OrderManager::new("hyperliquid", 10_000);
    let request = OrderRequest::limit("p1", pair(), Side::Buy, dec!(50000), dec!(1.0));
    orders.register(&request, 0);
    orders.mark_pending("p1", 0).unwrap();
    orders
        .on_ack("p1", &OrderAck::Resting { venue_order_id: 5 }, 1)
        .unwrap();

    let fill = Fill {
        fill_id: 1,
        client_id: "p1".into(),
        venue_order_id: 5,
        pair: pair(),
        side: Side::Buy,
        size: dec!(0.4),
        price: dec!(50000),
        fee: dec!(0.1),
        ts: 2,
    };
    let mut positions = PositionTracker::new("hyperliquid");
    assert!(matches!(orders.on_fill(&fill, 2), FillOutcome::Applied(_)));
    positions.on_fill(&fill);

    let (state, venue_id) = orders.request_cancel("p1", 3).unwrap();
    assert_eq!(state, OrderState::Canceling);
    let order = orders.on_cancel_confirmed(venue_id.unwrap(), 4).unwrap();

    assert_eq!(order.state, OrderState::Canceled);
    assert_eq!(order.filled_size, dec!(0.4));
    assert_eq!(positions.position(&pair()).unwrap().size, dec!(0.4));
}

#[test]
fn test_duplicate_fill_changes_state_once() {
    let mut orders = OrderManager::new("hyperliquid", 10_000);
    let mut positions = PositionTracker::new("hyperliquid");
    let request = OrderRequest::limit("d1", pair(), Side::Buy, dec!(100), dec!(1.0));
    orders.register(&request, 0);
    orders.mark_pending("d1", 0).unwrap();
    orders
        .on_ack("d1", &OrderAck::Resting { venue_order_id: 9 }, 1)
        .unwrap();

    let fill = Fill {
        fill_id: 42,
        client_id: "d1".into(),
        venue_order_id: 9,
        pair: pair(),
        side: Side::Buy,
        size: dec!(0.5),
        price: dec!(100),
        fee: dec!(0.05),
        ts: 2,
    };

    // First delivery applies; the duplicate is dropped before the ledger.
    assert!(matches!(orders.on_fill(&fill, 2), FillOutcome::Applied(_)));
    positions.on_fill(&fill);
    assert!(matches!(orders.on_fill(&fill, 3), FillOutcome::Duplicate));

    assert_eq!(orders.get("d1").unwrap().filled_size, dec!(0.5));
    assert_eq!(positions.position(&pair()).unwrap().size, dec!(0.5));
}

#[test]
fn test_overfill_clamp_then_reconciliation_restores_truth() {
    let mut orders = OrderManager::new("hyperliquid", 10_000);
    let request = OrderRequest::limit("o1", pair(), Side::Buy, dec!(100), dec!(1.0));
    orders.register(&request, 0);
    orders.mark_pending("o1", 0).unwrap();
    orders
        .on_ack("o1", &OrderAck::Resting { venue_order_id: 7 }, 1)
        .unwrap();

    // Malformed venue event: 1.5 filled on a 1.0 order.
    let fill = Fill {
        fill_id: 1,
        client_id: "o1".into(),
        venue_order_id: 7,
        pair: pair(),
        side: Side::Buy,
        size: dec!(1.5),
        price: dec!(100),
        fee: dec!(0.1),
        ts: 2,
    };
    match orders.on_fill(&fill, 2) {
        FillOutcome::Clamped(order) => {
            assert_eq!(order.filled_size, dec!(1.0));
            assert_eq!(order.state, OrderState::Filled);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert!(orders.needs_reconciliation());

    // The venue's open-order set no longer carries the order; reconciliation
    // leaves it terminal and clears the flag.
    let report = orders.reconcile(&[], 3);
    assert!(report.closed.is_empty());
    assert!(!orders.needs_reconciliation());
    assert_eq!(orders.get("o1").unwrap().state, OrderState::Filled);
}

#[test]
fn test_reconciliation_matches_venue_snapshot() {
    let mut orders = OrderManager::new("hyperliquid", 10_000);
    for (i, client_id) in ["a", "b"].iter().enumerate() {
        let request = OrderRequest::limit(*client_id, pair(), Side::Buy, dec!(100), dec!(1.0));
        orders.register(&request, 0);
        orders.mark_pending(client_id, 0).unwrap();
        orders
            .on_ack(
                client_id,
                &OrderAck::Resting {
                    venue_order_id: i as u64 + 1,
                },
                1,
            )
            .unwrap();
    }

    // Venue keeps order 1 and reports a foreign order 50.
    let venue_open = vec![
        VenueOrder {
            venue_order_id: 1,
            client_id: Some("a".into()),
            pair: pair(),
            side: Side::Buy,
            price: dec!(100),
            size: dec!(1.0),
            filled_size: dec!(0.25),
            ts: 10,
        },
        VenueOrder {
            venue_order_id: 50,
            client_id: None,
            pair: pair(),
            side: Side::Sell,
            price: dec!(110),
            size: dec!(2.0),
            filled_size: Decimal::ZERO,
            ts: 10,
        },
    ];
    orders.reconcile(&venue_open, 20);

    let open = orders.open_orders();
    let venue_ids: Vec<Option<u64>> = open.iter().map(|o| o.venue_order_id).collect();
    assert_eq!(open.len(), 2);
    assert!(venue_ids.contains(&Some(1)));
    assert!(venue_ids.contains(&Some(50)));
    // "b" vanished without fills: inferred canceled.
    assert_eq!(orders.get("b").unwrap().state, OrderState::Canceled);
    // The venue's cumulative fill on "a" was adopted.
    assert_eq!(orders.get("a").unwrap().filled_size, dec!(0.25));
}

fn scenario_config() -> BacktestConfig {
    BacktestConfig {
        strategy: "dual_ma".to_string(),
        params: StrategyParams::new()
            .with_value("fast_period", dec!(10))
            .with_value("slow_period", dec!(30))
            .with_value("order_size", dec!(1)),
        pairs: vec![pair()],
        initial_capital: dec!(10000),
        fee_rate: dec!(0.0005),
        slippage: SlippageModel::Proportional(dec!(0.0001)),
        bar_interval_ms: 60_000,
        risk: None,
        max_strategy_errors: 10,
    }
}

fn sine_series(count: usize) -> Vec<(TradingPair, Bar)> {
    synthetic_sine(&pair(), count, 0, 60_000, dec!(100), dec!(10), 120)
}

#[test]
fn test_backtest_determinism_100k_minute_bars() {
    let series = sine_series(100_000);

    let first = BacktestEngine::new(scenario_config(), Box::new(VecFeed::new(series.clone())))
        .run()
        .unwrap();
    let second = BacktestEngine::new(scenario_config(), Box::new(VecFeed::new(series)))
        .run()
        .unwrap();

    assert!(first.trade_count > 0);
    assert_eq!(first.fills, second.fills);
    assert_eq!(first.equity_curve, second.equity_curve);
    assert_eq!(first.final_equity, second.final_equity);
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn test_seeded_walk_backtest_is_deterministic() {
    use quantbot::backtest::SyntheticSeriesGenerator;

    let generate = || {
        SyntheticSeriesGenerator::new(1234).generate(&pair(), 10_000, 0, 60_000, dec!(100), dec!(2))
    };
    // The seed fully determines the series and therefore the run.
    assert_eq!(generate(), generate());

    let first = BacktestEngine::new(scenario_config(), Box::new(VecFeed::new(generate())))
        .run()
        .unwrap();
    let second = BacktestEngine::new(scenario_config(), Box::new(VecFeed::new(generate())))
        .run()
        .unwrap();
    assert_eq!(first.fills, second.fills);
    assert_eq!(first.fingerprint(), second.fingerprint());
}

#[test]
fn test_scalar_and_vectorized_paths_agree() {
    let series = sine_series(20_000);
    let bars: Vec<Bar> = series.iter().map(|(_, b)| *b).collect();

    let scalar = BacktestEngine::new(scenario_config(), Box::new(VecFeed::new(series)))
        .run()
        .unwrap();
    let vector = run_dual_ma(
        &pair(),
        &bars,
        &VectorizedDualMaConfig {
            fast_period: 10,
            slow_period: 30,
            order_size: dec!(1),
            initial_capital: dec!(10000),
            fee_rate: dec!(0.0005),
            slippage: dec!(0.0001),
            bar_interval_ms: 60_000,
        },
    );

    assert_eq!(scalar.trade_count, vector.trade_count);
    assert_eq!(scalar.final_equity, vector.final_equity);
    assert_eq!(scalar.equity_curve, vector.equity_curve);
}

#[test]
fn test_book_gap_discards_buffered_deltas_after_snapshot() {
    use quantbot::orderbook::{BookDelta, DeltaResult, OrderBook};

    let mut book = OrderBook::new(pair());
    let snapshot = |seq: u64| BookSnapshot {
        pair: pair(),
        bids: vec![BookLevel::new(dec!(100), dec!(1))],
        asks: vec![BookLevel::new(dec!(101), dec!(1))],
        seq,
        ts: seq as i64,
    };
    let delta = |seq: u64, price: Decimal| BookDelta {
        pair: pair(),
        bid_updates: vec![BookLevel::new(price, dec!(1))],
        ask_updates: vec![],
        seq,
        ts: seq as i64,
    };

    book.apply_snapshot(snapshot(10));
    assert_eq!(book.apply_delta(delta(11, dec!(99))), DeltaResult::Applied);
    assert_eq!(book.apply_delta(delta(13, dec!(98))), DeltaResult::GapDetected);
    assert_eq!(book.apply_delta(delta(14, dec!(97))), DeltaResult::Buffered);

    book.apply_snapshot(snapshot(20));
    assert_eq!(book.last_seq(), 20);
    assert_eq!(book.best_bid().unwrap().price, dec!(100));
    assert!(book.best_bid().unwrap().price < book.best_ask().unwrap().price);
}

#[tokio::test]
async fn test_kill_switch_blocks_submissions() {
    let bus = EventBus::new(EventBusConfig::default());
    let cache = MarketCache::new();
    let risk = Arc::new(RiskEngine::new(RiskLimits::default()));
    let simulator = SimulatedExecutor::new(
        "hyperliquid",
        cache.clone(),
        SimulatedExecutorConfig::default(),
    );
    let execution = ExecutionEngine::new(
        "hyperliquid",
        ExecutionMode::Paper,
        None,
        Some(simulator),
        Arc::new(Mutex::new(OrderManager::new("hyperliquid", 10_000))),
        Arc::new(Mutex::new(PositionTracker::new("hyperliquid"))),
        risk.clone(),
        cache,
        bus,
        quantbot::types::DecimalSpec::default(),
    );

    risk.engage_kill_switch();
    let request = OrderRequest::limit("k1", pair(), Side::Buy, dec!(100), dec!(1));
    assert!(matches!(
        execution.submit(request.clone()).await.unwrap_err(),
        quantbot::error::CoreError::RiskRejected(_)
    ));

    risk.clear_kill_switch();
    assert!(execution.submit(request).await.is_ok());
}
