//! Backtest Engine
//!
//! Deterministic historical replay. Bars stream in (timestamp, symbol)
//! order; strategy orders route to the bar matcher; the order manager and
//! position tracker are updated exactly as in live trading. Given identical
//! input and configuration, two runs produce bit-identical fills and equity.

use crate::backtest::clock::SimClock;
use crate::backtest::feed::BacktestDataFeed;
use crate::backtest::matching::{BarMatcher, SlippageModel, SubmitResult};
use crate::backtest::report::{self, EquityPoint, PerformanceReport};
use crate::engine::orders::OrderManager;
use crate::engine::positions::{Position, PositionTracker};
use crate::error::{CoreError, CoreResult};
use crate::exchange::OrderAck;
use crate::risk::{RiskCheckResult, RiskEngine, RiskLimits};
use crate::strategy::{build_strategy, Intent, Strategy, StrategyContext, StrategyParams};
use crate::types::{Fill, OrderRequest, OrderType, TradingPair};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BACKTEST_VENUE: &str = "backtest";

/// Backtest run configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    pub strategy: String,
    pub params: StrategyParams,
    pub pairs: Vec<TradingPair>,
    pub initial_capital: Decimal,
    pub fee_rate: Decimal,
    pub slippage: SlippageModel,
    pub bar_interval_ms: i64,
    pub risk: Option<RiskLimits>,
    pub max_strategy_errors: u32,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            strategy: "dual_ma".to_string(),
            params: StrategyParams::new(),
            pairs: Vec::new(),
            initial_capital: Decimal::from(10_000u64),
            fee_rate: Decimal::new(5, 4),
            slippage: SlippageModel::Proportional(Decimal::new(1, 4)),
            bar_interval_ms: 60_000,
            risk: None,
            max_strategy_errors: 10,
        }
    }
}

/// Shared progress/cancellation handle, polled between bars.
#[derive(Debug, Default)]
pub struct BacktestProgress {
    processed: AtomicU64,
    total: AtomicU64,
    canceled: AtomicBool,
}

impl BacktestProgress {
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn fraction(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.processed() as f64 / total as f64
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }
}

/// Deterministic bar-replay engine.
pub struct BacktestEngine {
    config: BacktestConfig,
    feed: Box<dyn BacktestDataFeed>,
    progress: Arc<BacktestProgress>,
}

impl BacktestEngine {
    pub fn new(config: BacktestConfig, feed: Box<dyn BacktestDataFeed>) -> Self {
        Self {
            config,
            feed,
            progress: Arc::new(BacktestProgress::default()),
        }
    }

    pub fn progress_handle(&self) -> Arc<BacktestProgress> {
        self.progress.clone()
    }

    /// Run the replay to completion.
    pub fn run(mut self) -> CoreResult<PerformanceReport> {
        let mut strategy = build_strategy(&self.config.strategy, &self.config.params)?;
        let warmup = strategy.required_history();
        let risk = self.config.risk.clone().map(RiskEngine::new);

        if let Some(total) = self.feed.len_hint() {
            self.progress.total.store(total as u64, Ordering::Relaxed);
        }

        let mut state = RunState {
            orders: OrderManager::new(BACKTEST_VENUE, 10_000),
            positions: PositionTracker::new(BACKTEST_VENUE),
            matcher: BarMatcher::new(self.config.fee_rate, self.config.slippage),
            clock: SimClock::default(),
            marks: HashMap::new(),
            position_view: HashMap::new(),
            client_seq: 0,
            errors: 0,
            fills: Vec::new(),
            realized_deltas: Vec::new(),
            equity_curve: Vec::new(),
        };

        info!(
            strategy = %self.config.strategy,
            pairs = self.config.pairs.len(),
            warmup,
            "backtest starting"
        );

        // One-shot init; any intents it records are routed immediately.
        let init_intents = dispatch(
            &mut state,
            &self.config.params,
            self.config.max_strategy_errors,
            |strategy_ref, ctx| strategy_ref.on_init(ctx),
            strategy.as_mut(),
        )?;
        route_intents(&mut state, risk.as_ref(), init_intents);

        let mut bars_seen: HashMap<TradingPair, usize> = HashMap::new();

        while let Some((pair, bar)) = self.feed.next() {
            if self.progress.is_canceled() {
                info!("backtest canceled");
                return Err(CoreError::Canceled);
            }

            state.clock.advance_to(bar.ts);
            state.marks.insert(pair.clone(), bar.close);

            // Queued markets and touched limits fill against this bar first.
            let fills = state.matcher.on_bar(&pair, &bar, bar.ts);
            for fill in fills {
                apply_fill(&mut state, &fill);
                let follow_ups = dispatch_fill_callbacks(
                    &mut state,
                    &self.config.params,
                    self.config.max_strategy_errors,
                    strategy.as_mut(),
                    &fill,
                )?;
                route_intents(&mut state, risk.as_ref(), follow_ups);
            }

            // Bar callback; during warm-up the indicators advance but any
            // recorded intents are discarded.
            let seen = bars_seen
                .entry(pair.clone())
                .and_modify(|count| *count += 1)
                .or_insert(1);
            let live = *seen > warmup;

            let intents = dispatch(
                &mut state,
                &self.config.params,
                self.config.max_strategy_errors,
                |strategy_ref, ctx| strategy_ref.on_bar(ctx, &pair, &bar),
                strategy.as_mut(),
            )?;
            if live {
                route_intents(&mut state, risk.as_ref(), intents);
            } else if !intents.is_empty() {
                debug!(pair = %pair, count = intents.len(), "warm-up intents suppressed");
            }

            record_equity(&mut state, self.config.initial_capital, bar.ts);
            self.progress.processed.fetch_add(1, Ordering::Relaxed);
        }

        let stop_intents = dispatch(
            &mut state,
            &self.config.params,
            self.config.max_strategy_errors,
            |strategy_ref, ctx| strategy_ref.on_stop(ctx),
            strategy.as_mut(),
        )?;
        drop(stop_intents);

        info!(
            fills = state.fills.len(),
            bars = self.progress.processed(),
            "backtest complete"
        );

        Ok(report::compute(
            self.config.initial_capital,
            state.equity_curve,
            state.fills,
            &state.realized_deltas,
            self.config.bar_interval_ms,
        ))
    }
}

struct RunState {
    orders: OrderManager,
    positions: PositionTracker,
    matcher: BarMatcher,
    clock: SimClock,
    marks: HashMap<TradingPair, Decimal>,
    position_view: HashMap<TradingPair, Position>,
    client_seq: u64,
    errors: u32,
    fills: Vec<Fill>,
    realized_deltas: Vec<Decimal>,
    equity_curve: Vec<EquityPoint>,
}

fn dispatch<F>(
    state: &mut RunState,
    params: &StrategyParams,
    max_errors: u32,
    callback: F,
    strategy: &mut dyn Strategy,
) -> CoreResult<Vec<Intent>>
where
    F: FnOnce(&mut dyn Strategy, &mut StrategyContext) -> CoreResult<()>,
{
    let now = state.clock.now();
    let mut ctx = StrategyContext::new(
        BACKTEST_VENUE,
        now,
        params,
        &state.position_view,
        &state.marks,
        "bt",
        &mut state.client_seq,
    );
    match callback(strategy, &mut ctx) {
        Ok(()) => Ok(ctx.take_intents()),
        Err(e) => {
            state.errors += 1;
            warn!(error = %e, ts = now, errors = state.errors, "strategy callback failed");
            if state.errors > max_errors {
                return Err(CoreError::Validation(format!(
                    "strategy error threshold exceeded: {}",
                    e
                )));
            }
            Ok(Vec::new())
        }
    }
}

fn dispatch_fill_callbacks(
    state: &mut RunState,
    params: &StrategyParams,
    max_errors: u32,
    strategy: &mut dyn Strategy,
    fill: &Fill,
) -> CoreResult<Vec<Intent>> {
    let order_snapshot = state.orders.get(&fill.client_id).cloned();
    let mut intents = Vec::new();

    if let Some(order) = order_snapshot {
        intents.extend(dispatch(
            state,
            params,
            max_errors,
            |strategy_ref, ctx| strategy_ref.on_order_update(ctx, &order),
            strategy,
        )?);
    }
    intents.extend(dispatch(
        state,
        params,
        max_errors,
        |strategy_ref, ctx| strategy_ref.on_fill(ctx, fill),
        strategy,
    )?);
    Ok(intents)
}

fn apply_fill(state: &mut RunState, fill: &Fill) {
    state.orders.on_fill(fill, fill.ts);

    let realized_before = state
        .positions
        .position(&fill.pair)
        .map(|p| p.realized_pnl)
        .unwrap_or(Decimal::ZERO);
    let position = state.positions.on_fill(fill);
    let delta = position.realized_pnl - realized_before;
    if !delta.is_zero() {
        state.realized_deltas.push(delta);
    }

    state.position_view.insert(fill.pair.clone(), position);
    state.fills.push(fill.clone());
}

fn route_intents(state: &mut RunState, risk: Option<&RiskEngine>, intents: Vec<Intent>) {
    for intent in intents {
        match intent {
            Intent::Submit(request) => submit(state, risk, request),
            Intent::Cancel { client_id } => cancel(state, &client_id),
            Intent::CancelAll { pair } => {
                let open = state.orders.open_orders();
                for order in open {
                    if pair.as_ref().map(|p| &order.pair == p).unwrap_or(true) {
                        cancel(state, &order.client_id);
                    }
                }
            }
        }
    }
}

fn submit(state: &mut RunState, risk: Option<&RiskEngine>, request: OrderRequest) {
    if request.size <= Decimal::ZERO {
        warn!(client_id = %request.client_id, "dropping non-positive size order");
        return;
    }
    if request.order_type == OrderType::Limit && request.price.is_none() {
        warn!(client_id = %request.client_id, "dropping limit order without price");
        return;
    }
    if let Some(risk) = risk {
        let position = state.position_view.get(&request.pair);
        let mark = state.marks.get(&request.pair).copied();
        if let RiskCheckResult::Blocked(reason) = risk.check(&request, position, mark) {
            debug!(client_id = %request.client_id, reason = %reason, "risk blocked");
            return;
        }
    }

    let now = state.clock.now();
    let registered = state.orders.register(&request, now);
    if registered.existed {
        return;
    }
    let _ = state.orders.mark_pending(&request.client_id, now);

    let ack = match state.matcher.submit(request.clone()) {
        SubmitResult::QueuedMarket { venue_order_id }
        | SubmitResult::Resting { venue_order_id } => OrderAck::Resting { venue_order_id },
    };
    let _ = state.orders.on_ack(&request.client_id, &ack, now);
}

fn cancel(state: &mut RunState, client_id: &str) {
    let now = state.clock.now();
    match state.orders.request_cancel(client_id, now) {
        Ok((crate::engine::orders::OrderState::Canceling, _)) => {
            if let Some(venue_id) = state.matcher.cancel(client_id) {
                state.orders.on_cancel_confirmed(venue_id, now);
            }
        }
        Ok(_) => {}
        Err(e) => debug!(client_id, error = %e, "cancel on unknown order"),
    }
}

fn record_equity(state: &mut RunState, initial_capital: Decimal, ts: crate::types::TimestampMs) {
    let mut unrealized = Decimal::ZERO;
    for position in state.position_view.values() {
        if let Some(mark) = state.marks.get(&position.pair) {
            unrealized += position.unrealized_pnl(*mark);
        }
    }
    let equity = initial_capital + state.positions.total_realized_pnl()
        - state.positions.total_fees()
        + unrealized;
    state.equity_curve.push(EquityPoint { ts, equity });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::feed::{synthetic_sine, VecFeed};
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDC")
    }

    fn dual_ma_config() -> BacktestConfig {
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

    fn sine_feed(count: usize) -> Box<VecFeed> {
        Box::new(VecFeed::new(synthetic_sine(
            &pair(),
            count,
            0,
            60_000,
            dec!(100),
            dec!(10),
            50,
        )))
    }

    #[test]
    fn test_dual_ma_on_sine_wave_trades() {
        let engine = BacktestEngine::new(dual_ma_config(), sine_feed(500));
        let report = engine.run().unwrap();

        assert!(report.trade_count > 0, "sine wave must produce crossovers");
        assert_eq!(report.equity_curve.len(), 500);
        assert!(report.total_fees > Decimal::ZERO);
    }

    #[test]
    fn test_backtest_is_deterministic() {
        let first = BacktestEngine::new(dual_ma_config(), sine_feed(1_000))
            .run()
            .unwrap();
        let second = BacktestEngine::new(dual_ma_config(), sine_feed(1_000))
            .run()
            .unwrap();

        assert_eq!(first.fills, second.fills);
        assert_eq!(first.equity_curve, second.equity_curve);
        assert_eq!(first.final_equity, second.final_equity);
    }

    #[test]
    fn test_warmup_suppresses_trading() {
        // The whole series is shorter than the slow period: no trades.
        let engine = BacktestEngine::new(dual_ma_config(), sine_feed(25));
        let report = engine.run().unwrap();
        assert_eq!(report.trade_count, 0);
    }

    #[test]
    fn test_cancel_between_bars() {
        let engine = BacktestEngine::new(dual_ma_config(), sine_feed(100));
        let progress = engine.progress_handle();
        progress.cancel();
        assert!(matches!(engine.run(), Err(CoreError::Canceled)));
    }

    #[test]
    fn test_progress_reaches_total() {
        let engine = BacktestEngine::new(dual_ma_config(), sine_feed(200));
        let progress = engine.progress_handle();
        engine.run().unwrap();
        assert_eq!(progress.processed(), 200);
        assert_eq!(progress.total(), 200);
        assert!((progress.fraction() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_risk_limits_cap_position() {
        let mut config = dual_ma_config();
        config.risk = Some(RiskLimits {
            max_position_per_symbol: dec!(0.5),
            max_order_size: dec!(10),
            stop_loss_pct: None,
        });
        let report = BacktestEngine::new(config, sine_feed(500)).run().unwrap();
        // Orders of size 1 exceed the cap: nothing ever fills.
        assert_eq!(report.trade_count, 0);
    }
}
