//! Execution Engine
//!
//! The single gate between strategies and the venue. Validates intents,
//! applies the pre-trade risk check, and routes to the signed adapter path
//! (live) or the simulated executor (paper). Submission is idempotent on the
//! client correlation id - a repeated id returns the existing order and
//! never produces a second venue call.

use crate::bus::EventBus;
use crate::cache::MarketCache;
use crate::engine::orders::{Order, OrderManager, OrderState};
use crate::engine::positions::PositionTracker;
use crate::engine::simulated::SimulatedExecutor;
use crate::error::{CoreError, CoreResult};
use crate::events::{topics, AccountEvent, BusEvent};
use crate::exchange::{ExchangeAdapter, OrderAck};
use crate::risk::{RiskCheckResult, RiskEngine};
use crate::types::{now_ms, DecimalSpec, OrderRequest, OrderType, TimestampMs, TradingPair};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};

/// How strategy intents reach a fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Live,
    Paper,
}

pub struct ExecutionEngine {
    venue: String,
    mode: ExecutionMode,
    adapter: Option<Arc<dyn ExchangeAdapter>>,
    simulator: Option<SimulatedExecutor>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionTracker>>,
    risk: Arc<RiskEngine>,
    cache: Arc<MarketCache>,
    bus: Arc<EventBus>,
    decimal_spec: DecimalSpec,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: impl Into<String>,
        mode: ExecutionMode,
        adapter: Option<Arc<dyn ExchangeAdapter>>,
        simulator: Option<SimulatedExecutor>,
        orders: Arc<Mutex<OrderManager>>,
        positions: Arc<Mutex<PositionTracker>>,
        risk: Arc<RiskEngine>,
        cache: Arc<MarketCache>,
        bus: Arc<EventBus>,
        decimal_spec: DecimalSpec,
    ) -> Self {
        Self {
            venue: venue.into(),
            mode,
            adapter,
            simulator,
            orders,
            positions,
            risk,
            cache,
            bus,
            decimal_spec,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Snapshot of all tracked positions.
    pub fn all_positions(&self) -> Vec<crate::engine::positions::Position> {
        self.positions.lock().all()
    }

    /// Snapshot of all open orders.
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders.lock().open_orders()
    }

    /// Submit an intent. Returns the current order record; re-submitting the
    /// same correlation id returns the existing record without a venue call.
    pub async fn submit(&self, request: OrderRequest) -> CoreResult<Order> {
        self.validate(&request)?;

        let position = self
            .positions
            .lock()
            .position(&request.pair);
        let mark = self
            .cache
            .ticker(&self.venue, &request.pair)
            .map(|t| t.value.mark);
        if let RiskCheckResult::Blocked(reason) = self.risk.check(&request, position.as_ref(), mark)
        {
            warn!(client_id = %request.client_id, reason = %reason, "risk rejected");
            return Err(CoreError::RiskRejected(reason.to_string()));
        }

        let now = now_ms();
        let registered = self.orders.lock().register(&request, now);
        if registered.existed {
            info!(
                client_id = %request.client_id,
                "duplicate submission; returning existing order"
            );
            return Ok(registered.order);
        }
        self.orders.lock().mark_pending(&request.client_id, now)?;

        match self.mode {
            ExecutionMode::Live => self.submit_live(request, now).await,
            ExecutionMode::Paper => self.submit_paper(request, now).await,
        }
    }

    async fn submit_live(&self, request: OrderRequest, now: TimestampMs) -> CoreResult<Order> {
        let adapter = self
            .adapter
            .as_ref()
            .ok_or_else(|| CoreError::Validation("no adapter configured for live mode".into()))?;

        match adapter.submit_order(&request).await {
            Ok(ack) => {
                let order = self.orders.lock().on_ack(&request.client_id, &ack, now_ms())?;
                self.publish_order(order.clone()).await;
                Ok(order)
            }
            Err(e) if e.is_retryable() => {
                // The wire attempt may or may not have landed: leave the order
                // PENDING and let the ack timeout drive it into UNKNOWN for
                // reconciliation. Retrying here could double-submit.
                warn!(client_id = %request.client_id, error = %e, "submit outcome unknown");
                self.orders.lock().schedule_reconciliation();
                Err(e)
            }
            Err(e) => {
                let ack = OrderAck::Rejected {
                    reason: e.to_string(),
                };
                let order = self.orders.lock().on_ack(&request.client_id, &ack, now)?;
                self.publish_order(order).await;
                Err(e)
            }
        }
    }

    async fn submit_paper(&self, request: OrderRequest, now: TimestampMs) -> CoreResult<Order> {
        let simulator = self
            .simulator
            .as_ref()
            .ok_or_else(|| CoreError::Validation("no simulator configured for paper mode".into()))?;

        let (ack, fill) = simulator.execute(&request, now)?;
        let order_snapshot;
        let position_snapshot;
        {
            let mut orders = self.orders.lock();
            orders.on_ack(&request.client_id, &ack, now)?;
            orders.on_fill(&fill, now);
            order_snapshot = orders
                .get(&request.client_id)
                .cloned()
                .ok_or_else(|| CoreError::OrderNotFound(request.client_id.clone()))?;
            let open = orders.open_orders();
            self.cache.set_open_orders(&self.venue, open, now);
        }
        {
            let mut positions = self.positions.lock();
            position_snapshot = positions.on_fill(&fill);
        }
        self.cache.set_position(&self.venue, position_snapshot.clone());

        // Mirror the live topic surface for observers.
        self.publish_order(order_snapshot.clone()).await;
        let _ = self
            .bus
            .publish(
                &topics::account_fill(&self.venue),
                BusEvent::Account(AccountEvent::Fill(fill)),
            )
            .await;
        let _ = self
            .bus
            .publish(
                &topics::account_position(&self.venue),
                BusEvent::Account(AccountEvent::PositionSnapshot {
                    pair: position_snapshot.pair.clone(),
                    size: position_snapshot.size,
                    entry_price: position_snapshot.entry_price,
                    leverage: position_snapshot.leverage,
                    margin_used: position_snapshot.margin_used,
                    ts: now,
                }),
            )
            .await;

        Ok(order_snapshot)
    }

    /// Cancel by correlation id. Terminal orders are a no-op returning the
    /// current state.
    pub async fn cancel(&self, client_id: &str) -> CoreResult<OrderState> {
        let (state, venue_order_id) = self.orders.lock().request_cancel(client_id, now_ms())?;
        if state.is_terminal() {
            return Ok(state);
        }

        match self.mode {
            ExecutionMode::Live => {
                if let (Some(adapter), Some(venue_id)) = (self.adapter.as_ref(), venue_order_id) {
                    let pair = self
                        .orders
                        .lock()
                        .get(client_id)
                        .map(|o| o.pair.clone())
                        .ok_or_else(|| CoreError::OrderNotFound(client_id.to_string()))?;
                    adapter.cancel_order(&pair, venue_id).await?;
                }
                // Confirmation arrives on the user stream.
            }
            ExecutionMode::Paper => {
                if let Some(venue_id) = venue_order_id {
                    let confirmed = self.orders.lock().on_cancel_confirmed(venue_id, now_ms());
                    if let Some(order) = confirmed {
                        self.publish_order(order).await;
                    }
                }
            }
        }
        Ok(OrderState::Canceling)
    }

    /// Cancel all open orders, optionally scoped to one pair.
    pub async fn cancel_all(&self, pair: Option<&TradingPair>) -> CoreResult<usize> {
        let open = self.orders.lock().open_orders();
        let targets: Vec<Order> = open
            .into_iter()
            .filter(|o| pair.map(|p| &o.pair == p).unwrap_or(true))
            .collect();

        if self.mode == ExecutionMode::Live {
            if let Some(adapter) = self.adapter.as_ref() {
                adapter.cancel_all_orders(pair).await?;
            }
        }
        let count = targets.len();
        for order in targets {
            if self.mode == ExecutionMode::Paper {
                if let Some(venue_id) = order.venue_order_id {
                    self.orders.lock().on_cancel_confirmed(venue_id, now_ms());
                }
            }
        }
        Ok(count)
    }

    fn validate(&self, request: &OrderRequest) -> CoreResult<()> {
        if request.client_id.is_empty() {
            return Err(CoreError::Validation("missing client order id".into()));
        }
        if request.size <= Decimal::ZERO {
            return Err(CoreError::Validation(format!(
                "order size must be positive, got {}",
                request.size
            )));
        }
        if self.decimal_spec.quantize_size(request.size) != request.size {
            return Err(CoreError::Validation(format!(
                "size {} exceeds configured precision",
                request.size
            )));
        }
        match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    CoreError::Validation("limit order requires a price".into())
                })?;
                if price <= Decimal::ZERO {
                    return Err(CoreError::Validation(format!(
                        "limit price must be positive, got {}",
                        price
                    )));
                }
                if self.decimal_spec.quantize_price(price) != price {
                    return Err(CoreError::Validation(format!(
                        "price {} exceeds configured precision",
                        price
                    )));
                }
            }
            OrderType::Market => {}
        }
        Ok(())
    }

    async fn publish_order(&self, order: Order) {
        let _ = self
            .bus
            .publish(
                &topics::account_order(&self.venue),
                BusEvent::Account(AccountEvent::OrderUpdate(order)),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBusConfig;
    use crate::engine::simulated::SimulatedExecutorConfig;
    use crate::risk::RiskLimits;
    use crate::types::{Side, Ticker};
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDC")
    }

    fn paper_engine() -> ExecutionEngine {
        let cache = MarketCache::new();
        cache.set_ticker(
            "hyperliquid",
            Ticker {
                pair: pair(),
                mark: dec!(100),
                bid: Some(dec!(99)),
                ask: Some(dec!(101)),
                ts: 1,
            },
        );
        let simulator = SimulatedExecutor::new(
            "hyperliquid",
            cache.clone(),
            SimulatedExecutorConfig {
                slippage: Decimal::ZERO,
                fee_rate: dec!(0.001),
            },
        );
        ExecutionEngine::new(
            "hyperliquid",
            ExecutionMode::Paper,
            None,
            Some(simulator),
            Arc::new(Mutex::new(OrderManager::new("hyperliquid", 10_000))),
            Arc::new(Mutex::new(PositionTracker::new("hyperliquid"))),
            Arc::new(RiskEngine::new(RiskLimits::default())),
            cache,
            EventBus::new(EventBusConfig::default()),
            DecimalSpec::default(),
        )
    }

    #[tokio::test]
    async fn test_paper_submit_fills_immediately() {
        let engine = paper_engine();
        let request = OrderRequest::market("c1", pair(), Side::Buy, dec!(2));

        let order = engine.submit(request).await.unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.filled_size, dec!(2));

        let position = engine.positions.lock().position(&pair()).unwrap();
        assert_eq!(position.size, dec!(2));
    }

    #[tokio::test]
    async fn test_duplicate_correlation_id_returns_existing() {
        let engine = paper_engine();
        let request = OrderRequest::market("c1", pair(), Side::Buy, dec!(1));

        let first = engine.submit(request.clone()).await.unwrap();
        let second = engine.submit(request).await.unwrap();
        assert_eq!(first.client_id, second.client_id);

        // A single fill: position did not double.
        let position = engine.positions.lock().position(&pair()).unwrap();
        assert_eq!(position.size, dec!(1));
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_intents() {
        let engine = paper_engine();

        let zero_size = OrderRequest::market("c1", pair(), Side::Buy, dec!(0));
        assert!(matches!(
            engine.submit(zero_size).await.unwrap_err(),
            CoreError::Validation(_)
        ));

        let mut no_price = OrderRequest::limit("c2", pair(), Side::Buy, dec!(1), dec!(1));
        no_price.price = None;
        assert!(matches!(
            engine.submit(no_price).await.unwrap_err(),
            CoreError::Validation(_)
        ));

        let negative_price = OrderRequest::limit("c3", pair(), Side::Buy, dec!(-5), dec!(1));
        assert!(matches!(
            engine.submit(negative_price).await.unwrap_err(),
            CoreError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_risk_rejection_never_reaches_execution() {
        let cache = MarketCache::new();
        let simulator = SimulatedExecutor::new(
            "hyperliquid",
            cache.clone(),
            SimulatedExecutorConfig::default(),
        );
        let risk = Arc::new(RiskEngine::new(RiskLimits {
            max_order_size: dec!(1),
            ..Default::default()
        }));
        let orders = Arc::new(Mutex::new(OrderManager::new("hyperliquid", 10_000)));
        let engine = ExecutionEngine::new(
            "hyperliquid",
            ExecutionMode::Paper,
            None,
            Some(simulator),
            orders.clone(),
            Arc::new(Mutex::new(PositionTracker::new("hyperliquid"))),
            risk,
            cache,
            EventBus::new(EventBusConfig::default()),
            DecimalSpec::default(),
        );

        let request = OrderRequest::market("c1", pair(), Side::Buy, dec!(5));
        assert!(matches!(
            engine.submit(request).await.unwrap_err(),
            CoreError::RiskRejected(_)
        ));
        // Nothing was registered.
        assert!(orders.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_terminal_order_is_noop() {
        let engine = paper_engine();
        let request = OrderRequest::market("c1", pair(), Side::Buy, dec!(1));
        engine.submit(request).await.unwrap();

        let state = engine.cancel("c1").await.unwrap();
        assert_eq!(state, OrderState::Filled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_order_not_found() {
        let engine = paper_engine();
        assert!(matches!(
            engine.cancel("missing").await.unwrap_err(),
            CoreError::OrderNotFound(_)
        ));
    }
}
