//! Strategy Interface
//!
//! One trait hosts any strategy in any mode - live, paper, or backtest see
//! identical callbacks and submit through the same context. Callbacks must
//! not block on I/O: they record intents which the host routes to the
//! execution engine after the callback returns.

pub mod dual_ma;
pub mod grid;
pub mod indicators;
pub mod rsi_reversal;

use crate::engine::orders::Order;
use crate::engine::positions::Position;
use crate::error::{CoreError, CoreResult};
use crate::orderbook::BookSnapshot;
use crate::types::{Bar, Fill, OrderRequest, Side, Ticker, TimestampMs, TradingPair};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;

/// Strategy parameters, loaded from config or an API request body.
#[derive(Debug, Clone, Default)]
pub struct StrategyParams {
    values: HashMap<String, Decimal>,
    strings: HashMap<String, String>,
}

impl StrategyParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, key: impl Into<String>, value: Decimal) -> Self {
        self.values.insert(key.into(), value);
        self
    }

    pub fn with_string(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.strings.insert(key.into(), value.into());
        self
    }

    /// Extract numeric and string parameters from a JSON object. Numbers are
    /// parsed through their decimal literal, not via binary floats.
    pub fn from_json(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut params = Self::new();
        for (key, value) in object {
            match value {
                serde_json::Value::Number(n) => {
                    if let Ok(decimal) = Decimal::from_str(&n.to_string()) {
                        params.values.insert(key.clone(), decimal);
                    }
                }
                serde_json::Value::String(s) => {
                    if let Ok(decimal) = Decimal::from_str(s) {
                        params.values.insert(key.clone(), decimal);
                    } else {
                        params.strings.insert(key.clone(), s.clone());
                    }
                }
                _ => {}
            }
        }
        params
    }

    pub fn get(&self, key: &str) -> Option<Decimal> {
        self.values.get(key).copied()
    }

    pub fn get_or(&self, key: &str, default: Decimal) -> Decimal {
        self.values.get(key).copied().unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        use rust_decimal::prelude::ToPrimitive;
        self.values
            .get(key)
            .and_then(|d| d.to_usize())
            .unwrap_or(default)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(|s| s.as_str())
    }
}

/// An action recorded by a strategy callback, routed by the host afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    Submit(OrderRequest),
    Cancel { client_id: String },
    CancelAll { pair: Option<TradingPair> },
}

/// Per-callback view of the world plus the order-submission surface.
pub struct StrategyContext<'a> {
    pub venue: &'a str,
    pub now: TimestampMs,
    pub params: &'a StrategyParams,
    positions: &'a HashMap<TradingPair, Position>,
    marks: &'a HashMap<TradingPair, Decimal>,
    intents: Vec<Intent>,
    id_prefix: &'a str,
    client_seq: &'a mut u64,
}

impl<'a> StrategyContext<'a> {
    pub fn new(
        venue: &'a str,
        now: TimestampMs,
        params: &'a StrategyParams,
        positions: &'a HashMap<TradingPair, Position>,
        marks: &'a HashMap<TradingPair, Decimal>,
        id_prefix: &'a str,
        client_seq: &'a mut u64,
    ) -> Self {
        Self {
            venue,
            now,
            params,
            positions,
            marks,
            intents: Vec::new(),
            id_prefix,
            client_seq,
        }
    }

    /// Net position for a pair, if any.
    pub fn position(&self, pair: &TradingPair) -> Option<&Position> {
        self.positions.get(pair)
    }

    pub fn position_size(&self, pair: &TradingPair) -> Decimal {
        self.positions
            .get(pair)
            .map(|p| p.size)
            .unwrap_or(Decimal::ZERO)
    }

    /// Latest mark price for a pair, if any.
    pub fn mark(&self, pair: &TradingPair) -> Option<Decimal> {
        self.marks.get(pair).copied()
    }

    /// Deterministic per-runner correlation id.
    pub fn next_client_id(&mut self) -> String {
        *self.client_seq += 1;
        format!("{}-{}", self.id_prefix, self.client_seq)
    }

    pub fn submit_limit(
        &mut self,
        pair: TradingPair,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> String {
        let client_id = self.next_client_id();
        self.intents.push(Intent::Submit(OrderRequest::limit(
            client_id.clone(),
            pair,
            side,
            price,
            size,
        )));
        client_id
    }

    pub fn submit_market(&mut self, pair: TradingPair, side: Side, size: Decimal) -> String {
        let client_id = self.next_client_id();
        self.intents.push(Intent::Submit(OrderRequest::market(
            client_id.clone(),
            pair,
            side,
            size,
        )));
        client_id
    }

    pub fn submit(&mut self, request: OrderRequest) {
        self.intents.push(Intent::Submit(request));
    }

    pub fn cancel(&mut self, client_id: impl Into<String>) {
        self.intents.push(Intent::Cancel {
            client_id: client_id.into(),
        });
    }

    pub fn cancel_all(&mut self, pair: Option<TradingPair>) {
        self.intents.push(Intent::CancelAll { pair });
    }

    pub fn take_intents(self) -> Vec<Intent> {
        self.intents
    }
}

/// The capability set every strategy implements. All callbacks default to
/// no-ops except `on_bar`; errors are contained by the host and counted
/// against the configured threshold.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    /// Bars to consume before trading callbacks begin (indicator warm-up).
    fn required_history(&self) -> usize {
        0
    }

    /// Book updates are delivered only when a strategy opts in.
    fn wants_orderbook(&self) -> bool {
        false
    }

    fn on_init(&mut self, _ctx: &mut StrategyContext) -> CoreResult<()> {
        Ok(())
    }

    fn on_bar(&mut self, ctx: &mut StrategyContext, pair: &TradingPair, bar: &Bar)
        -> CoreResult<()>;

    fn on_ticker(&mut self, _ctx: &mut StrategyContext, _ticker: &Ticker) -> CoreResult<()> {
        Ok(())
    }

    fn on_orderbook(&mut self, _ctx: &mut StrategyContext, _book: &BookSnapshot) -> CoreResult<()> {
        Ok(())
    }

    fn on_order_update(&mut self, _ctx: &mut StrategyContext, _order: &Order) -> CoreResult<()> {
        Ok(())
    }

    fn on_fill(&mut self, _ctx: &mut StrategyContext, _fill: &Fill) -> CoreResult<()> {
        Ok(())
    }

    fn on_stop(&mut self, _ctx: &mut StrategyContext) -> CoreResult<()> {
        Ok(())
    }
}

/// Strategy names the factory can build.
pub fn available_strategies() -> Vec<&'static str> {
    vec!["dual_ma", "grid", "rsi_reversal"]
}

/// Build a registered strategy by name.
pub fn build_strategy(name: &str, params: &StrategyParams) -> CoreResult<Box<dyn Strategy>> {
    match name {
        "dual_ma" => Ok(Box::new(dual_ma::DualMaStrategy::new(params))),
        "grid" => Ok(Box::new(grid::GridStrategy::new(params))),
        "rsi_reversal" => Ok(Box::new(rsi_reversal::RsiReversalStrategy::new(params))),
        other => Err(CoreError::Validation(format!(
            "unknown strategy '{}', available: {}",
            other,
            available_strategies().join(", ")
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_params_from_json() {
        let raw = serde_json::json!({
            "fast_period": 10,
            "order_size": "0.5",
            "symbol": "BTC-USDC",
            "nested": {"ignored": true}
        });
        let params = StrategyParams::from_json(raw.as_object().unwrap());
        assert_eq!(params.get("fast_period"), Some(dec!(10)));
        assert_eq!(params.get("order_size"), Some(dec!(0.5)));
        assert_eq!(params.get_string("symbol"), Some("BTC-USDC"));
        assert_eq!(params.get_usize("fast_period", 3), 10);
        assert_eq!(params.get_usize("missing", 3), 3);
    }

    #[test]
    fn test_context_generates_sequential_ids() {
        let params = StrategyParams::new();
        let positions = HashMap::new();
        let marks = HashMap::new();
        let mut seq = 0u64;
        let mut ctx = StrategyContext::new(
            "hyperliquid",
            1_000,
            &params,
            &positions,
            &marks,
            "runner-1",
            &mut seq,
        );

        let pair = TradingPair::new("BTC", "USDC");
        let first = ctx.submit_market(pair.clone(), Side::Buy, dec!(1));
        let second = ctx.submit_limit(pair, Side::Sell, dec!(101), dec!(1));
        assert_eq!(first, "runner-1-1");
        assert_eq!(second, "runner-1-2");
        assert_eq!(ctx.take_intents().len(), 2);
    }

    #[test]
    fn test_factory_rejects_unknown() {
        let err = build_strategy("no_such", &StrategyParams::new()).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
