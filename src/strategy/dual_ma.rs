//! Dual Moving-Average Crossover
//!
//! Golden cross (fast SMA rising through slow SMA) targets a long position,
//! death cross targets a short. Position changes are market orders sized to
//! flip the full target in one shot.

use crate::error::CoreResult;
use crate::strategy::indicators::Sma;
use crate::strategy::{Strategy, StrategyContext, StrategyParams};
use crate::types::{Bar, Side, TradingPair};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::debug;

pub struct DualMaStrategy {
    fast_period: usize,
    slow_period: usize,
    order_size: Decimal,
    /// Per-symbol indicator state.
    fast: HashMap<TradingPair, Sma>,
    slow: HashMap<TradingPair, Sma>,
    /// Sign of (fast - slow) after the previous bar.
    previous_diff: HashMap<TradingPair, Decimal>,
}

impl DualMaStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            fast_period: params.get_usize("fast_period", 10),
            slow_period: params.get_usize("slow_period", 30),
            order_size: params.get_or("order_size", dec!(1)),
            fast: HashMap::new(),
            slow: HashMap::new(),
            previous_diff: HashMap::new(),
        }
    }

    /// Size that moves the current net position to the target.
    fn rebalance(
        &self,
        ctx: &mut StrategyContext,
        pair: &TradingPair,
        target: Decimal,
    ) {
        let current = ctx.position_size(pair);
        let delta = target - current;
        if delta.is_zero() {
            return;
        }
        let side = if delta > Decimal::ZERO {
            Side::Buy
        } else {
            Side::Sell
        };
        ctx.submit_market(pair.clone(), side, delta.abs());
    }
}

impl Strategy for DualMaStrategy {
    fn name(&self) -> &str {
        "dual_ma"
    }

    fn required_history(&self) -> usize {
        self.slow_period
    }

    fn on_bar(
        &mut self,
        ctx: &mut StrategyContext,
        pair: &TradingPair,
        bar: &Bar,
    ) -> CoreResult<()> {
        let fast_period = self.fast_period;
        let slow_period = self.slow_period;
        let fast = self
            .fast
            .entry(pair.clone())
            .or_insert_with(|| Sma::new(fast_period))
            .update(bar.close);
        let slow = self
            .slow
            .entry(pair.clone())
            .or_insert_with(|| Sma::new(slow_period))
            .update(bar.close);

        let (Some(fast), Some(slow)) = (fast, slow) else {
            return Ok(());
        };

        let diff = fast - slow;
        let previous = self.previous_diff.insert(pair.clone(), diff);

        let Some(previous) = previous else {
            return Ok(());
        };

        if previous <= Decimal::ZERO && diff > Decimal::ZERO {
            debug!(pair = %pair, ts = bar.ts, "golden cross");
            self.rebalance(ctx, pair, self.order_size);
        } else if previous >= Decimal::ZERO && diff < Decimal::ZERO {
            debug!(pair = %pair, ts = bar.ts, "death cross");
            self.rebalance(ctx, pair, -self.order_size);
        }
        Ok(())
    }
}
