//! RSI Reversal Strategy
//!
//! Buys when RSI recovers up through the oversold threshold and sells when it
//! falls back through the overbought threshold.

use crate::error::CoreResult;
use crate::strategy::indicators::Rsi;
use crate::strategy::{Strategy, StrategyContext, StrategyParams};
use crate::types::{Bar, Side, TradingPair};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::debug;

pub struct RsiReversalStrategy {
    period: usize,
    oversold: Decimal,
    overbought: Decimal,
    order_size: Decimal,
    rsi: HashMap<TradingPair, Rsi>,
    previous: HashMap<TradingPair, Decimal>,
}

impl RsiReversalStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        Self {
            period: params.get_usize("rsi_period", 14),
            oversold: params.get_or("oversold", dec!(30)),
            overbought: params.get_or("overbought", dec!(70)),
            order_size: params.get_or("order_size", dec!(1)),
            rsi: HashMap::new(),
            previous: HashMap::new(),
        }
    }
}

impl Strategy for RsiReversalStrategy {
    fn name(&self) -> &str {
        "rsi_reversal"
    }

    fn required_history(&self) -> usize {
        self.period + 1
    }

    fn on_bar(
        &mut self,
        ctx: &mut StrategyContext,
        pair: &TradingPair,
        bar: &Bar,
    ) -> CoreResult<()> {
        let period = self.period;
        let value = self
            .rsi
            .entry(pair.clone())
            .or_insert_with(|| Rsi::new(period))
            .update(bar.close);

        let Some(value) = value else {
            return Ok(());
        };
        let previous = self.previous.insert(pair.clone(), value);
        let Some(previous) = previous else {
            return Ok(());
        };

        let position = ctx.position_size(pair);

        // Recovery up through oversold: long entry.
        if previous < self.oversold && value >= self.oversold && position <= Decimal::ZERO {
            debug!(pair = %pair, rsi = %value, "oversold recovery");
            ctx.submit_market(pair.clone(), Side::Buy, self.order_size + position.abs());
        }
        // Rollover down through overbought: exit/short.
        else if previous > self.overbought && value <= self.overbought && position >= Decimal::ZERO
        {
            debug!(pair = %pair, rsi = %value, "overbought rollover");
            ctx.submit_market(pair.clone(), Side::Sell, self.order_size + position);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Intent;

    fn bar(close: Decimal) -> Bar {
        Bar {
            ts: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_oversold_recovery_triggers_buy() {
        let params = StrategyParams::new()
            .with_value("rsi_period", dec!(3))
            .with_value("order_size", dec!(2));
        let mut strategy = RsiReversalStrategy::new(&params);
        let pair = TradingPair::new("ETH", "USDC");
        let positions = HashMap::new();
        let marks = HashMap::new();
        let mut seq = 0u64;

        // Hard sell-off pins RSI near 0, then a bounce recovers through 30.
        let closes = [
            dec!(100),
            dec!(90),
            dec!(80),
            dec!(70),
            dec!(60),
            dec!(75),
            dec!(85),
        ];
        let mut intents = Vec::new();
        for close in closes {
            let mut ctx =
                StrategyContext::new("test", 0, &params, &positions, &marks, "r", &mut seq);
            strategy.on_bar(&mut ctx, &pair, &bar(close)).unwrap();
            intents.extend(ctx.take_intents());
        }

        let buys: Vec<_> = intents
            .iter()
            .filter(|intent| matches!(intent, Intent::Submit(req) if req.side == Side::Buy))
            .collect();
        assert_eq!(buys.len(), 1);
    }
}
