//! Grid Strategy
//!
//! Rests limit buys below price and limit sells above it on an evenly spaced
//! grid. A filled level re-arms on the adjacent level: a bought level places
//! a sell one step up, a sold level places a buy one step down.

use crate::error::CoreResult;
use crate::strategy::{Strategy, StrategyContext, StrategyParams};
use crate::types::{Bar, Fill, Side, TradingPair};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::debug;

struct GridState {
    /// Live order client id -> (level index, side).
    orders: HashMap<String, (usize, Side)>,
}

pub struct GridStrategy {
    lower: Decimal,
    upper: Decimal,
    levels: usize,
    order_size: Decimal,
    state: HashMap<TradingPair, GridState>,
}

impl GridStrategy {
    pub fn new(params: &StrategyParams) -> Self {
        let lower = params.get_or("lower_price", dec!(0));
        let upper = params.get_or("upper_price", dec!(0));
        Self {
            lower,
            upper: upper.max(lower),
            levels: params.get_usize("grid_levels", 10).max(2),
            order_size: params.get_or("order_size", dec!(1)),
            state: HashMap::new(),
        }
    }

    fn level_price(&self, index: usize) -> Decimal {
        let step = (self.upper - self.lower) / Decimal::from(self.levels as u64 - 1);
        self.lower + step * Decimal::from(index as u64)
    }

    fn desired_side(&self, index: usize, reference: Decimal) -> Option<Side> {
        let price = self.level_price(index);
        if price < reference {
            Some(Side::Buy)
        } else if price > reference {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

impl Strategy for GridStrategy {
    fn name(&self) -> &str {
        "grid"
    }

    fn on_bar(
        &mut self,
        ctx: &mut StrategyContext,
        pair: &TradingPair,
        bar: &Bar,
    ) -> CoreResult<()> {
        if self.upper <= self.lower {
            return Ok(());
        }

        let mut covered = vec![false; self.levels];
        if let Some(state) = self.state.get(pair) {
            for (level, _) in state.orders.values() {
                if *level < covered.len() {
                    covered[*level] = true;
                }
            }
        }

        let mut placements: Vec<(usize, Side, Decimal)> = Vec::new();
        for index in 0..self.levels {
            if covered[index] {
                continue;
            }
            let price = self.level_price(index);
            if let Some(side) = self.desired_side(index, bar.close) {
                placements.push((index, side, price));
            }
        }

        let state = self
            .state
            .entry(pair.clone())
            .or_insert_with(|| GridState {
                orders: HashMap::new(),
            });
        for (index, side, price) in placements {
            let client_id = ctx.submit_limit(pair.clone(), side, price, self.order_size);
            state.orders.insert(client_id, (index, side));
            debug!(pair = %pair, index, side = %side, price = %price, "grid level armed");
        }
        Ok(())
    }

    fn on_fill(&mut self, ctx: &mut StrategyContext, fill: &Fill) -> CoreResult<()> {
        let removed = self
            .state
            .get_mut(&fill.pair)
            .and_then(|state| state.orders.remove(&fill.client_id));
        let Some((level, side)) = removed else {
            return Ok(());
        };

        // Re-arm the adjacent level on the opposite side.
        let next = match side {
            Side::Buy if level + 1 < self.levels => Some((level + 1, Side::Sell)),
            Side::Sell if level > 0 => Some((level - 1, Side::Buy)),
            _ => None,
        };
        if let Some((index, side)) = next {
            let price = self.level_price(index);
            let client_id = ctx.submit_limit(fill.pair.clone(), side, price, self.order_size);
            if let Some(state) = self.state.get_mut(&fill.pair) {
                state.orders.insert(client_id, (index, side));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Intent;
    use crate::types::OrderType;

    fn params() -> StrategyParams {
        StrategyParams::new()
            .with_value("lower_price", dec!(90))
            .with_value("upper_price", dec!(110))
            .with_value("grid_levels", dec!(5))
            .with_value("order_size", dec!(1))
    }

    fn bar(close: Decimal) -> Bar {
        Bar {
            ts: 60_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
        }
    }

    #[test]
    fn test_grid_places_buys_below_and_sells_above() {
        let params = params();
        let mut strategy = GridStrategy::new(&params);
        let pair = TradingPair::new("BTC", "USDC");
        let positions = HashMap::new();
        let marks = HashMap::new();
        let mut seq = 0u64;
        let mut ctx =
            StrategyContext::new("test", 0, &params, &positions, &marks, "g", &mut seq);

        strategy.on_bar(&mut ctx, &pair, &bar(dec!(100))).unwrap();
        let intents = ctx.take_intents();

        // Levels: 90, 95, 100, 105, 110. 100 == close is skipped.
        let mut buys = 0;
        let mut sells = 0;
        for intent in &intents {
            match intent {
                Intent::Submit(req) => {
                    assert_eq!(req.order_type, OrderType::Limit);
                    match req.side {
                        Side::Buy => {
                            assert!(req.price.unwrap() < dec!(100));
                            buys += 1;
                        }
                        Side::Sell => {
                            assert!(req.price.unwrap() > dec!(100));
                            sells += 1;
                        }
                    }
                }
                other => panic!("unexpected intent: {:?}", other),
            }
        }
        assert_eq!(buys, 2);
        assert_eq!(sells, 2);
    }

    #[test]
    fn test_levels_not_duplicated_across_bars() {
        let params = params();
        let mut strategy = GridStrategy::new(&params);
        let pair = TradingPair::new("BTC", "USDC");
        let positions = HashMap::new();
        let marks = HashMap::new();
        let mut seq = 0u64;

        let mut first = StrategyContext::new("test", 0, &params, &positions, &marks, "g", &mut seq);
        strategy.on_bar(&mut first, &pair, &bar(dec!(100))).unwrap();
        assert_eq!(first.take_intents().len(), 4);

        let mut second =
            StrategyContext::new("test", 1, &params, &positions, &marks, "g", &mut seq);
        strategy.on_bar(&mut second, &pair, &bar(dec!(100))).unwrap();
        assert!(second.take_intents().is_empty());
    }

    #[test]
    fn test_fill_rearms_adjacent_level() {
        let params = params();
        let mut strategy = GridStrategy::new(&params);
        let pair = TradingPair::new("BTC", "USDC");
        let positions = HashMap::new();
        let marks = HashMap::new();
        let mut seq = 0u64;

        let mut ctx = StrategyContext::new("test", 0, &params, &positions, &marks, "g", &mut seq);
        strategy.on_bar(&mut ctx, &pair, &bar(dec!(100))).unwrap();
        let intents = ctx.take_intents();

        // Find the buy at 95 (level 1).
        let buy_id = intents
            .iter()
            .find_map(|intent| match intent {
                Intent::Submit(req)
                    if req.side == Side::Buy && req.price == Some(dec!(95)) =>
                {
                    Some(req.client_id.clone())
                }
                _ => None,
            })
            .unwrap();

        let fill = Fill {
            fill_id: 1,
            client_id: buy_id,
            venue_order_id: 1,
            pair: pair.clone(),
            side: Side::Buy,
            size: dec!(1),
            price: dec!(95),
            fee: dec!(0),
            ts: 1,
        };
        let mut ctx = StrategyContext::new("test", 2, &params, &positions, &marks, "g", &mut seq);
        strategy.on_fill(&mut ctx, &fill).unwrap();
        let rearm = ctx.take_intents();

        assert_eq!(rearm.len(), 1);
        match &rearm[0] {
            Intent::Submit(req) => {
                assert_eq!(req.side, Side::Sell);
                assert_eq!(req.price, Some(dec!(100)));
            }
            other => panic!("unexpected intent: {:?}", other),
        }
    }
}
