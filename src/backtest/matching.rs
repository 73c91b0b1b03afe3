//! Bar-Model Matching
//!
//! Simulated execution against OHLCV bars. Market orders queue and fill at
//! the next bar's open plus slippage; resting limits fill when a bar's range
//! touches the limit price, at the limit price. Fees are proportional per
//! fill. All ids are locally minted counters so replays are deterministic.

use crate::types::{Bar, Fill, OrderRequest, OrderType, Side, TimestampMs, TradingPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Slippage model applied to aggressive fills.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "model", content = "value")]
pub enum SlippageModel {
    /// Absolute price offset.
    Fixed(Decimal),
    /// Fraction of the reference price.
    Proportional(Decimal),
    /// Impact scaled by order size relative to bar volume.
    Book(Decimal),
}

impl SlippageModel {
    pub fn apply(&self, side: Side, price: Decimal, size: Decimal, bar_volume: Decimal) -> Decimal {
        let offset = match self {
            SlippageModel::Fixed(abs) => *abs,
            SlippageModel::Proportional(fraction) => price * fraction,
            SlippageModel::Book(fraction) => {
                if bar_volume.is_zero() {
                    price * fraction
                } else {
                    price * fraction * (size / bar_volume)
                }
            }
        };
        match side {
            Side::Buy => price + offset,
            Side::Sell => price - offset,
        }
    }
}

/// One simulated resting or queued order.
#[derive(Debug, Clone)]
struct SimOrder {
    request: OrderRequest,
    venue_order_id: u64,
}

/// Result of submitting to the matcher.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitResult {
    /// Market order queued for the next bar open.
    QueuedMarket { venue_order_id: u64 },
    /// Limit resting on the synthetic book.
    Resting { venue_order_id: u64 },
}

/// Deterministic bar-level matching engine.
pub struct BarMatcher {
    fee_rate: Decimal,
    slippage: SlippageModel,
    resting: HashMap<String, SimOrder>,
    queued_market: Vec<SimOrder>,
    next_venue_id: u64,
    next_fill_id: u64,
}

impl BarMatcher {
    pub fn new(fee_rate: Decimal, slippage: SlippageModel) -> Self {
        Self {
            fee_rate,
            slippage,
            resting: HashMap::new(),
            queued_market: Vec::new(),
            next_venue_id: 1,
            next_fill_id: 1,
        }
    }

    /// Accept an intent. Nothing fills until the next bar arrives.
    pub fn submit(&mut self, request: OrderRequest) -> SubmitResult {
        let venue_order_id = self.next_venue_id;
        self.next_venue_id += 1;
        let order = SimOrder {
            request,
            venue_order_id,
        };
        match order.request.order_type {
            OrderType::Market => {
                self.queued_market.push(order);
                SubmitResult::QueuedMarket { venue_order_id }
            }
            OrderType::Limit => {
                self.resting
                    .insert(order.request.client_id.clone(), order);
                SubmitResult::Resting { venue_order_id }
            }
        }
    }

    /// Remove a resting limit. Returns its venue id when it was resting.
    pub fn cancel(&mut self, client_id: &str) -> Option<u64> {
        self.resting.remove(client_id).map(|o| o.venue_order_id)
    }

    pub fn resting_count(&self) -> usize {
        self.resting.len()
    }

    /// Advance one bar for one pair. Queued market orders fill at the bar
    /// open; resting limits fill when the bar range touches their price.
    pub fn on_bar(&mut self, pair: &TradingPair, bar: &Bar, now: TimestampMs) -> Vec<Fill> {
        let mut fills = Vec::new();

        let mut remaining_markets = Vec::with_capacity(self.queued_market.len());
        for order in std::mem::take(&mut self.queued_market) {
            if &order.request.pair != pair {
                remaining_markets.push(order);
                continue;
            }
            let price = self
                .slippage
                .apply(order.request.side, bar.open, order.request.size, bar.volume);
            fills.push(self.fill_for(&order, price, now));
        }
        self.queued_market = remaining_markets;

        let mut touched: Vec<String> = Vec::new();
        for (client_id, order) in self.resting.iter() {
            if &order.request.pair != pair {
                continue;
            }
            let Some(limit) = order.request.price else {
                continue;
            };
            let touches = match order.request.side {
                // A resting bid fills when trading reaches down to it.
                Side::Buy => bar.low <= limit,
                Side::Sell => bar.high >= limit,
            };
            if touches {
                touched.push(client_id.clone());
            }
        }
        // Stable order across runs.
        touched.sort();
        for client_id in touched {
            if let Some(order) = self.resting.remove(&client_id) {
                if let Some(limit) = order.request.price {
                    fills.push(self.fill_for(&order, limit, now));
                }
            }
        }

        fills
    }

    fn fill_for(&mut self, order: &SimOrder, price: Decimal, now: TimestampMs) -> Fill {
        let fill_id = self.next_fill_id;
        self.next_fill_id += 1;
        Fill {
            fill_id,
            client_id: order.request.client_id.clone(),
            venue_order_id: order.venue_order_id,
            pair: order.request.pair.clone(),
            side: order.request.side,
            size: order.request.size,
            price,
            fee: price * order.request.size * self.fee_rate,
            ts: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDC")
    }

    fn bar(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Bar {
        Bar {
            ts: 60_000,
            open,
            high,
            low,
            close,
            volume: dec!(100),
        }
    }

    #[test]
    fn test_market_fills_at_next_bar_open_with_slippage() {
        let mut matcher = BarMatcher::new(dec!(0.001), SlippageModel::Proportional(dec!(0.01)));
        let request = OrderRequest::market("m1", pair(), Side::Buy, dec!(2));
        assert!(matches!(
            matcher.submit(request),
            SubmitResult::QueuedMarket { .. }
        ));

        let fills = matcher.on_bar(&pair(), &bar(dec!(100), dec!(105), dec!(99), dec!(104)), 60_000);
        assert_eq!(fills.len(), 1);
        // open 100 * (1 + 0.01)
        assert_eq!(fills[0].price, dec!(101));
        assert_eq!(fills[0].fee, dec!(101) * dec!(2) * dec!(0.001));
    }

    #[test]
    fn test_limit_touch_fill_policy() {
        let mut matcher = BarMatcher::new(Decimal::ZERO, SlippageModel::Fixed(Decimal::ZERO));
        matcher.submit(OrderRequest::limit("b1", pair(), Side::Buy, dec!(98), dec!(1)));

        // Bar low exactly touches 98: fills at the limit price.
        let fills = matcher.on_bar(&pair(), &bar(dec!(100), dec!(101), dec!(98), dec!(100)), 60_000);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(98));

        // A bar that never reaches the limit leaves it resting.
        matcher.submit(OrderRequest::limit("b2", pair(), Side::Buy, dec!(90), dec!(1)));
        let fills = matcher.on_bar(&pair(), &bar(dec!(100), dec!(101), dec!(95), dec!(100)), 120_000);
        assert!(fills.is_empty());
        assert_eq!(matcher.resting_count(), 1);
    }

    #[test]
    fn test_sell_limit_touch() {
        let mut matcher = BarMatcher::new(Decimal::ZERO, SlippageModel::Fixed(Decimal::ZERO));
        matcher.submit(OrderRequest::limit("s1", pair(), Side::Sell, dec!(105), dec!(1)));

        let fills = matcher.on_bar(&pair(), &bar(dec!(100), dec!(105), dec!(99), dec!(101)), 60_000);
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(105));
        assert_eq!(fills[0].side, Side::Sell);
    }

    #[test]
    fn test_cancel_resting() {
        let mut matcher = BarMatcher::new(Decimal::ZERO, SlippageModel::Fixed(Decimal::ZERO));
        matcher.submit(OrderRequest::limit("c1", pair(), Side::Buy, dec!(98), dec!(1)));
        assert!(matcher.cancel("c1").is_some());
        assert!(matcher.cancel("c1").is_none());

        let fills = matcher.on_bar(&pair(), &bar(dec!(98), dec!(98), dec!(98), dec!(98)), 60_000);
        assert!(fills.is_empty());
    }

    #[test]
    fn test_fills_only_for_matching_pair() {
        let mut matcher = BarMatcher::new(Decimal::ZERO, SlippageModel::Fixed(Decimal::ZERO));
        matcher.submit(OrderRequest::market("m1", pair(), Side::Buy, dec!(1)));

        let other = TradingPair::new("ETH", "USDC");
        let fills = matcher.on_bar(&other, &bar(dec!(10), dec!(11), dec!(9), dec!(10)), 60_000);
        assert!(fills.is_empty());

        let fills = matcher.on_bar(&pair(), &bar(dec!(10), dec!(11), dec!(9), dec!(10)), 120_000);
        assert_eq!(fills.len(), 1);
    }

    #[test]
    fn test_book_slippage_scales_with_size() {
        let model = SlippageModel::Book(dec!(0.1));
        let small = model.apply(Side::Buy, dec!(100), dec!(1), dec!(100));
        let large = model.apply(Side::Buy, dec!(100), dec!(50), dec!(100));
        assert!(large > small);
        assert_eq!(small, dec!(100.01));
    }
}
