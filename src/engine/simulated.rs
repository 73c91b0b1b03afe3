//! Simulated Executor
//!
//! Paper-trading execution model: every accepted order fills immediately at
//! top-of-book plus a configurable slippage fraction, charged at a
//! configurable fee rate. Venue order ids and fill ids are locally minted.

use crate::cache::MarketCache;
use crate::error::{CoreError, CoreResult};
use crate::exchange::OrderAck;
use crate::types::{Fill, OrderRequest, OrderType, Side, TimestampMs};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct SimulatedExecutorConfig {
    /// Proportional slippage applied against the taker (e.g. 0.0001 = 1bp).
    pub slippage: Decimal,
    /// Proportional fee per fill.
    pub fee_rate: Decimal,
}

impl Default for SimulatedExecutorConfig {
    fn default() -> Self {
        Self {
            slippage: Decimal::new(1, 4),
            fee_rate: Decimal::new(5, 4),
        }
    }
}

/// Immediate-fill execution model for paper mode.
pub struct SimulatedExecutor {
    venue: String,
    cache: Arc<MarketCache>,
    config: SimulatedExecutorConfig,
    next_order_id: AtomicU64,
    next_fill_id: AtomicU64,
}

impl SimulatedExecutor {
    pub fn new(
        venue: impl Into<String>,
        cache: Arc<MarketCache>,
        config: SimulatedExecutorConfig,
    ) -> Self {
        Self {
            venue: venue.into(),
            cache,
            config,
            next_order_id: AtomicU64::new(1),
            next_fill_id: AtomicU64::new(1),
        }
    }

    /// Execute an intent against the latest cached market state.
    pub fn execute(&self, request: &OrderRequest, now: TimestampMs) -> CoreResult<(OrderAck, Fill)> {
        let reference = self.reference_price(request)?;
        let slip = reference * self.config.slippage;
        let model_price = match request.side {
            Side::Buy => reference + slip,
            Side::Sell => reference - slip,
        };

        // A crossing limit executes at the model price; a passive limit is
        // filled optimistically at its own price.
        let exec_price = match (request.order_type, request.price) {
            (OrderType::Limit, Some(limit)) => match request.side {
                Side::Buy => {
                    if limit >= reference {
                        model_price.min(limit)
                    } else {
                        limit
                    }
                }
                Side::Sell => {
                    if limit <= reference {
                        model_price.max(limit)
                    } else {
                        limit
                    }
                }
            },
            _ => model_price,
        };

        let venue_order_id = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        let fill_id = self.next_fill_id.fetch_add(1, Ordering::Relaxed);
        let fee = exec_price * request.size * self.config.fee_rate;

        let ack = OrderAck::Resting { venue_order_id };
        let fill = Fill {
            fill_id,
            client_id: request.client_id.clone(),
            venue_order_id,
            pair: request.pair.clone(),
            side: request.side,
            size: request.size,
            price: exec_price,
            fee,
            ts: now,
        };
        Ok((ack, fill))
    }

    /// Top-of-book on the side being hit, falling back to the ticker mark.
    fn reference_price(&self, request: &OrderRequest) -> CoreResult<Decimal> {
        let book_handle = self.cache.book(&self.venue, &request.pair);
        let top = {
            let book = book_handle.read();
            match request.side {
                Side::Buy => book.best_ask().map(|l| l.price),
                Side::Sell => book.best_bid().map(|l| l.price),
            }
        };
        if let Some(price) = top {
            return Ok(price);
        }
        if let Some(ticker) = self.cache.ticker(&self.venue, &request.pair) {
            return Ok(ticker.value.mark);
        }
        // A passive limit can execute without any market data.
        request.price.ok_or_else(|| {
            CoreError::Validation(format!(
                "no market data for {} and no limit price",
                request.pair
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orderbook::{BookLevel, BookSnapshot};
    use crate::types::TradingPair;
    use rust_decimal_macros::dec;

    fn pair() -> TradingPair {
        TradingPair::new("BTC", "USDC")
    }

    fn executor_with_book() -> SimulatedExecutor {
        let cache = MarketCache::new();
        let handle = cache.book("paper", &pair());
        handle.write().apply_snapshot(BookSnapshot {
            pair: pair(),
            bids: vec![BookLevel::new(dec!(99), dec!(10))],
            asks: vec![BookLevel::new(dec!(101), dec!(10))],
            seq: 1,
            ts: 1,
        });
        SimulatedExecutor::new(
            "paper",
            cache,
            SimulatedExecutorConfig {
                slippage: dec!(0.01),
                fee_rate: dec!(0.001),
            },
        )
    }

    #[test]
    fn test_market_buy_pays_ask_plus_slippage() {
        let executor = executor_with_book();
        let request = OrderRequest::market("c1", pair(), Side::Buy, dec!(2));
        let (ack, fill) = executor.execute(&request, 1_000).unwrap();

        assert!(matches!(ack, OrderAck::Resting { .. }));
        // 101 * 1.01
        assert_eq!(fill.price, dec!(102.01));
        assert_eq!(fill.fee, dec!(102.01) * dec!(2) * dec!(0.001));
    }

    #[test]
    fn test_passive_limit_fills_at_limit() {
        let executor = executor_with_book();
        let request = OrderRequest::limit("c1", pair(), Side::Buy, dec!(95), dec!(1));
        let (_, fill) = executor.execute(&request, 1_000).unwrap();
        assert_eq!(fill.price, dec!(95));
    }

    #[test]
    fn test_crossing_limit_capped_by_limit() {
        let executor = executor_with_book();
        // Buy limit at 101.5 crosses the ask at 101; slipped model price
        // 102.01 is capped at the limit.
        let request = OrderRequest::limit("c1", pair(), Side::Buy, dec!(101.5), dec!(1));
        let (_, fill) = executor.execute(&request, 1_000).unwrap();
        assert_eq!(fill.price, dec!(101.5));
    }

    #[test]
    fn test_fill_ids_are_unique() {
        let executor = executor_with_book();
        let request = OrderRequest::market("c1", pair(), Side::Sell, dec!(1));
        let (_, first) = executor.execute(&request, 1).unwrap();
        let (_, second) = executor.execute(&request, 2).unwrap();
        assert_ne!(first.fill_id, second.fill_id);
        assert_ne!(first.venue_order_id, second.venue_order_id);
    }
}
