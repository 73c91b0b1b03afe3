//! Exchange Adapter Layer
//!
//! Venue-neutral capability set consumed by the core. Adapters own wire
//! framing, signing, rate limiting, and reconnection; the core never observes
//! the wire format. Raw venue messages flow out of `subscribe` channels and
//! are normalized by the data engine.

pub mod hyperliquid;

use crate::error::CoreResult;
use crate::orderbook::BookSnapshot;
use crate::types::{Balance, OrderRequest, Ticker, TimestampMs, TradingPair};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Subscription channels the core can request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Channel {
    L2Book(TradingPair),
    Trades(TradingPair),
    OrderUpdates,
    UserFills,
}

/// Raw price level as reported by the venue (string-encoded numerics).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawLevel {
    pub px: String,
    pub sz: String,
    pub n: Option<u32>,
}

/// Raw book message; snapshot-or-delta distinguished by the venue.
#[derive(Debug, Clone, PartialEq)]
pub struct RawBook {
    pub coin: String,
    pub is_snapshot: bool,
    pub seq: u64,
    pub ts: TimestampMs,
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
}

/// Raw public trade.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTrade {
    pub coin: String,
    pub px: String,
    pub sz: String,
    pub is_buy: bool,
    pub ts: TimestampMs,
}

/// Raw user order update. `remaining_sz` is the unfilled remainder; the
/// original size is present when the venue reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawOrderUpdate {
    pub venue_order_id: u64,
    pub client_id: Option<String>,
    pub coin: String,
    pub status: String,
    pub remaining_sz: String,
    pub orig_sz: Option<String>,
    pub ts: TimestampMs,
}

/// Raw user fill.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFill {
    pub fill_id: u64,
    pub venue_order_id: u64,
    pub client_id: Option<String>,
    pub coin: String,
    pub px: String,
    pub sz: String,
    pub fee: String,
    pub is_buy: bool,
    pub ts: TimestampMs,
}

/// Messages emitted by adapter subscription streams.
#[derive(Debug, Clone, PartialEq)]
pub enum VenueMessage {
    Connected,
    Disconnected { reason: String },
    Book(RawBook),
    Trade(RawTrade),
    OrderUpdate(RawOrderUpdate),
    Fill(RawFill),
}

/// Venue acknowledgment of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderAck {
    /// Accepted and resting on the book.
    Resting { venue_order_id: u64 },
    /// Filled immediately on arrival.
    Filled {
        venue_order_id: u64,
        avg_price: Decimal,
        size: Decimal,
    },
    /// Rejected by the venue.
    Rejected { reason: String },
}

/// Open order as reported by the venue (reconciliation input).
#[derive(Debug, Clone, PartialEq)]
pub struct VenueOrder {
    pub venue_order_id: u64,
    pub client_id: Option<String>,
    pub pair: TradingPair,
    pub side: crate::types::Side,
    pub price: Decimal,
    pub size: Decimal,
    pub filled_size: Decimal,
    pub ts: TimestampMs,
}

/// Position as reported by the venue (snapshot source).
#[derive(Debug, Clone, PartialEq)]
pub struct VenuePosition {
    pub pair: TradingPair,
    /// Signed size, long positive.
    pub size: Decimal,
    pub entry_price: Decimal,
    pub leverage: Decimal,
    pub margin_used: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Abstract venue interface the core consumes.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> &str;

    async fn connect(&self) -> CoreResult<()>;
    async fn disconnect(&self) -> CoreResult<()>;
    fn is_connected(&self) -> bool;

    /// Open the venue stream for the given channels. Messages preserve
    /// per-channel producer order.
    async fn subscribe(&self, channels: &[Channel]) -> CoreResult<mpsc::Receiver<VenueMessage>>;

    async fn get_ticker(&self, pair: &TradingPair) -> CoreResult<Ticker>;
    async fn get_orderbook(&self, pair: &TradingPair, depth: usize) -> CoreResult<BookSnapshot>;
    async fn get_balances(&self) -> CoreResult<Vec<Balance>>;
    async fn get_positions(&self) -> CoreResult<Vec<VenuePosition>>;
    async fn get_open_orders(&self) -> CoreResult<Vec<VenueOrder>>;

    /// Sign and send an order. The response is the venue's immediate
    /// acknowledgment; asynchronous lifecycle continues on the user stream.
    async fn submit_order(&self, request: &OrderRequest) -> CoreResult<OrderAck>;

    async fn cancel_order(&self, pair: &TradingPair, venue_order_id: u64) -> CoreResult<()>;
    /// Cancel everything, optionally scoped to one pair.
    async fn cancel_all_orders(&self, pair: Option<&TradingPair>) -> CoreResult<()>;
}

/// Token-bucket rate limiter with an async wait queue. Callers `acquire`
/// before every signed request; the call resolves once a token is available.
/// The bucket starts full at `burst` and refills at `rate` tokens/second.
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    pub fn new(rate_per_second: u32) -> Self {
        Self::with_burst(rate_per_second, rate_per_second)
    }

    pub fn with_burst(rate_per_second: u32, burst: u32) -> Self {
        let rate = f64::from(rate_per_second.max(1));
        let burst = f64::from(burst.max(1));
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refilled_at: Instant::now(),
            }),
        }
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
        state.refilled_at = now;
    }

    /// Wait until a token is available, then consume it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                self.refill(&mut state, now);
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64((1.0 - state.tokens) / self.rate))
                }
            };

            match wait {
                None => return,
                Some(delay) => tokio::time::sleep(delay.max(Duration::from_millis(1))).await,
            }
        }
    }

    /// Consume a token if one is available, without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available, rounded down.
    pub fn available(&self) -> u32 {
        let mut state = self.state.lock();
        let now = Instant::now();
        self.refill(&mut state, now);
        state.tokens as u32
    }
}

/// Exponential backoff with jitter, capped at 30s.
#[derive(Debug)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay for the next retry, doubling per attempt with up to 20% jitter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter = rand::thread_rng().gen_range(0.0..0.2);
        capped.mul_f64(1.0 + jitter).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_allows_burst_then_blocks() {
        let limiter = RateLimiter::new(3);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_refills_over_time() {
        let limiter = RateLimiter::new(2);
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(!limiter.try_acquire());

        // Refill at 2 tokens/s: after 600ms one token is back.
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_burst_caps_bucket() {
        let limiter = RateLimiter::with_burst(10, 2);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        // The bucket never holds more than the burst.
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let first = backoff.next_delay();
        let second = backoff.next_delay();
        assert!(first >= Duration::from_secs(1));
        assert!(second >= Duration::from_secs(2));
        for _ in 0..10 {
            let d = backoff.next_delay();
            assert!(d <= Duration::from_secs(30));
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
    }
}
