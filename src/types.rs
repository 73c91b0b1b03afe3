//! Core Value Types
//!
//! Canonical market and order value types shared by every subsystem.
//! All monetary quantities are `rust_decimal::Decimal` - floating point is
//! forbidden on ledger paths. Timestamps are integer milliseconds since epoch.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Milliseconds since Unix epoch.
pub type TimestampMs = i64;

pub const MILLIS_PER_SEC: i64 = 1_000;
pub const MILLIS_PER_MIN: i64 = 60_000;

/// Current wall-clock time in milliseconds. Never call from backtest paths;
/// the simulation clock is the only time source there.
#[inline]
pub fn now_ms() -> TimestampMs {
    Utc::now().timestamp_millis()
}

/// Convert milliseconds to a chrono DateTime.
#[inline]
pub fn ms_to_datetime(ms: TimestampMs) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// Parse a timestamp from either an integer-milliseconds string or RFC-3339.
pub fn parse_timestamp_ms(s: &str) -> Option<TimestampMs> {
    if let Ok(ms) = s.parse::<i64>() {
        return Some(ms);
    }
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// Rounding mode applied when quantizing to the configured scales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMode {
    /// Banker's rounding (default).
    #[default]
    HalfEven,
    HalfUp,
    Down,
}

impl RoundingMode {
    pub fn strategy(&self) -> RoundingStrategy {
        match self {
            RoundingMode::HalfEven => RoundingStrategy::MidpointNearestEven,
            RoundingMode::HalfUp => RoundingStrategy::MidpointAwayFromZero,
            RoundingMode::Down => RoundingStrategy::ToZero,
        }
    }
}

impl FromStr for RoundingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "half_even" => Ok(RoundingMode::HalfEven),
            "half_up" => Ok(RoundingMode::HalfUp),
            "down" => Ok(RoundingMode::Down),
            other => Err(format!("unknown rounding mode: {}", other)),
        }
    }
}

/// Decimal scale configuration for price and size quantization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DecimalSpec {
    pub price_scale: u32,
    pub size_scale: u32,
    pub rounding: RoundingMode,
}

impl Default for DecimalSpec {
    fn default() -> Self {
        Self {
            price_scale: 8,
            size_scale: 8,
            rounding: RoundingMode::HalfEven,
        }
    }
}

impl DecimalSpec {
    #[inline]
    pub fn quantize_price(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.price_scale, self.rounding.strategy())
    }

    #[inline]
    pub fn quantize_size(&self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.size_scale, self.rounding.strategy())
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Signed unit for netting: +1 for buys, -1 for sells.
    #[inline]
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// Order type for submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Time-in-force.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum TimeInForce {
    /// Good til cancelled.
    #[default]
    Gtc,
    /// Immediate or cancel.
    Ioc,
    /// Add liquidity only (post-only).
    Alo,
}

/// A base/quote instrument pair, e.g. BTC/USDC.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradingPair {
    pub base: String,
    pub quote: String,
}

impl TradingPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

impl FromStr for TradingPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (base, quote) = s
            .split_once('-')
            .or_else(|| s.split_once('/'))
            .ok_or_else(|| format!("invalid trading pair: {}", s))?;
        if base.is_empty() || quote.is_empty() {
            return Err(format!("invalid trading pair: {}", s));
        }
        Ok(Self::new(base, quote))
    }
}

/// Maps internal pairs to venue-specific symbol strings.
///
/// Hyperliquid perps are keyed by coin name only ("BTC"), quoted in USDC.
#[derive(Debug, Clone)]
pub struct SymbolMapper {
    default_quote: String,
}

impl SymbolMapper {
    pub fn new(default_quote: impl Into<String>) -> Self {
        Self {
            default_quote: default_quote.into(),
        }
    }

    pub fn to_venue(&self, pair: &TradingPair) -> String {
        pair.base.clone()
    }

    pub fn from_venue(&self, coin: &str) -> TradingPair {
        TradingPair::new(coin, self.default_quote.clone())
    }
}

impl Default for SymbolMapper {
    fn default() -> Self {
        Self::new("USDC")
    }
}

/// An OHLCV candle under construction. Fields are absent (not zero) until the
/// first observation lands in the interval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candle {
    pub ts: TimestampMs,
    pub open: Option<Decimal>,
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
    pub close: Option<Decimal>,
    pub volume: Option<Decimal>,
}

impl Candle {
    pub fn new(ts: TimestampMs) -> Self {
        Self {
            ts,
            ..Default::default()
        }
    }

    /// Fold a trade observation into the candle.
    pub fn update(&mut self, price: Decimal, size: Decimal) {
        self.open.get_or_insert(price);
        self.high = Some(self.high.map_or(price, |h| h.max(price)));
        self.low = Some(self.low.map_or(price, |l| l.min(price)));
        self.close = Some(price);
        self.volume = Some(self.volume.unwrap_or(Decimal::ZERO) + size);
    }

    /// A candle finalizes only once every field has been observed.
    pub fn finalize(&self) -> Option<Bar> {
        Some(Bar {
            ts: self.ts,
            open: self.open?,
            high: self.high?,
            low: self.low?,
            close: self.close?,
            volume: self.volume.unwrap_or(Decimal::ZERO),
        })
    }
}

/// A finalized OHLCV bar delivered to strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub ts: TimestampMs,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

impl Bar {
    /// True if the bar's traded range touches `price`.
    #[inline]
    pub fn touches(&self, price: Decimal) -> bool {
        price >= self.low && price <= self.high
    }
}

/// Latest top-of-book view for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: TradingPair,
    /// Mark price used for unrealized PnL.
    pub mark: Decimal,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub ts: TimestampMs,
}

impl Ticker {
    pub fn mid(&self) -> Option<Decimal> {
        match (self.bid, self.ask) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Immutable order intent produced by a strategy or the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-generated correlation id, unique for the runtime lifetime.
    pub client_id: String,
    pub pair: TradingPair,
    pub side: Side,
    pub order_type: OrderType,
    pub size: Decimal,
    /// Required for limit orders, absent for market orders.
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
}

impl OrderRequest {
    pub fn limit(
        client_id: impl Into<String>,
        pair: TradingPair,
        side: Side,
        price: Decimal,
        size: Decimal,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            pair,
            side,
            order_type: OrderType::Limit,
            size,
            price: Some(price),
            time_in_force: TimeInForce::Gtc,
            reduce_only: false,
        }
    }

    pub fn market(
        client_id: impl Into<String>,
        pair: TradingPair,
        side: Side,
        size: Decimal,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            pair,
            side,
            order_type: OrderType::Market,
            size,
            price: None,
            time_in_force: TimeInForce::Ioc,
            reduce_only: false,
        }
    }

    pub fn ioc(mut self) -> Self {
        self.time_in_force = TimeInForce::Ioc;
        self
    }

    pub fn post_only(mut self) -> Self {
        self.time_in_force = TimeInForce::Alo;
        self
    }

    pub fn reduce_only(mut self) -> Self {
        self.reduce_only = true;
        self
    }
}

/// A single execution against an order. Fill ids are venue-assigned and
/// monotonically ordered per order; receivers deduplicate by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub fill_id: u64,
    pub client_id: String,
    pub venue_order_id: u64,
    pub pair: TradingPair,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub ts: TimestampMs,
}

/// Account balance for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub total: Decimal,
    pub free: Decimal,
}
