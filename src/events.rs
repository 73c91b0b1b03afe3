//! Event Model
//!
//! Typed events flowing between the data engine, the bus, and strategy
//! runners. Topic strings follow `market.<venue>.<symbol>.<kind>` and
//! `account.<venue>.<kind>`; subscribers match a literal topic or a prefix
//! with a trailing `*`.

use crate::engine::orders::Order;
use crate::orderbook::{BookDelta, BookSnapshot};
use crate::types::{Balance, Bar, Fill, Side, Ticker, TimestampMs, TradingPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A public trade print.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub pair: TradingPair,
    pub price: Decimal,
    pub size: Decimal,
    /// Aggressor side.
    pub side: Side,
    pub ts: TimestampMs,
}

/// Market-data events, normalized from raw venue messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MarketEvent {
    Ticker(Ticker),
    Trade(TradeEvent),
    BookSnapshot(BookSnapshot),
    BookDelta(BookDelta),
    Bar { pair: TradingPair, bar: Bar },
    /// The local book for a pair lost sequence continuity; a fresh snapshot
    /// must be requested.
    BookResyncNeeded { pair: TradingPair, last_seq: u64 },
}

/// Account events, normalized from the venue's user streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AccountEvent {
    OrderUpdate(Order),
    Fill(Fill),
    Balances(Vec<Balance>),
    PositionSnapshot {
        pair: TradingPair,
        size: Decimal,
        entry_price: Decimal,
        leverage: Decimal,
        margin_used: Decimal,
        ts: TimestampMs,
    },
}

/// Strategy runner lifecycle notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub runner_id: String,
    pub status: String,
    pub ts: TimestampMs,
}

/// Everything that can travel on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    Market(MarketEvent),
    Account(AccountEvent),
    Status(StatusEvent),
}

/// Topic builders, kept in one place so publishers and subscribers agree.
pub mod topics {
    use crate::types::TradingPair;

    pub fn market_book(venue: &str, pair: &TradingPair) -> String {
        format!("market.{}.{}.book", venue, pair)
    }

    pub fn market_ticker(venue: &str, pair: &TradingPair) -> String {
        format!("market.{}.{}.ticker", venue, pair)
    }

    pub fn market_trade(venue: &str, pair: &TradingPair) -> String {
        format!("market.{}.{}.trade", venue, pair)
    }

    pub fn market_bar(venue: &str, pair: &TradingPair) -> String {
        format!("market.{}.{}.bar", venue, pair)
    }

    pub fn account_order(venue: &str) -> String {
        format!("account.{}.order", venue)
    }

    pub fn account_fill(venue: &str) -> String {
        format!("account.{}.fill", venue)
    }

    pub fn account_balance(venue: &str) -> String {
        format!("account.{}.balance", venue)
    }

    pub fn account_position(venue: &str) -> String {
        format!("account.{}.position", venue)
    }

    pub const STRATEGY_STATUS: &str = "strategy.status";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_builders() {
        let pair = TradingPair::new("BTC", "USDC");
        assert_eq!(
            topics::market_ticker("hyperliquid", &pair),
            "market.hyperliquid.BTC-USDC.ticker"
        );
        assert_eq!(topics::account_fill("hyperliquid"), "account.hyperliquid.fill");
    }
}
