//! Market Cache
//!
//! Process-wide read-optimized store of the latest venue state, keyed by
//! (venue, symbol). Writers take a per-map write lock; readers clone a
//! versioned snapshot and never observe a torn value. Stale reads across
//! keys are permitted - there is no global ordering.

use crate::engine::orders::Order;
use crate::engine::positions::Position;
use crate::orderbook::OrderBook;
use crate::types::{Balance, Ticker, TimestampMs, TradingPair};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Cache key: venue identifier plus venue-neutral symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub venue: String,
    pub symbol: String,
}

impl CacheKey {
    pub fn new(venue: impl Into<String>, pair: &TradingPair) -> Self {
        Self {
            venue: venue.into(),
            symbol: pair.to_string(),
        }
    }
}

/// A value with its per-key monotone version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<T> {
    pub value: T,
    pub version: u64,
    pub updated_at: TimestampMs,
}

struct Slot<T> {
    value: T,
    version: u64,
    updated_at: TimestampMs,
}

impl<T: Clone> Slot<T> {
    fn snapshot(&self) -> Versioned<T> {
        Versioned {
            value: self.value.clone(),
            version: self.version,
            updated_at: self.updated_at,
        }
    }
}

/// Shared live view of tickers, books, orders, positions, and balances.
pub struct MarketCache {
    tickers: RwLock<HashMap<CacheKey, Slot<Ticker>>>,
    books: RwLock<HashMap<CacheKey, Arc<RwLock<OrderBook>>>>,
    positions: RwLock<HashMap<CacheKey, Slot<Position>>>,
    open_orders: RwLock<HashMap<String, Slot<Vec<Order>>>>,
    balances: RwLock<HashMap<String, Slot<Vec<Balance>>>>,
}

impl MarketCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tickers: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            open_orders: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
        })
    }

    pub fn set_ticker(&self, venue: &str, ticker: Ticker) {
        let key = CacheKey::new(venue, &ticker.pair);
        let ts = ticker.ts;
        let mut tickers = self.tickers.write();
        match tickers.get_mut(&key) {
            Some(slot) => {
                slot.value = ticker;
                slot.version += 1;
                slot.updated_at = ts;
            }
            None => {
                tickers.insert(
                    key,
                    Slot {
                        value: ticker,
                        version: 1,
                        updated_at: ts,
                    },
                );
            }
        }
    }

    pub fn ticker(&self, venue: &str, pair: &TradingPair) -> Option<Versioned<Ticker>> {
        let key = CacheKey::new(venue, pair);
        self.tickers.read().get(&key).map(Slot::snapshot)
    }

    /// Handle to the live book for a pair, created on first use. The book's
    /// internal locking is its own concern.
    pub fn book(&self, venue: &str, pair: &TradingPair) -> Arc<RwLock<OrderBook>> {
        let key = CacheKey::new(venue, pair);
        if let Some(book) = self.books.read().get(&key) {
            return book.clone();
        }
        let mut books = self.books.write();
        books
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(OrderBook::new(pair.clone()))))
            .clone()
    }

    /// Drop the book on unsubscribe.
    pub fn remove_book(&self, venue: &str, pair: &TradingPair) {
        let key = CacheKey::new(venue, pair);
        self.books.write().remove(&key);
    }

    pub fn set_position(&self, venue: &str, position: Position) {
        let key = CacheKey::new(venue, &position.pair);
        let ts = position.updated_at;
        let mut positions = self.positions.write();
        match positions.get_mut(&key) {
            Some(slot) => {
                slot.value = position;
                slot.version += 1;
                slot.updated_at = ts;
            }
            None => {
                positions.insert(
                    key,
                    Slot {
                        value: position,
                        version: 1,
                        updated_at: ts,
                    },
                );
            }
        }
    }

    pub fn position(&self, venue: &str, pair: &TradingPair) -> Option<Versioned<Position>> {
        let key = CacheKey::new(venue, pair);
        self.positions.read().get(&key).map(Slot::snapshot)
    }

    pub fn positions(&self, venue: &str) -> Vec<Position> {
        self.positions
            .read()
            .iter()
            .filter(|(key, _)| key.venue == venue)
            .map(|(_, slot)| slot.value.clone())
            .collect()
    }

    pub fn set_open_orders(&self, venue: &str, orders: Vec<Order>, ts: TimestampMs) {
        let mut open_orders = self.open_orders.write();
        match open_orders.get_mut(venue) {
            Some(slot) => {
                slot.value = orders;
                slot.version += 1;
                slot.updated_at = ts;
            }
            None => {
                open_orders.insert(
                    venue.to_string(),
                    Slot {
                        value: orders,
                        version: 1,
                        updated_at: ts,
                    },
                );
            }
        }
    }

    pub fn open_orders(&self, venue: &str) -> Vec<Order> {
        self.open_orders
            .read()
            .get(venue)
            .map(|slot| slot.value.clone())
            .unwrap_or_default()
    }

    pub fn set_balances(&self, venue: &str, balances: Vec<Balance>, ts: TimestampMs) {
        let mut slot_map = self.balances.write();
        match slot_map.get_mut(venue) {
            Some(slot) => {
                slot.value = balances;
                slot.version += 1;
                slot.updated_at = ts;
            }
            None => {
                slot_map.insert(
                    venue.to_string(),
                    Slot {
                        value: balances,
                        version: 1,
                        updated_at: ts,
                    },
                );
            }
        }
    }

    pub fn balances(&self, venue: &str) -> Vec<Balance> {
        self.balances
            .read()
            .get(venue)
            .map(|slot| slot.value.clone())
            .unwrap_or_default()
    }
}

impl Default for MarketCache {
    fn default() -> Self {
        Self {
            tickers: RwLock::new(HashMap::new()),
            books: RwLock::new(HashMap::new()),
            positions: RwLock::new(HashMap::new()),
            open_orders: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
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

    fn ticker(mark: rust_decimal::Decimal, ts: TimestampMs) -> Ticker {
        Ticker {
            pair: pair(),
            mark,
            bid: Some(mark - dec!(1)),
            ask: Some(mark + dec!(1)),
            ts,
        }
    }

    #[test]
    fn test_ticker_versioning() {
        let cache = MarketCache::new();
        assert!(cache.ticker("hl", &pair()).is_none());

        cache.set_ticker("hl", ticker(dec!(100), 1));
        let first = cache.ticker("hl", &pair()).unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(first.value.mark, dec!(100));

        cache.set_ticker("hl", ticker(dec!(101), 2));
        let second = cache.ticker("hl", &pair()).unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.value.mark, dec!(101));
    }

    #[test]
    fn test_keys_are_venue_scoped() {
        let cache = MarketCache::new();
        cache.set_ticker("hl", ticker(dec!(100), 1));
        assert!(cache.ticker("other", &pair()).is_none());
    }

    #[test]
    fn test_book_handle_is_shared() {
        let cache = MarketCache::new();
        let book_a = cache.book("hl", &pair());
        let book_b = cache.book("hl", &pair());
        assert!(Arc::ptr_eq(&book_a, &book_b));

        cache.remove_book("hl", &pair());
        let book_c = cache.book("hl", &pair());
        assert!(!Arc::ptr_eq(&book_a, &book_c));
    }

    #[test]
    fn test_balances_roundtrip() {
        let cache = MarketCache::new();
        cache.set_balances(
            "hl",
            vec![Balance {
                asset: "USDC".into(),
                total: dec!(1000),
                free: dec!(900),
            }],
            5,
        );
        let balances = cache.balances("hl");
        assert_eq!(balances.len(), 1);
        assert_eq!(balances[0].free, dec!(900));
    }
}
