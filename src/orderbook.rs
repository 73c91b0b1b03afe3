//! L2 Order Book
//!
//! Per-symbol depth book maintained from venue snapshots and sequenced deltas.
//! Deltas must apply in sequence order: stale sequences are dropped, a gap
//! parks the book in `Desynced` and buffers deltas until a fresh snapshot.

use crate::types::{Side, TimestampMs, TradingPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One aggregated price level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
    /// Number of resting orders at this level, when the venue reports it.
    pub order_count: Option<u32>,
}

impl BookLevel {
    pub fn new(price: Decimal, size: Decimal) -> Self {
        Self {
            price,
            size,
            order_count: None,
        }
    }
}

/// Full book snapshot from the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub pair: TradingPair,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub seq: u64,
    pub ts: TimestampMs,
}

/// Incremental book update. A level with size zero is removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookDelta {
    pub pair: TradingPair,
    pub bid_updates: Vec<BookLevel>,
    pub ask_updates: Vec<BookLevel>,
    pub seq: u64,
    pub ts: TimestampMs,
}

/// Result of applying a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaResult {
    Applied,
    /// Sequence at or below the last applied one; dropped.
    Stale,
    /// Sequence gap detected. The delta was buffered and the caller must
    /// request a fresh snapshot (`BookResyncNeeded`).
    GapDetected,
    /// Book is already awaiting a snapshot; the delta was buffered.
    Buffered,
}

/// Outcome of a slippage query.
#[derive(Debug, Clone, PartialEq)]
pub enum SlippageResult {
    /// Volume-weighted average execution price for the requested size.
    Filled { avg_price: Decimal },
    /// The book is too thin; carries the size that could be filled.
    InsufficientLiquidity { available: Decimal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BookState {
    /// Waiting for the first snapshot.
    Uninitialized,
    Synced,
    /// A sequence gap was observed; deltas buffer until the next snapshot.
    Desynced,
}

/// L2 order book for a single (venue, pair).
#[derive(Debug)]
pub struct OrderBook {
    pub pair: TradingPair,
    /// Descending iteration via `.iter().rev()`.
    bids: BTreeMap<Decimal, BookLevel>,
    /// Ascending by price.
    asks: BTreeMap<Decimal, BookLevel>,
    last_seq: u64,
    last_update: TimestampMs,
    state: BookState,
    buffered: Vec<BookDelta>,
    /// Buffer cap while desynced; beyond this, older deltas are discarded.
    max_buffered: usize,
}

impl OrderBook {
    pub fn new(pair: TradingPair) -> Self {
        Self {
            pair,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_seq: 0,
            last_update: 0,
            state: BookState::Uninitialized,
            buffered: Vec::new(),
            max_buffered: 1024,
        }
    }

    /// Install a snapshot, replacing all book state. Buffered deltas from a
    /// prior desync are discarded: they predate the snapshot sequence.
    pub fn apply_snapshot(&mut self, snapshot: BookSnapshot) {
        self.bids.clear();
        self.asks.clear();
        for level in snapshot.bids {
            if level.size > Decimal::ZERO {
                self.bids.insert(level.price, level);
            }
        }
        for level in snapshot.asks {
            if level.size > Decimal::ZERO {
                self.asks.insert(level.price, level);
            }
        }
        self.last_seq = snapshot.seq;
        self.last_update = snapshot.ts;
        self.state = BookState::Synced;
        self.buffered.clear();
    }

    /// Apply a sequenced delta.
    pub fn apply_delta(&mut self, delta: BookDelta) -> DeltaResult {
        match self.state {
            BookState::Uninitialized | BookState::Desynced => {
                self.buffer_delta(delta);
                return DeltaResult::Buffered;
            }
            BookState::Synced => {}
        }

        if delta.seq <= self.last_seq {
            return DeltaResult::Stale;
        }
        if delta.seq > self.last_seq + 1 {
            self.state = BookState::Desynced;
            self.buffer_delta(delta);
            return DeltaResult::GapDetected;
        }

        for level in delta.bid_updates {
            if level.size.is_zero() {
                self.bids.remove(&level.price);
            } else {
                self.bids.insert(level.price, level);
            }
        }
        for level in delta.ask_updates {
            if level.size.is_zero() {
                self.asks.remove(&level.price);
            } else {
                self.asks.insert(level.price, level);
            }
        }
        self.last_seq = delta.seq;
        self.last_update = delta.ts;
        DeltaResult::Applied
    }

    fn buffer_delta(&mut self, delta: BookDelta) {
        if self.buffered.len() >= self.max_buffered {
            self.buffered.remove(0);
        }
        self.buffered.push(delta);
    }

    /// True once a snapshot has been applied and no gap is outstanding.
    pub fn is_synced(&self) -> bool {
        self.state == BookState::Synced
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    pub fn last_update(&self) -> TimestampMs {
        self.last_update
    }

    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.iter().next_back().map(|(_, l)| l)
    }

    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.iter().next().map(|(_, l)| l)
    }

    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price) / Decimal::TWO),
            _ => None,
        }
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a.price - b.price),
            _ => None,
        }
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    /// Top `depth` levels, best first.
    pub fn levels(&self, depth: usize) -> (Vec<BookLevel>, Vec<BookLevel>) {
        let bids = self.bids.values().rev().take(depth).cloned().collect();
        let asks = self.asks.values().take(depth).cloned().collect();
        (bids, asks)
    }

    /// Volume-weighted average price for consuming `amount` from the top of
    /// the given side. `side` is the side being hit: a buy consumes asks.
    pub fn slippage(&self, side: Side, amount: Decimal) -> SlippageResult {
        if amount <= Decimal::ZERO {
            return SlippageResult::InsufficientLiquidity {
                available: Decimal::ZERO,
            };
        }

        let mut remaining = amount;
        let mut notional = Decimal::ZERO;

        let mut walk = |price: Decimal, size: Decimal| {
            let take = size.min(remaining);
            notional += take * price;
            remaining -= take;
            remaining.is_zero()
        };

        let done = match side {
            Side::Buy => {
                let mut done = false;
                for level in self.asks.values() {
                    if walk(level.price, level.size) {
                        done = true;
                        break;
                    }
                }
                done
            }
            Side::Sell => {
                let mut done = false;
                for level in self.bids.values().rev() {
                    if walk(level.price, level.size) {
                        done = true;
                        break;
                    }
                }
                done
            }
        };

        if done {
            SlippageResult::Filled {
                avg_price: notional / amount,
            }
        } else {
            SlippageResult::InsufficientLiquidity {
                available: amount - remaining,
            }
        }
    }
}
