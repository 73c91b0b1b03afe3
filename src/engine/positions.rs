//! Position Tracker
//!
//! Netted position ledger per (venue, pair). Incremental fills are
//! authoritative between snapshots; an exchange snapshot replaces size,
//! entry, leverage, and margin while preserving cumulative realized PnL.
//! All arithmetic is Decimal; `realized_pnl` is trading PnL before fees and
//! `net_realized_pnl` subtracts the cumulative fee.

use crate::exchange::VenuePosition;
use crate::types::{Fill, Side, TimestampMs, TradingPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Netted position for one pair. Size is signed: long positive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub pair: TradingPair,
    pub size: Decimal,
    /// Size-weighted average price of the opening fills.
    pub entry_price: Decimal,
    /// Cumulative trading PnL from closed portions, before fees.
    pub realized_pnl: Decimal,
    pub cumulative_fees: Decimal,
    pub leverage: Decimal,
    pub margin_used: Decimal,
    pub trade_count: u64,
    pub updated_at: TimestampMs,
}

impl Position {
    pub fn new(pair: TradingPair) -> Self {
        Self {
            pair,
            size: Decimal::ZERO,
            entry_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            cumulative_fees: Decimal::ZERO,
            leverage: Decimal::ONE,
            margin_used: Decimal::ZERO,
            trade_count: 0,
            updated_at: 0,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.size.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.size > Decimal::ZERO
    }

    pub fn is_short(&self) -> bool {
        self.size < Decimal::ZERO
    }

    /// Realized PnL net of fees.
    pub fn net_realized_pnl(&self) -> Decimal {
        self.realized_pnl - self.cumulative_fees
    }

    /// Mark-to-market PnL of the open size against the entry price.
    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        if self.size.is_zero() {
            return Decimal::ZERO;
        }
        (mark - self.entry_price) * self.size
    }

    /// Apply a side-signed fill. When the signed addition crosses zero, the
    /// portion up to the crossing closes the existing side and the remainder
    /// opens the new side at the fill price.
    pub fn apply_fill(&mut self, side: Side, quantity: Decimal, price: Decimal, fee: Decimal, ts: TimestampMs) {
        let signed = side.sign() * quantity;
        let old_size = self.size;

        if old_size.is_zero() || old_size.is_sign_positive() == signed.is_sign_positive() {
            // Opening or adding: re-weight the entry price.
            let old_abs = old_size.abs();
            let new_abs = old_abs + quantity;
            if !new_abs.is_zero() {
                self.entry_price =
                    (self.entry_price * old_abs + price * quantity) / new_abs;
            }
            self.size = old_size + signed;
        } else {
            let closing = quantity.min(old_size.abs());
            // Sign-adjusted: closing a long realizes (price - entry), a short
            // realizes (entry - price).
            let direction = if old_size.is_sign_positive() {
                Decimal::ONE
            } else {
                -Decimal::ONE
            };
            self.realized_pnl += (price - self.entry_price) * closing * direction;
            self.size = old_size + signed;

            let opened = quantity - closing;
            if opened > Decimal::ZERO {
                // Crossed through zero: the remainder opens the new side.
                self.entry_price = price;
            } else if self.size.is_zero() {
                self.entry_price = Decimal::ZERO;
            }
        }

        self.cumulative_fees += fee;
        self.trade_count += 1;
        self.updated_at = ts;
    }

    /// Replace venue-authoritative fields from a snapshot, preserving the
    /// realized ledger.
    pub fn apply_snapshot(&mut self, snapshot: &VenuePosition, ts: TimestampMs) {
        self.size = snapshot.size;
        self.entry_price = snapshot.entry_price;
        self.leverage = snapshot.leverage;
        self.margin_used = snapshot.margin_used;
        self.updated_at = ts;
    }
}

/// Netted position ledger for one venue.
pub struct PositionTracker {
    venue: String,
    positions: HashMap<TradingPair, Position>,
}

impl PositionTracker {
    pub fn new(venue: impl Into<String>) -> Self {
        Self {
            venue: venue.into(),
            positions: HashMap::new(),
        }
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// Install a restored position, e.g. from a persisted snapshot.
    pub fn seed(&mut self, position: Position) {
        self.positions.insert(position.pair.clone(), position);
    }

    /// Apply a fill, creating the position lazily on first touch.
    pub fn on_fill(&mut self, fill: &Fill) -> Position {
        let position = self
            .positions
            .entry(fill.pair.clone())
            .or_insert_with(|| Position::new(fill.pair.clone()));
        position.apply_fill(fill.side, fill.size, fill.price, fill.fee, fill.ts);
        position.clone()
    }

    /// Replace all positions from a venue snapshot. Pairs absent from the
    /// snapshot flatten to zero; realized PnL is preserved everywhere.
    pub fn apply_snapshot(&mut self, snapshot: &[VenuePosition], ts: TimestampMs) {
        use std::collections::HashSet;
        let reported: HashSet<&TradingPair> = snapshot.iter().map(|p| &p.pair).collect();

        for (pair, position) in self.positions.iter_mut() {
            if !reported.contains(pair) && !position.size.is_zero() {
                position.size = Decimal::ZERO;
                position.entry_price = Decimal::ZERO;
                position.margin_used = Decimal::ZERO;
                position.updated_at = ts;
            }
        }

        for venue_position in snapshot {
            let position = self
                .positions
                .entry(venue_position.pair.clone())
                .or_insert_with(|| Position::new(venue_position.pair.clone()));
            position.apply_snapshot(venue_position, ts);
        }
    }

    pub fn position(&self, pair: &TradingPair) -> Option<Position> {
        self.positions.get(pair).cloned()
    }

    /// Positions worth reporting: open size or a realized history.
    pub fn all(&self) -> Vec<Position> {
        let mut all: Vec<Position> = self
            .positions
            .values()
            .filter(|p| !p.size.is_zero() || !p.realized_pnl.is_zero() || !p.cumulative_fees.is_zero())
            .cloned()
            .collect();
        all.sort_by(|a, b| a.pair.to_string().cmp(&b.pair.to_string()));
        all
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    pub fn total_fees(&self) -> Decimal {
        self.positions.values().map(|p| p.cumulative_fees).sum()
    }
}
