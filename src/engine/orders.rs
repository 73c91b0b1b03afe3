//! Order Manager
//!
//! Client-side registry of every order and its lifecycle state machine.
//! Reconciles optimistic submissions with asynchronous venue events:
//! out-of-order fills are buffered until the ack lands, duplicate fills are
//! dropped by fill id, and an over-fill is clamped, logged as inconsistent,
//! and queued for reconciliation against the venue's open-orders snapshot.

use crate::error::{CoreError, CoreResult};
use crate::exchange::{OrderAck, VenueOrder};
use crate::types::{Fill, OrderRequest, OrderType, Side, TimeInForce, TimestampMs, TradingPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, warn};

/// Order lifecycle states.
///
/// ```text
/// NEW -> PENDING -> OPEN -> PARTIALLY_FILLED -> FILLED
///          |          \         \
///          v           v         v
///      REJECTED     CANCELING -> CANCELED
///
/// PENDING with no ack within the timeout -> UNKNOWN, resolved by the next
/// reconciliation pass.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    /// Created locally, not yet sent.
    New,
    /// Sent, awaiting venue acknowledgment.
    Pending,
    /// Acknowledged and resting.
    Open,
    PartiallyFilled,
    Filled,
    /// Cancel requested, awaiting confirmation.
    Canceling,
    Canceled,
    Rejected,
    Expired,
    /// No ack within the pending timeout; truth recovered by reconciliation.
    Unknown,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected | OrderState::Expired
        )
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self,
            OrderState::Pending
                | OrderState::Open
                | OrderState::PartiallyFilled
                | OrderState::Canceling
                | OrderState::Unknown
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::New => "new",
            OrderState::Pending => "pending",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Canceling => "canceling",
            OrderState::Canceled => "canceled",
            OrderState::Rejected => "rejected",
            OrderState::Expired => "expired",
            OrderState::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Venue-reported order status, already normalized by the data engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VenueOrderStatus {
    Open,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// Mutable client-side order record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub client_id: String,
    /// Absent until the venue acknowledges the submission.
    pub venue_order_id: Option<u64>,
    pub pair: TradingPair,
    pub side: Side,
    pub order_type: OrderType,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub state: OrderState,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub cumulative_fee: Decimal,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
    pub last_error: Option<String>,
    /// Fill ids already applied; the dedup set.
    applied_fill_ids: BTreeSet<u64>,
}

impl Order {
    fn from_request(request: &OrderRequest, now: TimestampMs) -> Self {
        Self {
            client_id: request.client_id.clone(),
            venue_order_id: None,
            pair: request.pair.clone(),
            side: request.side,
            order_type: request.order_type,
            size: request.size,
            price: request.price,
            time_in_force: request.time_in_force,
            reduce_only: request.reduce_only,
            state: OrderState::New,
            filled_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            cumulative_fee: Decimal::ZERO,
            created_at: now,
            updated_at: now,
            last_error: None,
            applied_fill_ids: BTreeSet::new(),
        }
    }

    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }

    fn touch(&mut self, now: TimestampMs) {
        self.updated_at = now;
    }
}

/// Outcome of applying one fill event.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    /// Applied in full; carries the updated order.
    Applied(Order),
    /// Same fill id seen before; nothing changed.
    Duplicate,
    /// The fill would overrun the order size; applied quantity was clamped
    /// and a reconciliation pass is scheduled.
    Clamped(Order),
    /// Fill arrived before the ack; buffered until the order is known.
    Buffered,
    /// No local order matches; buffered by venue order id for reconciliation.
    UnknownOrder,
}

/// Result of registering an intent.
#[derive(Debug, Clone)]
pub struct Registered {
    pub order: Order,
    /// True when the correlation id was already known: the caller must not
    /// contact the venue again.
    pub existed: bool,
}

/// Report of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Locally-open orders absent from the venue, now terminal.
    pub closed: Vec<String>,
    /// Venue orders unknown locally, now adopted.
    pub adopted: Vec<String>,
    /// Orders whose fill state was refreshed from the venue.
    pub updated: usize,
}

/// Running counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderStats {
    pub submitted: u64,
    pub acked: u64,
    pub rejected: u64,
    pub filled: u64,
    pub canceled: u64,
    pub duplicate_fills: u64,
    pub inconsistent_fills: u64,
    pub buffered_fills: u64,
    pub unknown_transitions: u64,
    pub reconciliations: u64,
}

/// Client-side order registry and lifecycle state machine.
pub struct OrderManager {
    venue: String,
    orders: HashMap<String, Order>,
    venue_to_client: HashMap<u64, String>,
    /// Fills that arrived before their order was acknowledged.
    pending_fills: HashMap<u64, Vec<Fill>>,
    pending_timeout_ms: i64,
    needs_reconciliation: bool,
    pub stats: OrderStats,
}

impl OrderManager {
    pub fn new(venue: impl Into<String>, pending_timeout_ms: i64) -> Self {
        Self {
            venue: venue.into(),
            orders: HashMap::new(),
            venue_to_client: HashMap::new(),
            pending_fills: HashMap::new(),
            pending_timeout_ms,
            needs_reconciliation: false,
            stats: OrderStats::default(),
        }
    }

    pub fn venue(&self) -> &str {
        &self.venue
    }

    /// Register an intent. Idempotent on the correlation id: re-registering
    /// returns the existing record and the caller must skip the venue call.
    pub fn register(&mut self, request: &OrderRequest, now: TimestampMs) -> Registered {
        if let Some(existing) = self.orders.get(&request.client_id) {
            return Registered {
                order: existing.clone(),
                existed: true,
            };
        }
        let order = Order::from_request(request, now);
        self.orders.insert(request.client_id.clone(), order.clone());
        self.stats.submitted += 1;
        Registered {
            order,
            existed: false,
        }
    }

    /// Mark an order as sent to the venue.
    pub fn mark_pending(&mut self, client_id: &str, now: TimestampMs) -> CoreResult<()> {
        let order = self.get_mut(client_id)?;
        if order.state == OrderState::New {
            order.state = OrderState::Pending;
            order.touch(now);
        }
        Ok(())
    }

    /// Apply the venue's immediate acknowledgment.
    pub fn on_ack(&mut self, client_id: &str, ack: &OrderAck, now: TimestampMs) -> CoreResult<Order> {
        let order = self.get_mut(client_id)?;
        match ack {
            OrderAck::Resting { venue_order_id } | OrderAck::Filled { venue_order_id, .. } => {
                order.venue_order_id = Some(*venue_order_id);
                if matches!(
                    order.state,
                    OrderState::New | OrderState::Pending | OrderState::Unknown
                ) {
                    // Fills, including an immediate one, arrive on the user
                    // stream and drive the terminal transition.
                    order.state = OrderState::Open;
                }
                order.touch(now);
                self.stats.acked += 1;

                let venue_id = *venue_order_id;
                let client = client_id.to_string();
                self.venue_to_client.insert(venue_id, client);
                self.replay_buffered_fills(venue_id, now);
            }
            OrderAck::Rejected { reason } => {
                order.state = OrderState::Rejected;
                order.last_error = Some(reason.clone());
                order.touch(now);
                self.stats.rejected += 1;
            }
        }
        self.orders
            .get(client_id)
            .cloned()
            .ok_or_else(|| CoreError::OrderNotFound(client_id.to_string()))
    }

    /// Apply a fill event. Deduplicates by fill id and clamps over-fills.
    pub fn on_fill(&mut self, fill: &Fill, now: TimestampMs) -> FillOutcome {
        let client_id = if !fill.client_id.is_empty() && self.orders.contains_key(&fill.client_id) {
            Some(fill.client_id.clone())
        } else {
            self.venue_to_client.get(&fill.venue_order_id).cloned()
        };

        let Some(client_id) = client_id else {
            self.stats.buffered_fills += 1;
            self.pending_fills
                .entry(fill.venue_order_id)
                .or_default()
                .push(fill.clone());
            return FillOutcome::UnknownOrder;
        };

        let Some(order) = self.orders.get_mut(&client_id) else {
            return FillOutcome::UnknownOrder;
        };

        if order.applied_fill_ids.contains(&fill.fill_id) {
            self.stats.duplicate_fills += 1;
            return FillOutcome::Duplicate;
        }

        if order.state == OrderState::New || order.state == OrderState::Pending {
            // Ack has not landed; keep ordering by replaying after it does.
            self.stats.buffered_fills += 1;
            self.pending_fills
                .entry(fill.venue_order_id)
                .or_default()
                .push(fill.clone());
            return FillOutcome::Buffered;
        }

        order.applied_fill_ids.insert(fill.fill_id);

        let remaining = order.remaining();
        let mut quantity = fill.size;
        let mut clamped = false;
        if quantity > remaining {
            warn!(
                client_id = %client_id,
                fill_id = fill.fill_id,
                fill_size = %fill.size,
                remaining = %remaining,
                "over-fill clamped; scheduling reconciliation"
            );
            quantity = remaining;
            clamped = true;
            self.stats.inconsistent_fills += 1;
            self.needs_reconciliation = true;
        }

        if quantity > Decimal::ZERO {
            let old_notional = order.avg_fill_price * order.filled_size;
            order.filled_size += quantity;
            order.avg_fill_price = (old_notional + fill.price * quantity) / order.filled_size;
            order.cumulative_fee += fill.fee;
        }

        if order.filled_size >= order.size {
            order.state = OrderState::Filled;
            self.stats.filled += 1;
        } else if matches!(
            order.state,
            OrderState::Open | OrderState::Unknown | OrderState::PartiallyFilled
        ) {
            order.state = OrderState::PartiallyFilled;
        }
        order.touch(now);

        let snapshot = order.clone();
        if clamped {
            FillOutcome::Clamped(snapshot)
        } else {
            FillOutcome::Applied(snapshot)
        }
    }

    /// Request a cancel. A terminal order is a no-op returning its state.
    /// Returns the venue order id to cancel on the wire, if known.
    pub fn request_cancel(
        &mut self,
        client_id: &str,
        now: TimestampMs,
    ) -> CoreResult<(OrderState, Option<u64>)> {
        let order = self.get_mut(client_id)?;
        if order.state.is_terminal() {
            return Ok((order.state, None));
        }
        order.state = OrderState::Canceling;
        order.touch(now);
        Ok((OrderState::Canceling, order.venue_order_id))
    }

    /// Venue-confirmed cancel.
    pub fn on_cancel_confirmed(&mut self, venue_order_id: u64, now: TimestampMs) -> Option<Order> {
        let client_id = self.venue_to_client.get(&venue_order_id)?.clone();
        let order = self.orders.get_mut(&client_id)?;
        if order.state.is_terminal() {
            return Some(order.clone());
        }
        order.state = OrderState::Canceled;
        order.touch(now);
        self.stats.canceled += 1;
        Some(order.clone())
    }

    /// Apply a venue order-status update, in adapter-receipt order.
    pub fn on_venue_status(
        &mut self,
        venue_order_id: u64,
        status: VenueOrderStatus,
        now: TimestampMs,
    ) -> Option<Order> {
        let client_id = self.venue_to_client.get(&venue_order_id)?.clone();
        let order = self.orders.get_mut(&client_id)?;

        match status {
            VenueOrderStatus::Open => {
                if matches!(order.state, OrderState::Pending | OrderState::Unknown) {
                    order.state = OrderState::Open;
                }
            }
            VenueOrderStatus::Filled => {
                if order.filled_size != order.size {
                    debug!(
                        client_id = %client_id,
                        filled = %order.filled_size,
                        size = %order.size,
                        "venue reports filled before all fills landed; scheduling reconciliation"
                    );
                    self.needs_reconciliation = true;
                }
                if !order.state.is_terminal() {
                    order.state = OrderState::Filled;
                    self.stats.filled += 1;
                }
            }
            VenueOrderStatus::Canceled => {
                if !order.state.is_terminal() {
                    order.state = OrderState::Canceled;
                    self.stats.canceled += 1;
                }
            }
            VenueOrderStatus::Rejected => {
                if !order.state.is_terminal() {
                    order.state = OrderState::Rejected;
                    self.stats.rejected += 1;
                }
            }
            VenueOrderStatus::Expired => {
                if !order.state.is_terminal() {
                    order.state = OrderState::Expired;
                }
            }
        }
        order.touch(now);
        Some(order.clone())
    }

    /// Move pending orders past the ack timeout into UNKNOWN. Returns the
    /// affected correlation ids; a reconciliation pass resolves them.
    pub fn check_pending_timeouts(&mut self, now: TimestampMs) -> Vec<String> {
        let mut timed_out = Vec::new();
        for (client_id, order) in self.orders.iter_mut() {
            if order.state == OrderState::Pending
                && now - order.updated_at >= self.pending_timeout_ms
            {
                order.state = OrderState::Unknown;
                order.touch(now);
                timed_out.push(client_id.clone());
            }
        }
        if !timed_out.is_empty() {
            self.stats.unknown_transitions += timed_out.len() as u64;
            self.needs_reconciliation = true;
            warn!(count = timed_out.len(), "pending orders timed out into UNKNOWN");
        }
        timed_out
    }

    /// Reconcile against the venue's authoritative open-orders snapshot.
    ///
    /// After this pass the local open set equals the snapshot: locally-open
    /// orders absent from the venue become terminal (FILLED when fully
    /// filled, CANCELED otherwise) and venue orders unknown locally are
    /// adopted.
    pub fn reconcile(&mut self, venue_open: &[VenueOrder], now: TimestampMs) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.stats.reconciliations += 1;

        let venue_ids: BTreeSet<u64> = venue_open.iter().map(|o| o.venue_order_id).collect();

        // Close local orders the venue no longer knows.
        for (client_id, order) in self.orders.iter_mut() {
            if !order.state.is_open() {
                continue;
            }
            let known = order
                .venue_order_id
                .map(|id| venue_ids.contains(&id))
                .unwrap_or(false);
            if !known {
                order.state = if order.filled_size >= order.size && order.size > Decimal::ZERO {
                    OrderState::Filled
                } else {
                    OrderState::Canceled
                };
                order.touch(now);
                report.closed.push(client_id.clone());
            }
        }

        // Refresh or adopt everything the venue reports open.
        for venue_order in venue_open {
            let client_id = self
                .venue_to_client
                .get(&venue_order.venue_order_id)
                .cloned()
                .or_else(|| venue_order.client_id.clone());

            match client_id.and_then(|id| {
                if self.orders.contains_key(&id) {
                    Some(id)
                } else {
                    None
                }
            }) {
                Some(id) => {
                    let Some(order) = self.orders.get_mut(&id) else {
                        continue;
                    };
                    order.venue_order_id = Some(venue_order.venue_order_id);
                    // The venue's cumulative filled size is authoritative.
                    if venue_order.filled_size > order.filled_size {
                        order.filled_size = venue_order.filled_size.min(order.size);
                    }
                    order.state = if order.filled_size > Decimal::ZERO {
                        OrderState::PartiallyFilled
                    } else {
                        OrderState::Open
                    };
                    order.touch(now);
                    self.venue_to_client
                        .insert(venue_order.venue_order_id, id.clone());
                    report.updated += 1;
                }
                None => {
                    let client_id = venue_order
                        .client_id
                        .clone()
                        .unwrap_or_else(|| format!("ext-{}", venue_order.venue_order_id));
                    let mut order = Order::from_request(
                        &OrderRequest::limit(
                            client_id.clone(),
                            venue_order.pair.clone(),
                            venue_order.side,
                            venue_order.price,
                            venue_order.size,
                        ),
                        now,
                    );
                    order.venue_order_id = Some(venue_order.venue_order_id);
                    order.filled_size = venue_order.filled_size.min(venue_order.size);
                    order.state = if order.filled_size > Decimal::ZERO {
                        OrderState::PartiallyFilled
                    } else {
                        OrderState::Open
                    };
                    self.venue_to_client
                        .insert(venue_order.venue_order_id, client_id.clone());
                    self.orders.insert(client_id.clone(), order);
                    report.adopted.push(client_id);
                }
            }
        }

        self.needs_reconciliation = false;
        report
    }

    pub fn needs_reconciliation(&self) -> bool {
        self.needs_reconciliation
    }

    pub fn schedule_reconciliation(&mut self) {
        self.needs_reconciliation = true;
    }

    pub fn get(&self, client_id: &str) -> Option<&Order> {
        self.orders.get(client_id)
    }

    pub fn get_by_venue_id(&self, venue_order_id: u64) -> Option<&Order> {
        self.venue_to_client
            .get(&venue_order_id)
            .and_then(|id| self.orders.get(id))
    }

    pub fn open_orders(&self) -> Vec<Order> {
        let mut open: Vec<Order> = self
            .orders
            .values()
            .filter(|o| o.state.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        open
    }

    /// Terminal orders, retained as history.
    pub fn history(&self) -> Vec<Order> {
        let mut done: Vec<Order> = self
            .orders
            .values()
            .filter(|o| o.state.is_terminal())
            .cloned()
            .collect();
        done.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        done
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }

    fn get_mut(&mut self, client_id: &str) -> CoreResult<&mut Order> {
        self.orders
            .get_mut(client_id)
            .ok_or_else(|| CoreError::OrderNotFound(client_id.to_string()))
    }

    fn replay_buffered_fills(&mut self, venue_order_id: u64, now: TimestampMs) {
        if let Some(fills) = self.pending_fills.remove(&venue_order_id) {
            for fill in fills {
                self.on_fill(&fill, now);
            }
        }
    }
}
