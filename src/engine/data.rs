//! Data Engine
//!
//! Normalizes raw venue messages into the typed event schema and fans out:
//! market events to the bus, the cache, and the live order books; account
//! events to the order manager and position tracker before they reach the
//! bus. One engine task per venue preserves per-channel ordering end-to-end.

use crate::bus::EventBus;
use crate::cache::MarketCache;
use crate::engine::orders::{OrderManager, VenueOrderStatus};
use crate::engine::positions::PositionTracker;
use crate::error::CoreResult;
use crate::events::{topics, AccountEvent, BusEvent, MarketEvent, TradeEvent};
use crate::exchange::{ExchangeAdapter, RawBook, RawFill, RawOrderUpdate, RawTrade, VenueMessage};
use crate::orderbook::{BookDelta, BookLevel, BookSnapshot, DeltaResult};
use crate::types::{Candle, Fill, Side, SymbolMapper, Ticker, TimestampMs, TradingPair};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Data engine for one venue.
pub struct DataEngine {
    venue: String,
    mapper: SymbolMapper,
    bus: Arc<EventBus>,
    cache: Arc<MarketCache>,
    orders: Arc<Mutex<OrderManager>>,
    positions: Arc<Mutex<PositionTracker>>,
    /// Used to fetch fresh snapshots on a sequence gap; absent in tests.
    adapter: Option<Arc<dyn ExchangeAdapter>>,
    /// Bar aggregation interval.
    bar_interval_ms: i64,
    candles: HashMap<TradingPair, Candle>,
}

impl DataEngine {
    pub fn new(
        venue: impl Into<String>,
        bus: Arc<EventBus>,
        cache: Arc<MarketCache>,
        orders: Arc<Mutex<OrderManager>>,
        positions: Arc<Mutex<PositionTracker>>,
        adapter: Option<Arc<dyn ExchangeAdapter>>,
        bar_interval_ms: i64,
    ) -> Self {
        Self {
            venue: venue.into(),
            mapper: SymbolMapper::default(),
            bus,
            cache,
            orders,
            positions,
            adapter,
            bar_interval_ms: bar_interval_ms.max(1_000),
            candles: HashMap::new(),
        }
    }

    /// Drive the engine until the stream closes or shutdown fires.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<VenueMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(venue = %self.venue, "data engine started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(venue = %self.venue, "data engine stopping");
                    return;
                }
                message = rx.recv() => {
                    match message {
                        Some(message) => self.handle(message).await,
                        None => {
                            info!(venue = %self.venue, "venue stream closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub async fn handle(&mut self, message: VenueMessage) {
        match message {
            VenueMessage::Connected => {
                info!(venue = %self.venue, "venue stream connected");
            }
            VenueMessage::Disconnected { reason } => {
                warn!(venue = %self.venue, reason = %reason, "venue stream disconnected");
                // Open state is suspect after a drop; reconcile on reconnect.
                self.orders.lock().schedule_reconciliation();
            }
            VenueMessage::Book(raw) => self.on_book(raw).await,
            VenueMessage::Trade(raw) => self.on_trade(raw).await,
            VenueMessage::OrderUpdate(raw) => self.on_order_update(raw).await,
            VenueMessage::Fill(raw) => self.on_fill(raw).await,
        }
    }

    async fn on_book(&mut self, raw: RawBook) {
        let pair = self.mapper.from_venue(&raw.coin);
        let Ok(bids) = convert_levels(&raw.bids) else {
            warn!(coin = %raw.coin, "dropping book with malformed bid levels");
            return;
        };
        let Ok(asks) = convert_levels(&raw.asks) else {
            warn!(coin = %raw.coin, "dropping book with malformed ask levels");
            return;
        };

        let book_handle = self.cache.book(&self.venue, &pair);
        let topic = topics::market_book(&self.venue, &pair);

        if raw.is_snapshot {
            let snapshot = BookSnapshot {
                pair: pair.clone(),
                bids,
                asks,
                seq: raw.seq,
                ts: raw.ts,
            };
            book_handle.write().apply_snapshot(snapshot.clone());
            self.update_ticker_from_book(&pair, raw.ts);
            let _ = self
                .bus
                .publish(&topic, BusEvent::Market(MarketEvent::BookSnapshot(snapshot)))
                .await;
        } else {
            let delta = BookDelta {
                pair: pair.clone(),
                bid_updates: bids,
                ask_updates: asks,
                seq: raw.seq,
                ts: raw.ts,
            };
            let result = book_handle.write().apply_delta(delta.clone());
            match result {
                DeltaResult::Applied => {
                    self.update_ticker_from_book(&pair, raw.ts);
                    let _ = self
                        .bus
                        .publish(&topic, BusEvent::Market(MarketEvent::BookDelta(delta)))
                        .await;
                }
                DeltaResult::Stale => {
                    debug!(seq = raw.seq, "dropped stale book delta");
                }
                DeltaResult::GapDetected => {
                    let last_seq = book_handle.read().last_seq();
                    warn!(
                        pair = %pair,
                        seq = raw.seq,
                        last_seq,
                        "book sequence gap; requesting resync"
                    );
                    let _ = self
                        .bus
                        .publish(
                            &topic,
                            BusEvent::Market(MarketEvent::BookResyncNeeded {
                                pair: pair.clone(),
                                last_seq,
                            }),
                        )
                        .await;
                    self.resync_book(&pair).await;
                }
                DeltaResult::Buffered => {}
            }
        }
    }

    async fn resync_book(&self, pair: &TradingPair) {
        let Some(adapter) = &self.adapter else {
            return;
        };
        match adapter.get_orderbook(pair, 50).await {
            Ok(snapshot) => {
                let book_handle = self.cache.book(&self.venue, pair);
                book_handle.write().apply_snapshot(snapshot);
                info!(pair = %pair, "book resynced from venue snapshot");
            }
            Err(e) => {
                warn!(pair = %pair, error = %e, "book resync fetch failed");
            }
        }
    }

    async fn on_trade(&mut self, raw: RawTrade) {
        let pair = self.mapper.from_venue(&raw.coin);
        let (Ok(price), Ok(size)) = (parse_decimal(&raw.px), parse_decimal(&raw.sz)) else {
            warn!(coin = %raw.coin, "dropping malformed trade");
            return;
        };

        let trade = TradeEvent {
            pair: pair.clone(),
            price,
            size,
            side: if raw.is_buy { Side::Buy } else { Side::Sell },
            ts: raw.ts,
        };
        let _ = self
            .bus
            .publish(
                &topics::market_trade(&self.venue, &pair),
                BusEvent::Market(MarketEvent::Trade(trade)),
            )
            .await;

        // Ticker mark follows the last trade.
        let book_handle = self.cache.book(&self.venue, &pair);
        let (bid, ask) = {
            let book = book_handle.read();
            (
                book.best_bid().map(|l| l.price),
                book.best_ask().map(|l| l.price),
            )
        };
        let ticker = Ticker {
            pair: pair.clone(),
            mark: price,
            bid,
            ask,
            ts: raw.ts,
        };
        self.cache.set_ticker(&self.venue, ticker.clone());
        let _ = self
            .bus
            .publish(
                &topics::market_ticker(&self.venue, &pair),
                BusEvent::Market(MarketEvent::Ticker(ticker)),
            )
            .await;

        self.advance_candle(pair, price, size, raw.ts).await;
    }

    async fn advance_candle(
        &mut self,
        pair: TradingPair,
        price: Decimal,
        size: Decimal,
        ts: TimestampMs,
    ) {
        let bucket = ts - ts.rem_euclid(self.bar_interval_ms);
        let candle = self
            .candles
            .entry(pair.clone())
            .or_insert_with(|| Candle::new(bucket));

        if bucket > candle.ts {
            if let Some(bar) = candle.finalize() {
                let _ = self
                    .bus
                    .publish(
                        &topics::market_bar(&self.venue, &pair),
                        BusEvent::Market(MarketEvent::Bar {
                            pair: pair.clone(),
                            bar,
                        }),
                    )
                    .await;
            }
            *candle = Candle::new(bucket);
        }
        candle.update(price, size);
    }

    async fn on_order_update(&mut self, raw: RawOrderUpdate) {
        let Some(status) = parse_status(&raw.status) else {
            debug!(status = %raw.status, "ignoring unknown order status");
            return;
        };

        let updated = self
            .orders
            .lock()
            .on_venue_status(raw.venue_order_id, status, raw.ts);

        if let Some(order) = updated {
            self.refresh_open_orders(raw.ts);
            let _ = self
                .bus
                .publish(
                    &topics::account_order(&self.venue),
                    BusEvent::Account(AccountEvent::OrderUpdate(order)),
                )
                .await;
        }
    }

    async fn on_fill(&mut self, raw: RawFill) {
        let pair = self.mapper.from_venue(&raw.coin);
        let (Ok(price), Ok(size), Ok(fee)) = (
            parse_decimal(&raw.px),
            parse_decimal(&raw.sz),
            parse_decimal(&raw.fee),
        ) else {
            warn!(coin = %raw.coin, fill_id = raw.fill_id, "dropping malformed fill");
            return;
        };

        let fill = Fill {
            fill_id: raw.fill_id,
            client_id: raw.client_id.unwrap_or_default(),
            venue_order_id: raw.venue_order_id,
            pair: pair.clone(),
            side: if raw.is_buy { Side::Buy } else { Side::Sell },
            size,
            price,
            fee,
            ts: raw.ts,
        };

        use crate::engine::orders::FillOutcome;
        let (outcome, order_snapshot) = {
            let mut orders = self.orders.lock();
            let outcome = orders.on_fill(&fill, raw.ts);
            let snapshot = match &outcome {
                FillOutcome::Applied(order) | FillOutcome::Clamped(order) => Some(order.clone()),
                _ => None,
            };
            (outcome, snapshot)
        };

        match outcome {
            FillOutcome::Applied(_) | FillOutcome::Clamped(_) => {
                let position = self.positions.lock().on_fill(&fill);
                self.cache.set_position(&self.venue, position.clone());
                self.refresh_open_orders(raw.ts);

                if let Some(order) = order_snapshot {
                    let _ = self
                        .bus
                        .publish(
                            &topics::account_order(&self.venue),
                            BusEvent::Account(AccountEvent::OrderUpdate(order)),
                        )
                        .await;
                }
                let _ = self
                    .bus
                    .publish(
                        &topics::account_fill(&self.venue),
                        BusEvent::Account(AccountEvent::Fill(fill)),
                    )
                    .await;
                let _ = self
                    .bus
                    .publish(
                        &topics::account_position(&self.venue),
                        BusEvent::Account(AccountEvent::PositionSnapshot {
                            pair,
                            size: position.size,
                            entry_price: position.entry_price,
                            leverage: position.leverage,
                            margin_used: position.margin_used,
                            ts: raw.ts,
                        }),
                    )
                    .await;
            }
            FillOutcome::Duplicate => {
                debug!(fill_id = raw.fill_id, "duplicate fill dropped");
            }
            FillOutcome::Buffered | FillOutcome::UnknownOrder => {
                debug!(
                    fill_id = raw.fill_id,
                    venue_order_id = raw.venue_order_id,
                    "fill buffered until order is known"
                );
            }
        }
    }

    fn refresh_open_orders(&self, ts: TimestampMs) {
        let open = self.orders.lock().open_orders();
        self.cache.set_open_orders(&self.venue, open, ts);
    }
}

fn convert_levels(raw: &[crate::exchange::RawLevel]) -> CoreResult<Vec<BookLevel>> {
    raw.iter()
        .map(|level| {
            Ok(BookLevel {
                price: parse_decimal(&level.px)?,
                size: parse_decimal(&level.sz)?,
                order_count: level.n,
            })
        })
        .collect()
}

fn parse_decimal(raw: &str) -> CoreResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| crate::error::CoreError::Validation(format!("bad decimal '{}': {}", raw, e)))
}

fn parse_status(raw: &str) -> Option<VenueOrderStatus> {
    match raw {
        "open" => Some(VenueOrderStatus::Open),
        "filled" => Some(VenueOrderStatus::Filled),
        "canceled" | "marginCanceled" | "liquidatedCanceled" => Some(VenueOrderStatus::Canceled),
        "rejected" => Some(VenueOrderStatus::Rejected),
        "expired" => Some(VenueOrderStatus::Expired),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBusConfig;
    use crate::exchange::RawLevel;
    use rust_decimal_macros::dec;

    fn engine_with_bus() -> (DataEngine, Arc<EventBus>, Arc<MarketCache>) {
        let bus = EventBus::new(EventBusConfig::default());
        let cache = MarketCache::new();
        let orders = Arc::new(Mutex::new(OrderManager::new("hyperliquid", 10_000)));
        let positions = Arc::new(Mutex::new(PositionTracker::new("hyperliquid")));
        let engine = DataEngine::new(
            "hyperliquid",
            bus.clone(),
            cache.clone(),
            orders,
            positions,
            None,
            60_000,
        );
        (engine, bus, cache)
    }

    fn level(px: &str, sz: &str) -> RawLevel {
        RawLevel {
            px: px.into(),
            sz: sz.into(),
            n: None,
        }
    }

    fn book(seq: u64, is_snapshot: bool) -> RawBook {
        RawBook {
            coin: "BTC".into(),
            is_snapshot,
            seq,
            ts: seq as i64,
            bids: vec![level("100", "1")],
            asks: vec![level("101", "1")],
        }
    }

    #[tokio::test]
    async fn test_snapshot_feeds_cache_and_bus() {
        let (mut engine, bus, cache) = engine_with_bus();
        let mut sub = bus.subscribe("market.*");

        engine.handle(VenueMessage::Book(book(10, true))).await;

        let pair = TradingPair::new("BTC", "USDC");
        let handle = cache.book("hyperliquid", &pair);
        assert!(handle.read().is_synced());
        assert_eq!(handle.read().best_bid().unwrap().price, dec!(100));

        let (topic, event) = sub.recv().await.unwrap();
        assert_eq!(topic, "market.hyperliquid.BTC-USDC.book");
        assert!(matches!(
            event,
            BusEvent::Market(MarketEvent::BookSnapshot(_))
        ));
    }

    #[tokio::test]
    async fn test_sequence_gap_publishes_resync() {
        let (mut engine, bus, _cache) = engine_with_bus();
        engine.handle(VenueMessage::Book(book(10, true))).await;

        let mut sub = bus.subscribe("market.*");
        engine.handle(VenueMessage::Book(book(11, false))).await;
        // Skip 12: gap.
        engine.handle(VenueMessage::Book(book(13, false))).await;

        let mut saw_resync = false;
        while let Some((_, event)) = sub.try_recv() {
            if matches!(
                event,
                BusEvent::Market(MarketEvent::BookResyncNeeded { last_seq: 11, .. })
            ) {
                saw_resync = true;
            }
        }
        assert!(saw_resync);
    }

    #[tokio::test]
    async fn test_trade_updates_ticker_and_candle() {
        let (mut engine, bus, cache) = engine_with_bus();
        let mut sub = bus.subscribe("market.hyperliquid.BTC-USDC.bar");

        let trade = |px: &str, ts: i64| {
            VenueMessage::Trade(RawTrade {
                coin: "BTC".into(),
                px: px.into(),
                sz: "1".into(),
                is_buy: true,
                ts,
            })
        };

        engine.handle(trade("100", 10_000)).await;
        engine.handle(trade("105", 20_000)).await;
        let pair = TradingPair::new("BTC", "USDC");
        let ticker = cache.ticker("hyperliquid", &pair).unwrap();
        assert_eq!(ticker.value.mark, dec!(105));

        // Crossing the minute boundary emits the finalized bar.
        engine.handle(trade("110", 61_000)).await;
        let (_, event) = sub.recv().await.unwrap();
        match event {
            BusEvent::Market(MarketEvent::Bar { bar, .. }) => {
                assert_eq!(bar.open, dec!(100));
                assert_eq!(bar.close, dec!(105));
                assert_eq!(bar.volume, dec!(2));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fill_flows_to_positions() {
        let (mut engine, _bus, cache) = engine_with_bus();

        // Register and ack an order so the fill can be correlated.
        {
            let mut orders = engine.orders.lock();
            let request = crate::types::OrderRequest::limit(
                "c1",
                TradingPair::new("BTC", "USDC"),
                Side::Buy,
                dec!(100),
                dec!(1),
            );
            orders.register(&request, 0);
            orders.mark_pending("c1", 0).unwrap();
            orders
                .on_ack("c1", &crate::exchange::OrderAck::Resting { venue_order_id: 7 }, 0)
                .unwrap();
        }

        engine
            .handle(VenueMessage::Fill(RawFill {
                fill_id: 1,
                venue_order_id: 7,
                client_id: Some("c1".into()),
                coin: "BTC".into(),
                px: "100".into(),
                sz: "1".into(),
                fee: "0.05".into(),
                is_buy: true,
                ts: 1_000,
            }))
            .await;

        let pair = TradingPair::new("BTC", "USDC");
        let position = cache.position("hyperliquid", &pair).unwrap();
        assert_eq!(position.value.size, dec!(1));
        assert_eq!(position.value.cumulative_fees, dec!(0.05));
    }
}
