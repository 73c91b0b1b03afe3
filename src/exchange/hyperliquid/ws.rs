//! Hyperliquid WebSocket Worker
//!
//! Maintains one connection, subscribes the requested channels, and forwards
//! parsed venue messages downstream. Reconnects with exponential backoff and
//! fails the link after 30s of silence; per-channel ordering is preserved by
//! the single read loop.

use crate::exchange::hyperliquid::messages::{
    WireBook, WsFill, WsMessage, WsOrderUpdate, WsRequest, WsTrade,
};
use crate::exchange::{Backoff, Channel, RawBook, RawFill, RawLevel, RawOrderUpdate, RawTrade, VenueMessage};
use crate::types::SymbolMapper;
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const PING_INTERVAL: Duration = Duration::from_secs(15);
const SILENCE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct WsWorker {
    ws_url: String,
    wallet_address: Option<String>,
    channels: Vec<Channel>,
    mapper: SymbolMapper,
    out: mpsc::Sender<VenueMessage>,
    shutdown: watch::Receiver<bool>,
}

impl WsWorker {
    pub fn spawn(
        ws_url: String,
        wallet_address: Option<String>,
        channels: Vec<Channel>,
        mapper: SymbolMapper,
        out: mpsc::Sender<VenueMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let worker = Self {
            ws_url,
            wallet_address,
            channels,
            mapper,
            out,
            shutdown,
        };
        tokio::spawn(async move {
            worker.run().await;
        })
    }

    async fn run(mut self) {
        let mut backoff = Backoff::default();

        loop {
            if *self.shutdown.borrow() {
                return;
            }

            let connected_at = tokio::time::Instant::now();
            match self.connect_and_stream().await {
                Ok(()) => {
                    // Clean shutdown.
                    return;
                }
                Err(e) => {
                    // A connection that held for a while earns a fresh
                    // backoff schedule.
                    if connected_at.elapsed() > Duration::from_secs(60) {
                        backoff.reset();
                    }
                    let _ = self
                        .out
                        .send(VenueMessage::Disconnected {
                            reason: e.to_string(),
                        })
                        .await;
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "venue stream disconnected; reconnecting");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.changed() => return,
                    }
                }
            }
        }
    }

    async fn connect_and_stream(&mut self) -> Result<()> {
        info!(url = %self.ws_url, "connecting venue websocket");
        let (stream, _) = connect_async(&self.ws_url)
            .await
            .context("websocket connect")?;
        let (mut write, mut read) = stream.split();

        for subscription in self.subscriptions() {
            let request = WsRequest::subscribe(subscription);
            let payload = serde_json::to_string(&request).context("encode subscribe")?;
            write.send(Message::Text(payload)).await.context("send subscribe")?;
        }

        let _ = self.out.send(VenueMessage::Connected).await;
        info!(channels = self.channels.len(), "venue websocket subscribed");

        let mut ping = interval(PING_INTERVAL);
        ping.reset();

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = ping.tick() => {
                    let payload = serde_json::to_string(&WsRequest::ping())
                        .context("encode ping")?;
                    write.send(Message::Text(payload)).await.context("send ping")?;
                }
                message = timeout(SILENCE_TIMEOUT, read.next()) => {
                    let message = message
                        .map_err(|_| anyhow::anyhow!("no message within {:?}", SILENCE_TIMEOUT))?;
                    match message {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = write.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("server closed connection: {:?}", frame);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => anyhow::bail!("read error: {}", e),
                        None => anyhow::bail!("stream ended"),
                    }
                }
            }
        }
    }

    fn subscriptions(&self) -> Vec<serde_json::Value> {
        let mut subscriptions = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            match channel {
                Channel::L2Book(pair) => {
                    subscriptions.push(json!({
                        "type": "l2Book",
                        "coin": self.mapper.to_venue(pair),
                    }));
                }
                Channel::Trades(pair) => {
                    subscriptions.push(json!({
                        "type": "trades",
                        "coin": self.mapper.to_venue(pair),
                    }));
                }
                Channel::OrderUpdates => {
                    if let Some(user) = &self.wallet_address {
                        subscriptions.push(json!({
                            "type": "orderUpdates",
                            "user": user,
                        }));
                    }
                }
                Channel::UserFills => {
                    if let Some(user) = &self.wallet_address {
                        subscriptions.push(json!({
                            "type": "userFills",
                            "user": user,
                        }));
                    }
                }
            }
        }
        subscriptions
    }

    async fn handle_text(&self, text: &str) {
        let envelope: WsMessage = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable ws message");
                return;
            }
        };

        match envelope.channel.as_str() {
            "l2Book" => {
                if let Ok(book) = serde_json::from_value::<WireBook>(envelope.data) {
                    let _ = self.out.send(VenueMessage::Book(raw_book(book))).await;
                }
            }
            "trades" => {
                if let Ok(trades) = serde_json::from_value::<Vec<WsTrade>>(envelope.data) {
                    for trade in trades {
                        let _ = self.out.send(VenueMessage::Trade(raw_trade(trade))).await;
                    }
                }
            }
            "orderUpdates" => {
                if let Ok(updates) = serde_json::from_value::<Vec<WsOrderUpdate>>(envelope.data) {
                    for update in updates {
                        let _ = self
                            .out
                            .send(VenueMessage::OrderUpdate(raw_order_update(update)))
                            .await;
                    }
                }
            }
            "userFills" => {
                if let Ok(payload) =
                    serde_json::from_value::<crate::exchange::hyperliquid::messages::WsUserFills>(
                        envelope.data,
                    )
                {
                    // The initial snapshot replays historical fills; the fill-id
                    // dedup downstream makes re-delivery harmless.
                    for fill in payload.fills {
                        let _ = self.out.send(VenueMessage::Fill(raw_fill(fill))).await;
                    }
                }
            }
            "subscriptionResponse" | "pong" => {}
            other => debug!(channel = other, "ignoring unknown channel"),
        }
    }
}

fn raw_book(book: WireBook) -> RawBook {
    let mut levels = book.levels.into_iter();
    let bids = levels.next().unwrap_or_default();
    let asks = levels.next().unwrap_or_default();
    RawBook {
        coin: book.coin,
        is_snapshot: book.is_snapshot.unwrap_or(true),
        seq: book.time,
        ts: book.time as i64,
        bids: bids
            .into_iter()
            .map(|l| RawLevel {
                px: l.px,
                sz: l.sz,
                n: Some(l.n),
            })
            .collect(),
        asks: asks
            .into_iter()
            .map(|l| RawLevel {
                px: l.px,
                sz: l.sz,
                n: Some(l.n),
            })
            .collect(),
    }
}

fn raw_trade(trade: WsTrade) -> RawTrade {
    RawTrade {
        coin: trade.coin,
        px: trade.px,
        sz: trade.sz,
        is_buy: trade.side == "B",
        ts: trade.time as i64,
    }
}

fn raw_order_update(update: WsOrderUpdate) -> RawOrderUpdate {
    RawOrderUpdate {
        venue_order_id: update.order.oid,
        client_id: update.order.cloid,
        coin: update.order.coin,
        status: update.status,
        remaining_sz: update.order.sz,
        orig_sz: update.order.orig_sz,
        ts: update.status_timestamp as i64,
    }
}

fn raw_fill(fill: WsFill) -> RawFill {
    RawFill {
        fill_id: fill.tid,
        venue_order_id: fill.oid,
        client_id: fill.cloid,
        coin: fill.coin,
        px: fill.px,
        sz: fill.sz,
        fee: fill.fee.unwrap_or_else(|| "0".to_string()),
        is_buy: fill.side == "B",
        ts: fill.time as i64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_book_splits_sides() {
        let book = WireBook {
            coin: "BTC".into(),
            time: 1_700_000_000_000,
            levels: vec![
                vec![crate::exchange::hyperliquid::messages::WireLevel {
                    px: "50000".into(),
                    sz: "1".into(),
                    n: 2,
                }],
                vec![crate::exchange::hyperliquid::messages::WireLevel {
                    px: "50010".into(),
                    sz: "2".into(),
                    n: 1,
                }],
            ],
            is_snapshot: None,
        };

        let raw = raw_book(book);
        assert!(raw.is_snapshot);
        assert_eq!(raw.seq, 1_700_000_000_000);
        assert_eq!(raw.bids.len(), 1);
        assert_eq!(raw.asks[0].px, "50010");
    }

    #[test]
    fn test_raw_trade_side() {
        let trade = WsTrade {
            coin: "BTC".into(),
            side: "B".into(),
            px: "50000".into(),
            sz: "0.5".into(),
            time: 5,
            tid: 9,
        };
        assert!(raw_trade(trade).is_buy);
    }
}
