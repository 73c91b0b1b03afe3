//! Hyperliquid Adapter
//!
//! `ExchangeAdapter` implementation for Hyperliquid perpetuals: JSON info
//! queries, EIP-712-signed MessagePack actions, and the subscription
//! WebSocket. Prices are quantized to the venue's per-asset precision
//! (6 - szDecimals for perps) before anything is signed.

pub mod http;
pub mod messages;
pub mod signer;
pub mod ws;

use crate::error::{CoreError, CoreResult};
use crate::exchange::{
    Channel, ExchangeAdapter, OrderAck, RateLimiter, VenueMessage, VenueOrder, VenuePosition,
};
use crate::orderbook::{BookLevel, BookSnapshot};
use crate::types::{
    now_ms, Balance, OrderRequest, OrderType, Side, SymbolMapper, Ticker, TimeInForce, TradingPair,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use self::http::HyperliquidHttpClient;
use self::messages::{
    tif_label, CancelAction, OrderAction, WireCancel, WireOrder, WireOrderStatus, WireOrderType,
    WireTif,
};
use self::signer::ActionSigner;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

pub const VENUE: &str = "hyperliquid";

const MAINNET_API: &str = "https://api.hyperliquid.xyz";
const MAINNET_WS: &str = "wss://api.hyperliquid.xyz/ws";
const TESTNET_API: &str = "https://api.hyperliquid-testnet.xyz";
const TESTNET_WS: &str = "wss://api.hyperliquid-testnet.xyz/ws";

/// Perp price decimal budget: price decimals = 6 - szDecimals.
const PERP_MAX_DECIMALS: u32 = 6;

/// Slippage bound applied when emulating market orders as IOC limits.
const MARKET_SLIPPAGE_BPS: i64 = 500;

#[derive(Debug, Clone)]
pub struct HyperliquidConfig {
    pub api_url: String,
    pub ws_url: String,
    pub wallet_address: Option<String>,
    pub private_key: Option<String>,
    pub testnet: bool,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

impl HyperliquidConfig {
    pub fn new(testnet: bool) -> Self {
        Self {
            api_url: if testnet { TESTNET_API } else { MAINNET_API }.to_string(),
            ws_url: if testnet { TESTNET_WS } else { MAINNET_WS }.to_string(),
            wallet_address: None,
            private_key: None,
            testnet,
            rate_limit_per_sec: 20,
            rate_limit_burst: 20,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AssetMeta {
    index: u64,
    sz_decimals: u32,
}

pub struct HyperliquidAdapter {
    config: HyperliquidConfig,
    http: HyperliquidHttpClient,
    signer: Option<ActionSigner>,
    mapper: SymbolMapper,
    assets: RwLock<HashMap<String, AssetMeta>>,
    connected: AtomicBool,
    last_nonce: AtomicU64,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl HyperliquidAdapter {
    pub fn new(config: HyperliquidConfig) -> CoreResult<Self> {
        let rate_limiter = Arc::new(RateLimiter::with_burst(
            config.rate_limit_per_sec,
            config.rate_limit_burst,
        ));
        let http = HyperliquidHttpClient::new(config.api_url.clone(), rate_limiter)?;
        let signer = match &config.private_key {
            Some(key) => Some(ActionSigner::new(key, config.testnet)?),
            None => None,
        };
        Ok(Self {
            config,
            http,
            signer,
            mapper: SymbolMapper::default(),
            assets: RwLock::new(HashMap::new()),
            connected: AtomicBool::new(false),
            last_nonce: AtomicU64::new(0),
            shutdown: Mutex::new(None),
        })
    }

    pub fn mapper(&self) -> &SymbolMapper {
        &self.mapper
    }

    fn wallet(&self) -> CoreResult<&str> {
        self.config
            .wallet_address
            .as_deref()
            .ok_or_else(|| CoreError::Auth("wallet address not configured".into()))
    }

    fn signer(&self) -> CoreResult<&ActionSigner> {
        self.signer
            .as_ref()
            .ok_or_else(|| CoreError::Auth("private key not configured".into()))
    }

    fn asset(&self, pair: &TradingPair) -> CoreResult<AssetMeta> {
        let coin = self.mapper.to_venue(pair);
        self.assets.read().get(&coin).copied().ok_or_else(|| {
            CoreError::Validation(format!("unknown asset {} (is the adapter connected?)", coin))
        })
    }

    /// Strictly-increasing millisecond nonce.
    fn next_nonce(&self) -> u64 {
        let now = now_ms() as u64;
        let previous = self.last_nonce.fetch_max(now, Ordering::SeqCst);
        if previous >= now {
            self.last_nonce.fetch_add(1, Ordering::SeqCst) + 1
        } else {
            now
        }
    }

    fn format_price(&self, meta: AssetMeta, price: Decimal) -> String {
        let decimals = PERP_MAX_DECIMALS.saturating_sub(meta.sz_decimals);
        price.round_dp(decimals).normalize().to_string()
    }

    fn format_size(&self, meta: AssetMeta, size: Decimal) -> String {
        size.round_dp(meta.sz_decimals).normalize().to_string()
    }

    async fn market_limit_price(&self, pair: &TradingPair, side: Side) -> CoreResult<Decimal> {
        let coin = self.mapper.to_venue(pair);
        let mids = self.http.all_mids().await?;
        let mid = mids
            .get(&coin)
            .ok_or_else(|| CoreError::Validation(format!("no mid for {}", coin)))
            .and_then(|raw| parse_decimal(raw))?;
        let bps = Decimal::new(MARKET_SLIPPAGE_BPS, 4);
        Ok(match side {
            Side::Buy => mid * (Decimal::ONE + bps),
            Side::Sell => mid * (Decimal::ONE - bps),
        })
    }

    async fn signed_exchange(
        &self,
        action_json: serde_json::Value,
        action_packed: &impl serde::Serialize,
    ) -> CoreResult<messages::ExchangeResponse> {
        let nonce = self.next_nonce();
        let signature = self.signer()?.sign_action(action_packed, nonce, None)?;
        self.http.exchange(action_json, signature, nonce).await
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn venue(&self) -> &str {
        VENUE
    }

    async fn connect(&self) -> CoreResult<()> {
        let meta = self.http.meta().await?;
        let mut assets = self.assets.write();
        assets.clear();
        for (index, asset) in meta.universe.iter().enumerate() {
            if asset.is_delisted.unwrap_or(false) {
                continue;
            }
            assets.insert(
                asset.name.clone(),
                AssetMeta {
                    index: index as u64,
                    sz_decimals: asset.sz_decimals,
                },
            );
        }
        drop(assets);
        self.connected.store(true, Ordering::SeqCst);
        info!(
            venue = VENUE,
            assets = self.assets.read().len(),
            testnet = self.config.testnet,
            "adapter connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> CoreResult<()> {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(&self, channels: &[Channel]) -> CoreResult<mpsc::Receiver<VenueMessage>> {
        let (tx, rx) = mpsc::channel(4096);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        ws::WsWorker::spawn(
            self.config.ws_url.clone(),
            self.config.wallet_address.clone(),
            channels.to_vec(),
            self.mapper.clone(),
            tx,
            shutdown_rx,
        );
        Ok(rx)
    }

    async fn get_ticker(&self, pair: &TradingPair) -> CoreResult<Ticker> {
        let coin = self.mapper.to_venue(pair);
        let mids = self.http.all_mids().await?;
        let mark = mids
            .get(&coin)
            .ok_or_else(|| CoreError::Validation(format!("no mid for {}", coin)))
            .and_then(|raw| parse_decimal(raw))?;

        let book = self.http.l2_book(&coin).await?;
        let bid = book
            .levels
            .first()
            .and_then(|side| side.first())
            .map(|level| parse_decimal(&level.px))
            .transpose()?;
        let ask = book
            .levels
            .get(1)
            .and_then(|side| side.first())
            .map(|level| parse_decimal(&level.px))
            .transpose()?;

        Ok(Ticker {
            pair: pair.clone(),
            mark,
            bid,
            ask,
            ts: book.time as i64,
        })
    }

    async fn get_orderbook(&self, pair: &TradingPair, depth: usize) -> CoreResult<BookSnapshot> {
        let coin = self.mapper.to_venue(pair);
        let book = self.http.l2_book(&coin).await?;

        let mut sides = book.levels.into_iter();
        let bids = sides.next().unwrap_or_default();
        let asks = sides.next().unwrap_or_default();

        let convert = |levels: Vec<messages::WireLevel>| -> CoreResult<Vec<BookLevel>> {
            levels
                .into_iter()
                .take(depth)
                .map(|level| {
                    Ok(BookLevel {
                        price: parse_decimal(&level.px)?,
                        size: parse_decimal(&level.sz)?,
                        order_count: Some(level.n),
                    })
                })
                .collect()
        };

        Ok(BookSnapshot {
            pair: pair.clone(),
            bids: convert(bids)?,
            asks: convert(asks)?,
            seq: book.time,
            ts: book.time as i64,
        })
    }

    async fn get_balances(&self) -> CoreResult<Vec<Balance>> {
        let state = self.http.clearinghouse_state(self.wallet()?).await?;
        let total = parse_decimal(&state.margin_summary.account_value)?;
        let free = state
            .withdrawable
            .as_deref()
            .map(parse_decimal)
            .transpose()?
            .unwrap_or(total);
        Ok(vec![Balance {
            asset: "USDC".to_string(),
            total,
            free,
        }])
    }

    async fn get_positions(&self) -> CoreResult<Vec<VenuePosition>> {
        let state = self.http.clearinghouse_state(self.wallet()?).await?;
        let mut positions = Vec::with_capacity(state.asset_positions.len());
        for entry in state.asset_positions {
            let raw = entry.position;
            let size = parse_decimal(&raw.szi)?;
            if size.is_zero() {
                continue;
            }
            positions.push(VenuePosition {
                pair: self.mapper.from_venue(&raw.coin),
                size,
                entry_price: raw
                    .entry_px
                    .as_deref()
                    .map(parse_decimal)
                    .transpose()?
                    .unwrap_or(Decimal::ZERO),
                leverage: raw
                    .leverage
                    .map(|l| Decimal::from(l.value))
                    .unwrap_or(Decimal::ONE),
                margin_used: raw
                    .margin_used
                    .as_deref()
                    .map(parse_decimal)
                    .transpose()?
                    .unwrap_or(Decimal::ZERO),
                unrealized_pnl: raw
                    .unrealized_pnl
                    .as_deref()
                    .map(parse_decimal)
                    .transpose()?
                    .unwrap_or(Decimal::ZERO),
            });
        }
        Ok(positions)
    }

    async fn get_open_orders(&self) -> CoreResult<Vec<VenueOrder>> {
        let raw_orders = self.http.open_orders(self.wallet()?).await?;
        let mut orders = Vec::with_capacity(raw_orders.len());
        for raw in raw_orders {
            let remaining = parse_decimal(&raw.sz)?;
            let size = raw
                .orig_sz
                .as_deref()
                .map(parse_decimal)
                .transpose()?
                .unwrap_or(remaining);
            orders.push(VenueOrder {
                venue_order_id: raw.oid,
                client_id: raw.cloid,
                pair: self.mapper.from_venue(&raw.coin),
                side: if raw.side == "B" { Side::Buy } else { Side::Sell },
                price: parse_decimal(&raw.limit_px)?,
                size,
                filled_size: size - remaining,
                ts: raw.timestamp as i64,
            });
        }
        Ok(orders)
    }

    async fn submit_order(&self, request: &OrderRequest) -> CoreResult<OrderAck> {
        let meta = self.asset(&request.pair)?;

        let (price, tif) = match request.order_type {
            OrderType::Limit => {
                let price = request.price.ok_or_else(|| {
                    CoreError::Validation("limit order requires a price".into())
                })?;
                (price, request.time_in_force)
            }
            OrderType::Market => {
                // Emulated as a slippage-bounded IOC limit.
                let price = self.market_limit_price(&request.pair, request.side).await?;
                (price, TimeInForce::Ioc)
            }
        };

        let wire_order = WireOrder {
            a: meta.index,
            b: request.side == Side::Buy,
            p: self.format_price(meta, price),
            s: self.format_size(meta, request.size),
            r: request.reduce_only,
            t: WireOrderType {
                limit: WireTif {
                    tif: tif_label(tif).to_string(),
                },
            },
            c: Some(request.client_id.clone()),
        };
        let action = OrderAction::new(vec![wire_order]);
        let action_json = serde_json::to_value(&action)
            .map_err(|e| CoreError::Validation(format!("action encode failed: {}", e)))?;

        let response = self.signed_exchange(action_json, &action).await?;
        if response.status != "ok" {
            return Err(CoreError::Network(format!(
                "exchange returned status {}",
                response.status
            )));
        }

        let status = response
            .response
            .and_then(|body| body.data)
            .and_then(|data| data.statuses.into_iter().next())
            .ok_or_else(|| CoreError::Validation("empty exchange response".into()))?;

        match status {
            WireOrderStatus::Resting(resting) => Ok(OrderAck::Resting {
                venue_order_id: resting.oid,
            }),
            WireOrderStatus::Filled(filled) => Ok(OrderAck::Filled {
                venue_order_id: filled.oid,
                avg_price: parse_decimal(&filled.avg_px)?,
                size: parse_decimal(&filled.total_sz)?,
            }),
            WireOrderStatus::Error(reason) => {
                let lower = reason.to_lowercase();
                if lower.contains("margin") {
                    Err(CoreError::InsufficientMargin(reason))
                } else if lower.contains("balance") || lower.contains("funds") {
                    Err(CoreError::InsufficientFunds(reason))
                } else {
                    Ok(OrderAck::Rejected { reason })
                }
            }
            WireOrderStatus::Success(_) => Err(CoreError::Validation(
                "unexpected success status for order action".into(),
            )),
        }
    }

    async fn cancel_order(&self, pair: &TradingPair, venue_order_id: u64) -> CoreResult<()> {
        let meta = self.asset(pair)?;
        let action = CancelAction::new(vec![WireCancel {
            a: Some(meta.index),
            o: Some(venue_order_id),
        }]);
        let action_json = serde_json::to_value(&action)
            .map_err(|e| CoreError::Validation(format!("action encode failed: {}", e)))?;
        let response = self.signed_exchange(action_json, &action).await?;
        if response.status != "ok" {
            return Err(CoreError::OrderNotFound(format!(
                "cancel of {} failed: {}",
                venue_order_id, response.status
            )));
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, pair: Option<&TradingPair>) -> CoreResult<()> {
        // Null asset or order id means "all" and must encode as explicit nil.
        let asset = pair.map(|p| self.asset(p)).transpose()?.map(|m| m.index);
        let action = CancelAction::new(vec![WireCancel { a: asset, o: None }]);
        let action_json = serde_json::to_value(&action)
            .map_err(|e| CoreError::Validation(format!("action encode failed: {}", e)))?;
        let response = self.signed_exchange(action_json, &action).await?;
        if response.status != "ok" {
            return Err(CoreError::Network(format!(
                "cancel-all failed: {}",
                response.status
            )));
        }
        Ok(())
    }
}

fn parse_decimal(raw: &str) -> CoreResult<Decimal> {
    Decimal::from_str(raw)
        .map_err(|e| CoreError::Validation(format!("bad decimal '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn adapter() -> HyperliquidAdapter {
        let adapter = HyperliquidAdapter::new(HyperliquidConfig::new(true)).unwrap();
        adapter.assets.write().insert(
            "BTC".to_string(),
            AssetMeta {
                index: 0,
                sz_decimals: 5,
            },
        );
        adapter
    }

    #[test]
    fn test_price_formatting_respects_sz_decimals() {
        let adapter = adapter();
        let meta = adapter.asset(&TradingPair::new("BTC", "USDC")).unwrap();
        // 6 - 5 = 1 decimal place for BTC perps.
        assert_eq!(adapter.format_price(meta, dec!(50000.12345)), "50000.1");
        assert_eq!(adapter.format_size(meta, dec!(0.0000149)), "0.00001");
    }

    #[test]
    fn test_unknown_asset_is_validation_error() {
        let adapter = adapter();
        let err = adapter.asset(&TradingPair::new("DOGE", "USDC")).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[test]
    fn test_nonce_strictly_increasing() {
        let adapter = adapter();
        let mut last = 0u64;
        for _ in 0..100 {
            let nonce = adapter.next_nonce();
            assert!(nonce > last);
            last = nonce;
        }
    }
}
