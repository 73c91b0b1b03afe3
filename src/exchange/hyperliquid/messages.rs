//! Hyperliquid Wire Messages
//!
//! Serde DTOs for the info/exchange HTTP endpoints and the WebSocket stream.
//! Numeric fields arrive as strings and stay strings here; the data engine
//! owns Decimal conversion. Action structs preserve field order - the
//! MessagePack hash that gets signed depends on it.

use serde::{Deserialize, Serialize};

// === Info endpoint ===

/// One perp asset entry from the `meta` response.
#[derive(Debug, Clone, Deserialize)]
pub struct AssetInfo {
    pub name: String,
    #[serde(rename = "szDecimals")]
    pub sz_decimals: u32,
    #[serde(rename = "maxLeverage", default)]
    pub max_leverage: Option<u32>,
    #[serde(rename = "isDelisted", default)]
    pub is_delisted: Option<bool>,
}

/// Perp metadata: the asset universe, indexed by position.
#[derive(Debug, Clone, Deserialize)]
pub struct PerpMeta {
    pub universe: Vec<AssetInfo>,
}

/// One L2 level: price, size, order count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireLevel {
    pub px: String,
    pub sz: String,
    pub n: u32,
}

/// L2 book response / stream payload. `levels[0]` is bids, `levels[1]` asks.
#[derive(Debug, Clone, Deserialize)]
pub struct WireBook {
    pub coin: String,
    pub time: u64,
    pub levels: Vec<Vec<WireLevel>>,
    /// Snapshot-or-delta discriminator; absent means snapshot.
    #[serde(rename = "isSnapshot", default)]
    pub is_snapshot: Option<bool>,
}

/// Position details inside `clearinghouseState`.
#[derive(Debug, Clone, Deserialize)]
pub struct WirePositionInner {
    pub coin: String,
    /// Signed size; positive long.
    pub szi: String,
    #[serde(rename = "entryPx", default)]
    pub entry_px: Option<String>,
    #[serde(default)]
    pub leverage: Option<WireLeverage>,
    #[serde(rename = "marginUsed", default)]
    pub margin_used: Option<String>,
    #[serde(rename = "unrealizedPnl", default)]
    pub unrealized_pnl: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireLeverage {
    pub value: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireAssetPosition {
    pub position: WirePositionInner,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireMarginSummary {
    #[serde(rename = "accountValue")]
    pub account_value: String,
}

/// `clearinghouseState` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ClearinghouseState {
    #[serde(rename = "assetPositions", default)]
    pub asset_positions: Vec<WireAssetPosition>,
    #[serde(rename = "marginSummary")]
    pub margin_summary: WireMarginSummary,
    #[serde(default)]
    pub withdrawable: Option<String>,
}

/// One open order from the `openOrders` response.
#[derive(Debug, Clone, Deserialize)]
pub struct WireOpenOrder {
    pub coin: String,
    pub oid: u64,
    /// "B" for bid, "A" for ask.
    pub side: String,
    #[serde(rename = "limitPx")]
    pub limit_px: String,
    pub sz: String,
    #[serde(rename = "origSz", default)]
    pub orig_sz: Option<String>,
    pub timestamp: u64,
    #[serde(default)]
    pub cloid: Option<String>,
}

// === Exchange endpoint (signed actions) ===

/// Wire time-in-force labels.
pub fn tif_label(tif: crate::types::TimeInForce) -> &'static str {
    match tif {
        crate::types::TimeInForce::Gtc => "Gtc",
        crate::types::TimeInForce::Ioc => "Ioc",
        crate::types::TimeInForce::Alo => "Alo",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WireTif {
    pub tif: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireOrderType {
    pub limit: WireTif,
}

/// One order inside an order action. Single-letter keys and field order are
/// part of the signed payload.
#[derive(Debug, Clone, Serialize)]
pub struct WireOrder {
    /// Asset index in the meta universe.
    pub a: u64,
    /// Is buy.
    pub b: bool,
    /// Price.
    pub p: String,
    /// Size.
    pub s: String,
    /// Reduce only.
    pub r: bool,
    /// Order type.
    pub t: WireOrderType,
    /// Client order id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub c: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub orders: Vec<WireOrder>,
    pub grouping: String,
}

impl OrderAction {
    pub fn new(orders: Vec<WireOrder>) -> Self {
        Self {
            kind: "order".to_string(),
            orders,
            grouping: "na".to_string(),
        }
    }
}

/// One cancel target. `a`/`o` are nullable and a null means "all": the codec
/// must emit an explicit nil, so these fields are never skipped.
#[derive(Debug, Clone, Serialize)]
pub struct WireCancel {
    pub a: Option<u64>,
    pub o: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancelAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub cancels: Vec<WireCancel>,
}

impl CancelAction {
    pub fn new(cancels: Vec<WireCancel>) -> Self {
        Self {
            kind: "cancel".to_string(),
            cancels,
        }
    }
}

/// Signature component of a signed action envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireSignature {
    pub r: String,
    pub s: String,
    pub v: u64,
}

// === Exchange endpoint responses ===

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponse {
    pub status: String,
    #[serde(default)]
    pub response: Option<ExchangeResponseBody>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponseBody {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Option<ExchangeResponseData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeResponseData {
    #[serde(default)]
    pub statuses: Vec<WireOrderStatus>,
}

/// Immediate per-order acknowledgment inside an exchange response.
#[derive(Debug, Clone, Deserialize)]
pub enum WireOrderStatus {
    #[serde(rename = "resting")]
    Resting(WireResting),
    #[serde(rename = "filled")]
    Filled(WireFilled),
    #[serde(rename = "error")]
    Error(String),
    #[serde(rename = "success")]
    Success(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireResting {
    pub oid: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WireFilled {
    pub oid: u64,
    #[serde(rename = "totalSz")]
    pub total_sz: String,
    #[serde(rename = "avgPx")]
    pub avg_px: String,
}

// === WebSocket ===

/// Outbound subscription envelope.
#[derive(Debug, Clone, Serialize)]
pub struct WsRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<serde_json::Value>,
}

impl WsRequest {
    pub fn subscribe(subscription: serde_json::Value) -> Self {
        Self {
            method: "subscribe".to_string(),
            subscription: Some(subscription),
        }
    }

    pub fn ping() -> Self {
        Self {
            method: "ping".to_string(),
            subscription: None,
        }
    }
}

/// Inbound message envelope; `data` shape depends on the channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WsMessage {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One trade on the `trades` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WsTrade {
    pub coin: String,
    /// "B" buyer-aggressor, "A" seller-aggressor.
    pub side: String,
    pub px: String,
    pub sz: String,
    pub time: u64,
    pub tid: u64,
}

/// Order plus status on the `orderUpdates` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WsOrderUpdate {
    pub order: WsOrderDetails,
    pub status: String,
    #[serde(rename = "statusTimestamp")]
    pub status_timestamp: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsOrderDetails {
    pub coin: String,
    pub oid: u64,
    pub side: String,
    #[serde(rename = "limitPx")]
    pub limit_px: String,
    pub sz: String,
    #[serde(rename = "origSz", default)]
    pub orig_sz: Option<String>,
    #[serde(default)]
    pub cloid: Option<String>,
}

/// Payload on the `userFills` channel.
#[derive(Debug, Clone, Deserialize)]
pub struct WsUserFills {
    #[serde(rename = "isSnapshot", default)]
    pub is_snapshot: Option<bool>,
    #[serde(default)]
    pub fills: Vec<WsFill>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WsFill {
    pub coin: String,
    pub px: String,
    pub sz: String,
    pub side: String,
    pub time: u64,
    pub oid: u64,
    pub tid: u64,
    #[serde(default)]
    pub fee: Option<String>,
    #[serde(default)]
    pub cloid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TimeInForce;

    #[test]
    fn test_order_action_json_shape() {
        let action = OrderAction::new(vec![WireOrder {
            a: 0,
            b: true,
            p: "50000".into(),
            s: "0.001".into(),
            r: false,
            t: WireOrderType {
                limit: WireTif {
                    tif: tif_label(TimeInForce::Gtc).to_string(),
                },
            },
            c: None,
        }]);

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "order");
        assert_eq!(json["grouping"], "na");
        assert_eq!(json["orders"][0]["a"], 0);
        assert_eq!(json["orders"][0]["b"], true);
        assert_eq!(json["orders"][0]["t"]["limit"]["tif"], "Gtc");
        // Absent cloid is omitted entirely.
        assert!(json["orders"][0].get("c").is_none());
    }

    #[test]
    fn test_cancel_all_encodes_explicit_nulls() {
        let action = CancelAction::new(vec![WireCancel { a: None, o: None }]);
        let json = serde_json::to_string(&action).unwrap();
        assert!(json.contains("\"a\":null"));
        assert!(json.contains("\"o\":null"));

        // MessagePack must carry explicit nil markers, not omit the keys.
        let packed = rmp_serde::to_vec_named(&action).unwrap();
        let decoded: serde_json::Value = rmp_serde::from_slice(&packed).unwrap();
        assert_eq!(decoded["cancels"][0]["a"], serde_json::Value::Null);
        assert_eq!(decoded["cancels"][0]["o"], serde_json::Value::Null);
    }

    #[test]
    fn test_parse_exchange_response() {
        let raw = r#"{
            "status": "ok",
            "response": {
                "type": "order",
                "data": {
                    "statuses": [{"resting": {"oid": 77}}]
                }
            }
        }"#;
        let parsed: ExchangeResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.status, "ok");
        let statuses = parsed.response.unwrap().data.unwrap().statuses;
        assert!(matches!(statuses[0], WireOrderStatus::Resting(WireResting { oid: 77 })));
    }

    #[test]
    fn test_parse_ws_book() {
        let raw = r#"{
            "channel": "l2Book",
            "data": {
                "coin": "BTC",
                "time": 1700000000000,
                "levels": [
                    [{"px": "50000", "sz": "1.5", "n": 3}],
                    [{"px": "50010", "sz": "2.0", "n": 2}]
                ]
            }
        }"#;
        let envelope: WsMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.channel, "l2Book");
        let book: WireBook = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(book.coin, "BTC");
        assert_eq!(book.levels[0][0].px, "50000");
        assert_eq!(book.is_snapshot, None);
    }
}
