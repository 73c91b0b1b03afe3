//! Hyperliquid HTTP Client
//!
//! JSON POST client for the `info` and `exchange` endpoints. Info queries are
//! retried on transient failures with backoff; signed `exchange` actions are
//! never retried blind - a lost response leaves the order PENDING and the
//! reconciliation pass recovers the truth.

use crate::error::{CoreError, CoreResult};
use crate::exchange::hyperliquid::messages::{
    ClearinghouseState, ExchangeResponse, PerpMeta, WireBook, WireOpenOrder, WireSignature,
};
use crate::exchange::{Backoff, RateLimiter};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const INFO_RETRY_BUDGET: u32 = 3;

pub struct HyperliquidHttpClient {
    client: reqwest::Client,
    base_url: String,
    rate_limiter: Arc<RateLimiter>,
}

impl HyperliquidHttpClient {
    pub fn new(base_url: impl Into<String>, rate_limiter: Arc<RateLimiter>) -> CoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CoreError::Network(format!("http client build failed: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            rate_limiter,
        })
    }

    /// POST an info query, retrying transient failures within the budget.
    pub async fn info<T: DeserializeOwned>(&self, body: serde_json::Value) -> CoreResult<T> {
        let mut backoff = Backoff::default();
        let mut last_error = CoreError::Network("info request not attempted".into());

        for attempt in 0..INFO_RETRY_BUDGET {
            self.rate_limiter.acquire().await;
            match self.post_once(&format!("{}/info", self.base_url), &body).await {
                Ok(value) => {
                    return serde_json::from_value(value).map_err(|e| {
                        CoreError::Validation(format!("unexpected info response: {}", e))
                    });
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(attempt, error = %e, ?delay, "info request failed; retrying");
                    tokio::time::sleep(delay).await;
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// POST a signed action envelope. Exactly one wire attempt: retrying a
    /// signed order could double-submit.
    pub async fn exchange(
        &self,
        action: serde_json::Value,
        signature: WireSignature,
        nonce: u64,
    ) -> CoreResult<ExchangeResponse> {
        self.rate_limiter.acquire().await;
        let envelope = json!({
            "action": action,
            "nonce": nonce,
            "signature": signature,
        });
        let value = self
            .post_once(&format!("{}/exchange", self.base_url), &envelope)
            .await?;
        serde_json::from_value(value)
            .map_err(|e| CoreError::Validation(format!("unexpected exchange response: {}", e)))
    }

    async fn post_once(
        &self,
        url: &str,
        body: &serde_json::Value,
    ) -> CoreResult<serde_json::Value> {
        debug!(url, "POST");
        let response = self.client.post(url).json(body).send().await?;
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| CoreError::Network(format!("body read failed: {}", e)));
        }

        let text = response.text().await.unwrap_or_default();
        Err(map_status(status, text))
    }

    // === Typed info queries ===

    pub async fn meta(&self) -> CoreResult<PerpMeta> {
        self.info(json!({"type": "meta"})).await
    }

    pub async fn all_mids(&self) -> CoreResult<HashMap<String, String>> {
        self.info(json!({"type": "allMids"})).await
    }

    pub async fn l2_book(&self, coin: &str) -> CoreResult<WireBook> {
        self.info(json!({"type": "l2Book", "coin": coin})).await
    }

    pub async fn clearinghouse_state(&self, user: &str) -> CoreResult<ClearinghouseState> {
        self.info(json!({"type": "clearinghouseState", "user": user}))
            .await
    }

    pub async fn open_orders(&self, user: &str) -> CoreResult<Vec<WireOpenOrder>> {
        self.info(json!({"type": "openOrders", "user": user})).await
    }
}

fn map_status(status: StatusCode, body: String) -> CoreError {
    match status.as_u16() {
        401 | 403 => CoreError::Auth(body),
        429 => CoreError::RateLimited(body),
        code if (400..500).contains(&code) => CoreError::Validation(body),
        _ => CoreError::Network(format!("status {}: {}", status, body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            map_status(StatusCode::UNAUTHORIZED, String::new()),
            CoreError::Auth(_)
        ));
        assert!(matches!(
            map_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            CoreError::RateLimited(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_REQUEST, String::new()),
            CoreError::Validation(_)
        ));
        assert!(matches!(
            map_status(StatusCode::BAD_GATEWAY, String::new()),
            CoreError::Network(_)
        ));
    }
}
