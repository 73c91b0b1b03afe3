//! Error Model
//!
//! One error type for the trading core with a stable machine-readable code
//! per kind. The control plane maps kinds onto HTTP statuses; the adapter
//! decides retry behavior by kind.

use axum::http::StatusCode;
use std::fmt;

/// Errors surfaced by the trading core.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Transient transport failure. Retried by the adapter; surfaced only
    /// after the retry budget is exhausted.
    Network(String),
    /// Invalid signature or credentials. Fatal for the adapter.
    Auth(String),
    /// Venue rate limit. Queued and retried internally; callers see this only
    /// when the wait queue itself overflows.
    RateLimited(String),
    /// Malformed request: precision, size, missing field. Never retried.
    Validation(String),
    InsufficientFunds(String),
    InsufficientMargin(String),
    /// Pre-trade risk veto.
    RiskRejected(String),
    /// Cancel or query on an unknown order id.
    OrderNotFound(String),
    /// Reliable-topic publish deadline exceeded.
    Backpressure(String),
    /// Invariant violation (e.g. over-fill). State is clamped and a
    /// reconciliation pass is scheduled.
    Inconsistent(String),
    /// Runner aborted by the control plane. Expected, not a failure.
    Canceled,
}

impl CoreError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Network(_) => "network",
            CoreError::Auth(_) => "auth",
            CoreError::RateLimited(_) => "rate_limited",
            CoreError::Validation(_) => "validation",
            CoreError::InsufficientFunds(_) => "insufficient_funds",
            CoreError::InsufficientMargin(_) => "insufficient_margin",
            CoreError::RiskRejected(_) => "risk_rejected",
            CoreError::OrderNotFound(_) => "order_not_found",
            CoreError::Backpressure(_) => "backpressure",
            CoreError::Inconsistent(_) => "inconsistent",
            CoreError::Canceled => "canceled",
        }
    }

    /// Whether the adapter may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Network(_) | CoreError::RateLimited(_))
    }

    /// HTTP status for the control plane.
    pub fn status_code(&self) -> StatusCode {
        match self {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::Auth(_) => StatusCode::UNAUTHORIZED,
            CoreError::InsufficientFunds(_) | CoreError::InsufficientMargin(_) => {
                StatusCode::PAYMENT_REQUIRED
            }
            CoreError::OrderNotFound(_) => StatusCode::NOT_FOUND,
            CoreError::RiskRejected(_) => StatusCode::CONFLICT,
            CoreError::Inconsistent(_) => StatusCode::INTERNAL_SERVER_ERROR,
            CoreError::Backpressure(_) | CoreError::Network(_) | CoreError::RateLimited(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            CoreError::Canceled => StatusCode::OK,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Network(m) => write!(f, "network error: {}", m),
            CoreError::Auth(m) => write!(f, "authentication error: {}", m),
            CoreError::RateLimited(m) => write!(f, "rate limited: {}", m),
            CoreError::Validation(m) => write!(f, "validation error: {}", m),
            CoreError::InsufficientFunds(m) => write!(f, "insufficient funds: {}", m),
            CoreError::InsufficientMargin(m) => write!(f, "insufficient margin: {}", m),
            CoreError::RiskRejected(m) => write!(f, "risk rejected: {}", m),
            CoreError::OrderNotFound(m) => write!(f, "order not found: {}", m),
            CoreError::Backpressure(m) => write!(f, "backpressure: {}", m),
            CoreError::Inconsistent(m) => write!(f, "inconsistent state: {}", m),
            CoreError::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::error::Error for CoreError {}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            CoreError::Network(e.to_string())
        } else if e.status().map(|s| s.as_u16() == 429).unwrap_or(false) {
            CoreError::RateLimited(e.to_string())
        } else {
            CoreError::Network(e.to_string())
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
