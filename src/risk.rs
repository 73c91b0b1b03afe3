//! Risk Engine
//!
//! Pre-trade guardrails between strategies and the venue. Every intent passes
//! through `check` before a signed request can exist; a failing check is a
//! `RiskRejected` and never reaches the wire.

use crate::engine::positions::Position;
use crate::types::{OrderRequest, Side};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// Risk limits, loaded from config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Maximum absolute net position size per symbol.
    pub max_position_per_symbol: Decimal,
    /// Maximum size of a single order.
    pub max_order_size: Decimal,
    /// Stop-loss threshold as a fraction of entry (e.g. 0.05 = 5%).
    /// Breaching it blocks position-increasing orders for that symbol.
    pub stop_loss_pct: Option<Decimal>,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_per_symbol: Decimal::from(1_000_000),
            max_order_size: Decimal::from(1_000_000),
            stop_loss_pct: None,
        }
    }
}

/// Why an intent was blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BlockReason {
    KillSwitchEngaged,
    MaxPositionExceeded {
        symbol: String,
        resulting: Decimal,
        limit: Decimal,
    },
    OrderSizeExceeded {
        size: Decimal,
        limit: Decimal,
    },
    StopLossBreached {
        symbol: String,
        loss_pct: Decimal,
    },
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockReason::KillSwitchEngaged => write!(f, "kill switch engaged"),
            BlockReason::MaxPositionExceeded {
                symbol,
                resulting,
                limit,
            } => write!(
                f,
                "max position exceeded for {}: {} > {}",
                symbol, resulting, limit
            ),
            BlockReason::OrderSizeExceeded { size, limit } => {
                write!(f, "order size {} exceeds cap {}", size, limit)
            }
            BlockReason::StopLossBreached { symbol, loss_pct } => {
                write!(f, "stop-loss breached on {} ({}%)", symbol, loss_pct)
            }
        }
    }
}

/// Result of a pre-trade check.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskCheckResult {
    Allowed,
    Blocked(BlockReason),
}

impl RiskCheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RiskCheckResult::Allowed)
    }
}

/// Running risk counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskStats {
    pub checks: u64,
    pub blocked: u64,
    pub kill_switch_blocks: u64,
}

/// Pre-trade risk engine shared by every execution path.
pub struct RiskEngine {
    limits: RiskLimits,
    kill_switch: AtomicBool,
    stats: RwLock<RiskStats>,
}

impl RiskEngine {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            kill_switch: AtomicBool::new(false),
            stats: RwLock::new(RiskStats::default()),
        }
    }

    /// Engage the kill switch: all new submissions are vetoed until cleared.
    pub fn engage_kill_switch(&self) {
        warn!("kill switch engaged; new submissions disabled");
        self.kill_switch.store(true, Ordering::SeqCst);
    }

    pub fn clear_kill_switch(&self) {
        self.kill_switch.store(false, Ordering::SeqCst);
    }

    pub fn kill_switch_engaged(&self) -> bool {
        self.kill_switch.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> RiskStats {
        self.stats.read().clone()
    }

    /// Check one intent against the current position and mark price.
    pub fn check(
        &self,
        request: &OrderRequest,
        position: Option<&Position>,
        mark: Option<Decimal>,
    ) -> RiskCheckResult {
        self.stats.write().checks += 1;

        if self.kill_switch_engaged() {
            let mut stats = self.stats.write();
            stats.blocked += 1;
            stats.kill_switch_blocks += 1;
            return RiskCheckResult::Blocked(BlockReason::KillSwitchEngaged);
        }

        if request.size > self.limits.max_order_size {
            self.stats.write().blocked += 1;
            return RiskCheckResult::Blocked(BlockReason::OrderSizeExceeded {
                size: request.size,
                limit: self.limits.max_order_size,
            });
        }

        let current = position.map(|p| p.size).unwrap_or(Decimal::ZERO);
        let resulting = current + request.side.sign() * request.size;

        // Reduce-only intents shrink exposure and skip the position cap.
        let reduces = resulting.abs() < current.abs() || request.reduce_only;
        if !reduces && resulting.abs() > self.limits.max_position_per_symbol {
            self.stats.write().blocked += 1;
            return RiskCheckResult::Blocked(BlockReason::MaxPositionExceeded {
                symbol: request.pair.to_string(),
                resulting,
                limit: self.limits.max_position_per_symbol,
            });
        }

        if let (Some(stop_loss), Some(position), Some(mark)) =
            (self.limits.stop_loss_pct, position, mark)
        {
            if !position.size.is_zero() && !position.entry_price.is_zero() {
                let loss = -position.unrealized_pnl(mark);
                let exposure = position.entry_price * position.size.abs();
                if loss > Decimal::ZERO && !exposure.is_zero() {
                    let loss_pct = loss / exposure;
                    let increases = (request.side == Side::Buy) == position.is_long();
                    if loss_pct >= stop_loss && increases && !request.reduce_only {
                        self.stats.write().blocked += 1;
                        return RiskCheckResult::Blocked(BlockReason::StopLossBreached {
                            symbol: request.pair.to_string(),
                            loss_pct: loss_pct * Decimal::ONE_HUNDRED,
                        });
                    }
                }
            }
        }

        RiskCheckResult::Allowed
    }
}
