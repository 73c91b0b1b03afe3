//! Vectorized Backtest Path
//!
//! Fast path for the dual moving-average strategy: indicator columns are
//! computed over pre-aligned arrays (in parallel), then one tight sequential
//! pass applies signals, fills, and equity. Bypasses the event bus and cache
//! entirely; the scalar engine remains the semantic reference and parity is
//! asserted by test - divergence is a correctness bug.

use crate::backtest::report::{self, EquityPoint, PerformanceReport};
use crate::types::{Bar, Fill, Side, TradingPair};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Configuration of the vectorized dual-MA run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorizedDualMaConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    pub order_size: Decimal,
    pub initial_capital: Decimal,
    pub fee_rate: Decimal,
    /// Proportional slippage against the fill price.
    pub slippage: Decimal,
    pub bar_interval_ms: i64,
}

/// SMA column: `output[i]` is the average of the `period` closes ending at
/// `i`, `None` while warming. Exact prefix-sum arithmetic matches the
/// incremental indicator bit-for-bit.
pub fn sma_column(closes: &[Decimal], period: usize) -> Vec<Option<Decimal>> {
    let period = period.max(1);
    let mut prefix = Vec::with_capacity(closes.len() + 1);
    let mut running = Decimal::ZERO;
    prefix.push(running);
    for close in closes {
        running += *close;
        prefix.push(running);
    }

    let divisor = Decimal::from(period as u64);
    (0..closes.len())
        .map(|i| {
            if i + 1 >= period {
                Some((prefix[i + 1] - prefix[i + 1 - period]) / divisor)
            } else {
                None
            }
        })
        .collect()
}

/// Run the dual-MA strategy over a single symbol's bars.
///
/// Signal semantics mirror the scalar path exactly: a crossover on bar `i`
/// queues a market order that fills at bar `i+1`'s open plus slippage; the
/// first `slow_period` bars are warm-up and emit no orders.
pub fn run_dual_ma(
    pair: &TradingPair,
    bars: &[Bar],
    config: &VectorizedDualMaConfig,
) -> PerformanceReport {
    let closes: Vec<Decimal> = bars.iter().map(|b| b.close).collect();

    let (fast, slow) = rayon::join(
        || sma_column(&closes, config.fast_period),
        || sma_column(&closes, config.slow_period),
    );

    // Signed size to trade, indexed by the bar whose open executes it.
    let mut pending: Option<Decimal> = None;

    let mut position = Decimal::ZERO;
    let mut entry_price = Decimal::ZERO;
    let mut realized = Decimal::ZERO;
    let mut fees = Decimal::ZERO;
    let mut previous_diff: Option<Decimal> = None;

    let mut fills: Vec<Fill> = Vec::new();
    let mut realized_deltas: Vec<Decimal> = Vec::new();
    let mut equity_curve: Vec<EquityPoint> = Vec::with_capacity(bars.len());
    let mut next_fill_id = 1u64;

    for (i, bar) in bars.iter().enumerate() {
        // Execute the order queued on the previous bar at this open.
        if let Some(delta) = pending.take() {
            let side = if delta > Decimal::ZERO {
                Side::Buy
            } else {
                Side::Sell
            };
            let slip = bar.open * config.slippage;
            let price = match side {
                Side::Buy => bar.open + slip,
                Side::Sell => bar.open - slip,
            };
            let size = delta.abs();
            let fee = price * size * config.fee_rate;

            let realized_delta =
                apply_netted_fill(&mut position, &mut entry_price, side, size, price);
            realized += realized_delta;
            if !realized_delta.is_zero() {
                realized_deltas.push(realized_delta);
            }
            fees += fee;

            fills.push(Fill {
                fill_id: next_fill_id,
                client_id: format!("bt-{}", next_fill_id),
                venue_order_id: next_fill_id,
                pair: pair.clone(),
                side,
                size,
                price,
                fee,
                ts: bar.ts,
            });
            next_fill_id += 1;
        }

        // Signal from this bar's indicator values.
        if let (Some(fast_value), Some(slow_value)) = (fast[i], slow[i]) {
            let diff = fast_value - slow_value;
            let previous = previous_diff.replace(diff);
            // Warm-up: the first `slow_period` bars never trade.
            if i >= config.slow_period {
                if let Some(previous) = previous {
                    let target = if previous <= Decimal::ZERO && diff > Decimal::ZERO {
                        Some(config.order_size)
                    } else if previous >= Decimal::ZERO && diff < Decimal::ZERO {
                        Some(-config.order_size)
                    } else {
                        None
                    };
                    if let Some(target) = target {
                        let delta = target - position - pending.unwrap_or(Decimal::ZERO);
                        if !delta.is_zero() {
                            pending = Some(delta);
                        }
                    }
                }
            }
        }

        let unrealized = if position.is_zero() {
            Decimal::ZERO
        } else {
            (bar.close - entry_price) * position
        };
        equity_curve.push(EquityPoint {
            ts: bar.ts,
            equity: config.initial_capital + realized - fees + unrealized,
        });
    }

    report::compute(
        config.initial_capital,
        equity_curve,
        fills,
        &realized_deltas,
        config.bar_interval_ms,
    )
}

/// Netted-position fill arithmetic, identical to the position tracker's:
/// same-side adds re-weight the entry, opposite-side fills realize on the
/// closing portion and re-open at the fill price past zero. Returns the
/// realized-PnL delta.
fn apply_netted_fill(
    position: &mut Decimal,
    entry_price: &mut Decimal,
    side: Side,
    size: Decimal,
    price: Decimal,
) -> Decimal {
    let signed = side.sign() * size;
    let old = *position;

    if old.is_zero() || old.is_sign_positive() == signed.is_sign_positive() {
        let old_abs = old.abs();
        let new_abs = old_abs + size;
        if !new_abs.is_zero() {
            *entry_price = (*entry_price * old_abs + price * size) / new_abs;
        }
        *position = old + signed;
        Decimal::ZERO
    } else {
        let closing = size.min(old.abs());
        let direction = if old.is_sign_positive() {
            Decimal::ONE
        } else {
            -Decimal::ONE
        };
        let realized = (price - *entry_price) * closing * direction;
        *position = old + signed;

        let opened = size - closing;
        if opened > Decimal::ZERO {
            *entry_price = price;
        } else if position.is_zero() {
            *entry_price = Decimal::ZERO;
        }
        realized
    }
}
