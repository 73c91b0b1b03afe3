//! Performance Report
//!
//! Post-run analytics over the equity curve and realized trade ledger.
//! Equity stays Decimal end-to-end; only dimensionless ratios (Sharpe,
//! Sortino, drawdown, win rate) drop to f64.

use crate::types::{Fill, TimestampMs};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

const MS_PER_YEAR: f64 = 365.25 * 24.0 * 3600.0 * 1000.0;

/// One observation on the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub ts: TimestampMs,
    pub equity: Decimal,
}

/// Backtest result summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub total_return_pct: f64,
    pub cagr_pct: f64,
    pub sharpe: f64,
    pub sortino: f64,
    pub max_drawdown_pct: f64,
    /// Fraction of closing trades with positive realized PnL.
    pub win_rate: f64,
    /// Gross profit over gross loss; equals gross profit when no trade lost.
    pub profit_factor: f64,
    pub trade_count: usize,
    pub total_fees: Decimal,
    pub fills: Vec<Fill>,
    pub equity_curve: Vec<EquityPoint>,
}

/// Build the report from the raw run outputs.
///
/// `realized_deltas` carries the realized-PnL change of every closing fill,
/// in fill order; opens contribute nothing and are excluded by the caller.
pub fn compute(
    initial_capital: Decimal,
    equity_curve: Vec<EquityPoint>,
    fills: Vec<Fill>,
    realized_deltas: &[Decimal],
    bar_interval_ms: i64,
) -> PerformanceReport {
    let final_equity = equity_curve
        .last()
        .map(|p| p.equity)
        .unwrap_or(initial_capital);

    let initial_f = initial_capital.to_f64().unwrap_or(0.0);
    let final_f = final_equity.to_f64().unwrap_or(0.0);
    let total_return = if initial_f > 0.0 {
        final_f / initial_f - 1.0
    } else {
        0.0
    };

    let periods_per_year = if bar_interval_ms > 0 {
        MS_PER_YEAR / bar_interval_ms as f64
    } else {
        0.0
    };

    let cagr = if initial_f > 0.0 && final_f > 0.0 && equity_curve.len() > 1 {
        let years = equity_curve.len() as f64 / periods_per_year.max(f64::EPSILON);
        if years > 0.0 {
            (final_f / initial_f).powf(1.0 / years) - 1.0
        } else {
            0.0
        }
    } else {
        0.0
    };

    let returns = per_period_returns(&equity_curve);
    let sharpe = annualized_ratio(&returns, periods_per_year, false);
    let sortino = annualized_ratio(&returns, periods_per_year, true);
    let max_drawdown = max_drawdown_pct(&equity_curve);

    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut gross_profit = 0.0f64;
    let mut gross_loss = 0.0f64;
    for delta in realized_deltas {
        let value = delta.to_f64().unwrap_or(0.0);
        if value > 0.0 {
            wins += 1;
            gross_profit += value;
        } else if value < 0.0 {
            losses += 1;
            gross_loss += -value;
        }
    }
    let closed = wins + losses;
    let win_rate = if closed > 0 {
        wins as f64 / closed as f64
    } else {
        0.0
    };
    let profit_factor = if gross_loss > 0.0 {
        gross_profit / gross_loss
    } else {
        gross_profit
    };

    let total_fees: Decimal = fills.iter().map(|f| f.fee).sum();

    PerformanceReport {
        initial_capital,
        final_equity,
        total_return_pct: total_return * 100.0,
        cagr_pct: cagr * 100.0,
        sharpe,
        sortino,
        max_drawdown_pct: max_drawdown * 100.0,
        win_rate,
        profit_factor,
        trade_count: fills.len(),
        total_fees,
        fills,
        equity_curve,
    }
}

impl PerformanceReport {
    /// Stable digest of the trade list and equity curve. Two runs of the
    /// same configuration over the same data produce the same fingerprint;
    /// any divergence in fills or equity changes it.
    pub fn fingerprint(&self) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        for fill in &self.fills {
            hasher.update(fill.ts.to_be_bytes());
            hasher.update(fill.client_id.as_bytes());
            hasher.update(fill.side.to_string().as_bytes());
            hasher.update(fill.price.to_string().as_bytes());
            hasher.update(fill.size.to_string().as_bytes());
            hasher.update(fill.fee.to_string().as_bytes());
        }
        for point in &self.equity_curve {
            hasher.update(point.ts.to_be_bytes());
            hasher.update(point.equity.to_string().as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn per_period_returns(curve: &[EquityPoint]) -> Vec<f64> {
    curve
        .windows(2)
        .filter_map(|pair| {
            let previous = pair[0].equity.to_f64()?;
            let current = pair[1].equity.to_f64()?;
            if previous.abs() > f64::EPSILON {
                Some(current / previous - 1.0)
            } else {
                None
            }
        })
        .collect()
}

fn annualized_ratio(returns: &[f64], periods_per_year: f64, downside_only: bool) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;

    let deviations: Vec<f64> = if downside_only {
        returns
            .iter()
            .map(|r| if *r < 0.0 { *r } else { 0.0 })
            .collect()
    } else {
        returns.iter().map(|r| r - mean).collect()
    };
    let variance = deviations.iter().map(|d| d * d).sum::<f64>() / n;
    let deviation = variance.sqrt();
    if deviation <= f64::EPSILON {
        return 0.0;
    }
    mean / deviation * periods_per_year.max(0.0).sqrt()
}

fn max_drawdown_pct(curve: &[EquityPoint]) -> f64 {
    let mut peak = f64::MIN;
    let mut max_drawdown = 0.0f64;
    for point in curve {
        let equity = point.equity.to_f64().unwrap_or(0.0);
        if equity > peak {
            peak = equity;
        }
        if peak > 0.0 {
            let drawdown = (peak - equity) / peak;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }
    }
    max_drawdown
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn curve(values: &[i64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| EquityPoint {
                ts: i as i64 * 60_000,
                equity: Decimal::from(*v),
            })
            .collect()
    }

    #[test]
    fn test_total_return_and_drawdown() {
        let report = compute(
            dec!(1000),
            curve(&[1000, 1100, 990, 1210]),
            Vec::new(),
            &[],
            60_000,
        );
        assert!((report.total_return_pct - 21.0).abs() < 1e-9);
        // Peak 1100 -> trough 990: 10% drawdown.
        assert!((report.max_drawdown_pct - 10.0).abs() < 1e-9);
        assert_eq!(report.final_equity, dec!(1210));
    }

    #[test]
    fn test_win_rate_and_profit_factor() {
        let deltas = [dec!(10), dec!(-5), dec!(20), dec!(-5), dec!(0)];
        let report = compute(dec!(1000), curve(&[1000, 1020]), Vec::new(), &deltas, 60_000);
        assert!((report.win_rate - 0.5).abs() < 1e-9);
        assert!((report.profit_factor - 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let base = compute(dec!(1000), curve(&[1000, 1010]), Vec::new(), &[], 60_000);
        let same = compute(dec!(1000), curve(&[1000, 1010]), Vec::new(), &[], 60_000);
        let different = compute(dec!(1000), curve(&[1000, 1011]), Vec::new(), &[], 60_000);

        assert_eq!(base.fingerprint(), same.fingerprint());
        assert_ne!(base.fingerprint(), different.fingerprint());
    }

    #[test]
    fn test_sharpe_zero_for_flat_curve() {
        let report = compute(
            dec!(1000),
            curve(&[1000, 1000, 1000, 1000]),
            Vec::new(),
            &[],
            60_000,
        );
        assert_eq!(report.sharpe, 0.0);
        assert_eq!(report.sortino, 0.0);
    }

    #[test]
    fn test_monotone_rise_has_positive_sharpe_and_no_drawdown() {
        let report = compute(
            dec!(1000),
            curve(&[1000, 1010, 1021, 1030, 1042]),
            Vec::new(),
            &[],
            60_000,
        );
        assert!(report.sharpe > 0.0);
        assert_eq!(report.max_drawdown_pct, 0.0);
        // No negative periods: downside deviation is zero, sortino defined 0.
        assert_eq!(report.sortino, 0.0);
    }
}
