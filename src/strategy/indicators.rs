//! Technical Indicators
//!
//! Incremental indicator streams over bar closes. Every indicator emits
//! `None` until warm - absence is explicit, never a zero stand-in. All
//! arithmetic stays in Decimal so backtest results are bit-reproducible.

use rust_decimal::{Decimal, MathematicalOps};
use std::collections::VecDeque;

/// Simple moving average over a fixed window.
#[derive(Debug, Clone)]
pub struct Sma {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl Sma {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::with_capacity(period.max(1) + 1),
            sum: Decimal::ZERO,
        }
    }

    pub fn period(&self) -> usize {
        self.period
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
        self.value()
    }

    pub fn value(&self) -> Option<Decimal> {
        if self.window.len() == self.period {
            Some(self.sum / Decimal::from(self.period as u64))
        } else {
            None
        }
    }
}

/// Exponential moving average, seeded with the SMA of the first period.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: Decimal,
    seed: Sma,
    value: Option<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            multiplier: Decimal::TWO / Decimal::from(period as u64 + 1),
            seed: Sma::new(period),
            value: None,
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        match self.value {
            None => {
                if let Some(seeded) = self.seed.update(value) {
                    self.value = Some(seeded);
                }
            }
            Some(previous) => {
                self.value = Some((value - previous) * self.multiplier + previous);
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<Decimal> {
        self.value
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

/// Relative strength index with Wilder smoothing.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    previous: Option<Decimal>,
    avg_gain: Option<Decimal>,
    avg_loss: Option<Decimal>,
    samples: usize,
    gain_sum: Decimal,
    loss_sum: Decimal,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            previous: None,
            avg_gain: None,
            avg_loss: None,
            samples: 0,
            gain_sum: Decimal::ZERO,
            loss_sum: Decimal::ZERO,
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<Decimal> {
        let previous = match self.previous.replace(value) {
            Some(previous) => previous,
            None => return None,
        };
        let change = value - previous;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        let period = Decimal::from(self.period as u64);

        match (self.avg_gain, self.avg_loss) {
            (Some(avg_gain), Some(avg_loss)) => {
                self.avg_gain = Some((avg_gain * (period - Decimal::ONE) + gain) / period);
                self.avg_loss = Some((avg_loss * (period - Decimal::ONE) + loss) / period);
            }
            _ => {
                self.gain_sum += gain;
                self.loss_sum += loss;
                self.samples += 1;
                if self.samples == self.period {
                    self.avg_gain = Some(self.gain_sum / period);
                    self.avg_loss = Some(self.loss_sum / period);
                }
            }
        }
        self.value()
    }

    pub fn value(&self) -> Option<Decimal> {
        let (avg_gain, avg_loss) = (self.avg_gain?, self.avg_loss?);
        if avg_loss.is_zero() {
            return Some(Decimal::ONE_HUNDRED);
        }
        let rs = avg_gain / avg_loss;
        Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
    }
}

/// MACD output triple.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// Moving average convergence/divergence (fast EMA - slow EMA, with a
/// signal EMA over the difference).
#[derive(Debug, Clone)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        Self {
            fast: Ema::new(fast),
            slow: Ema::new(slow),
            signal: Ema::new(signal),
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<MacdOutput> {
        let fast = self.fast.update(value);
        let slow = self.slow.update(value);
        let macd = fast? - slow?;
        let signal = self.signal.update(macd)?;
        Some(MacdOutput {
            macd,
            signal,
            histogram: macd - signal,
        })
    }
}

/// Bollinger band output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerOutput {
    pub upper: Decimal,
    pub middle: Decimal,
    pub lower: Decimal,
}

/// Bollinger bands: SMA middle band with k standard deviations either side.
#[derive(Debug, Clone)]
pub struct Bollinger {
    period: usize,
    k: Decimal,
    window: VecDeque<Decimal>,
}

impl Bollinger {
    pub fn new(period: usize, k: Decimal) -> Self {
        Self {
            period: period.max(1),
            k,
            window: VecDeque::with_capacity(period.max(1) + 1),
        }
    }

    pub fn update(&mut self, value: Decimal) -> Option<BollingerOutput> {
        self.window.push_back(value);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period {
            return None;
        }

        let n = Decimal::from(self.period as u64);
        let mean = self.window.iter().copied().sum::<Decimal>() / n;
        let variance = self
            .window
            .iter()
            .map(|v| {
                let d = *v - mean;
                d * d
            })
            .sum::<Decimal>()
            / n;
        let stddev = variance.sqrt()?;

        Some(BollingerOutput {
            upper: mean + self.k * stddev,
            middle: mean,
            lower: mean - self.k * stddev,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sma_warmup_and_value() {
        let mut sma = Sma::new(3);
        assert_eq!(sma.update(dec!(1)), None);
        assert_eq!(sma.update(dec!(2)), None);
        assert_eq!(sma.update(dec!(3)), Some(dec!(2)));
        assert_eq!(sma.update(dec!(4)), Some(dec!(3)));
    }

    #[test]
    fn test_ema_seeds_with_sma() {
        let mut ema = Ema::new(3);
        assert_eq!(ema.update(dec!(1)), None);
        assert_eq!(ema.update(dec!(2)), None);
        assert_eq!(ema.update(dec!(3)), Some(dec!(2)));
        // k = 2/4 = 0.5: (5 - 2) * 0.5 + 2 = 3.5
        assert_eq!(ema.update(dec!(5)), Some(dec!(3.5)));
    }

    #[test]
    fn test_rsi_bounds_and_direction() {
        let mut rsi = Rsi::new(14);
        let mut last = None;
        // Strictly rising series: RSI should be pinned at 100.
        for i in 0..20 {
            last = rsi.update(Decimal::from(100 + i));
        }
        assert_eq!(last, Some(Decimal::ONE_HUNDRED));

        // A falling tail pulls it below 100.
        for i in 0..5 {
            last = rsi.update(Decimal::from(119 - i * 3));
        }
        let value = last.unwrap();
        assert!(value < Decimal::ONE_HUNDRED);
        assert!(value >= Decimal::ZERO);
    }

    #[test]
    fn test_macd_warms_after_slow_and_signal() {
        let mut macd = Macd::new(3, 5, 2);
        let mut output = None;
        for i in 1..=10 {
            output = macd.update(Decimal::from(i));
        }
        let output = output.expect("warm after 10 samples");
        assert_eq!(output.histogram, output.macd - output.signal);
    }

    #[test]
    fn test_bollinger_bands_bracket_mean() {
        let mut bollinger = Bollinger::new(4, dec!(2));
        bollinger.update(dec!(10));
        bollinger.update(dec!(12));
        bollinger.update(dec!(14));
        let bands = bollinger.update(dec!(16)).unwrap();

        assert_eq!(bands.middle, dec!(13));
        assert!(bands.upper > bands.middle);
        assert!(bands.lower < bands.middle);
        assert_eq!(bands.upper - bands.middle, bands.middle - bands.lower);
    }

    #[test]
    fn test_bollinger_zero_variance() {
        let mut bollinger = Bollinger::new(3, dec!(2));
        bollinger.update(dec!(5));
        bollinger.update(dec!(5));
        let bands = bollinger.update(dec!(5)).unwrap();
        assert_eq!(bands.upper, dec!(5));
        assert_eq!(bands.lower, dec!(5));
    }
}
