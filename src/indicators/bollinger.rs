// =============================================================================
// Bollinger Bands
// =============================================================================
//
// Middle band = SMA(period), upper/lower = middle +/- k * sigma.
// Band width  = (upper - lower) / middle * 100, the second volatility input
// of the regime detector next to ATR%.

use std::collections::VecDeque;

/// Result of a Bollinger Band calculation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BollingerResult {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
    /// Band width in percent of the middle band.
    pub width: f64,
}

/// Rolling Bollinger calculator over a fixed window.
#[derive(Debug, Clone)]
pub struct BollingerState {
    period: usize,
    num_std: f64,
    window: VecDeque<f64>,
}

impl BollingerState {
    pub fn new(period: usize, num_std: f64) -> Self {
        let period = period.max(1);
        Self {
            period,
            num_std,
            window: VecDeque::with_capacity(period + 1),
        }
    }

    pub fn update(&mut self, close: f64) -> Option<BollingerResult> {
        self.window.push_back(close);
        if self.window.len() > self.period {
            self.window.pop_front();
        }
        if self.window.len() < self.period {
            return None;
        }
        bands(self.window.iter().copied(), self.period, self.num_std)
    }
}

/// Bollinger Bands over the last `period` closes.
///
/// `None` when fewer than `period` closes are given, `period` is zero, the
/// middle band is zero, or the width is non-finite.
pub fn calculate_bollinger(closes: &[f64], period: usize, num_std: f64) -> Option<BollingerResult> {
    if period == 0 || closes.len() < period {
        return None;
    }
    bands(closes[closes.len() - period..].iter().copied(), period, num_std)
}

fn bands(window: impl Iterator<Item = f64> + Clone, period: usize, num_std: f64) -> Option<BollingerResult> {
    let n = period as f64;
    let middle = window.clone().sum::<f64>() / n;
    if middle == 0.0 {
        return None;
    }
    let variance = window.map(|x| (x - middle).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    let upper = middle + num_std * std_dev;
    let lower = middle - num_std * std_dev;
    let width = (upper - lower) / middle * 100.0;

    width.is_finite().then_some(BollingerResult {
        upper,
        middle,
        lower,
        width,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bollinger_basic() {
        let closes: Vec<f64> = (1..=20).map(|x| x as f64).collect();
        let bb = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!(bb.upper > bb.middle);
        assert!(bb.lower < bb.middle);
        assert!(bb.width > 0.0);
    }

    #[test]
    fn bollinger_insufficient_data() {
        assert!(calculate_bollinger(&[1.0, 2.0, 3.0], 20, 2.0).is_none());
    }

    #[test]
    fn bollinger_flat() {
        let bb = calculate_bollinger(&[100.0; 20], 20, 2.0).unwrap();
        assert!(bb.width.abs() < 1e-10);
    }

    #[test]
    fn rolling_matches_slice() {
        let closes: Vec<f64> = (0..50).map(|i| 100.0 + (i as f64 * 0.5).cos() * 4.0).collect();
        let mut state = BollingerState::new(20, 2.0);
        let mut last = None;
        for &c in &closes {
            last = state.update(c);
        }
        let expected = calculate_bollinger(&closes, 20, 2.0).unwrap();
        assert!((last.unwrap().width - expected.width).abs() < 1e-10);
    }
}
