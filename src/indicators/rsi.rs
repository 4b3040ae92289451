// =============================================================================
// Relative Strength Index (RSI) - Wilder's Smoothing
// =============================================================================
//
// Step 1 - price changes from consecutive closes.
// Step 2 - Wilder averages of gains and losses (seeded with their SMA).
// Step 3 - RS = avg_gain / avg_loss, RSI = 100 - 100 / (1 + RS).
//
// The regime detector does not use RSI for overbought/oversold signals; it
// measures how tightly RSI hugs 50 as a noise score (see `noise_score`).
// =============================================================================

use crate::indicators::smoothing::WilderAverage;

/// Streaming RSI.
#[derive(Debug, Clone)]
pub struct RsiState {
    prev_close: Option<f64>,
    gains: WilderAverage,
    losses: WilderAverage,
}

impl RsiState {
    pub fn new(period: usize) -> Self {
        Self {
            prev_close: None,
            gains: WilderAverage::new(period),
            losses: WilderAverage::new(period),
        }
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        let prev = self.prev_close.replace(close)?;
        let delta = close - prev;
        let gain = self.gains.update(delta.max(0.0));
        let loss = self.losses.update((-delta).max(0.0));
        rsi_from_averages(gain?, loss?)
    }
}

/// Full RSI series. One value per close starting at index `period`.
/// Empty when `period == 0` or fewer than `period + 1` closes are given;
/// truncated at the first non-finite value.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let mut state = RsiState::new(period);
    let mut result = Vec::with_capacity(closes.len() - period);
    for (i, &close) in closes.iter().enumerate() {
        match state.update(close) {
            Some(rsi) => result.push(rsi),
            None if i > period => break,
            None => {}
        }
    }
    result
}

/// Centeredness of the oscillator within the neutral band.
///
/// Averages the last `smoothing` RSI readings, then returns 1.0 when that
/// average is exactly at the band centre, falling linearly to 0.0 at the band
/// edges and staying 0.0 outside the band.
pub fn noise_score(rsi_series: &[f64], smoothing: usize, band_low: f64, band_high: f64) -> Option<f64> {
    if rsi_series.is_empty() || band_high <= band_low {
        return None;
    }
    let n = smoothing.max(1).min(rsi_series.len());
    let window = &rsi_series[rsi_series.len() - n..];
    let value = window.iter().sum::<f64>() / n as f64;

    if value < band_low || value > band_high {
        return Some(0.0);
    }
    let centre = (band_low + band_high) / 2.0;
    let half_width = (band_high - band_low) / 2.0;
    Some((1.0 - (value - centre).abs() / half_width).clamp(0.0, 1.0))
}

/// Convert Wilder averages into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };
    rsi.is_finite().then_some(rsi)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_insufficient_data() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 14).is_empty());
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn rsi_all_gains_is_100() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let rsi = calculate_rsi(&closes, 14);
        assert_eq!(rsi.len(), 16);
        assert!(rsi.iter().all(|v| (*v - 100.0).abs() < 1e-10));
    }

    #[test]
    fn rsi_flat_is_neutral() {
        let rsi = calculate_rsi(&[100.0; 30], 14);
        assert!(rsi.iter().all(|v| (*v - 50.0).abs() < 1e-10));
    }

    #[test]
    fn rsi_in_range_for_oscillation() {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!((0.0..=100.0).contains(&v));
        }
    }

    #[test]
    fn noise_score_centre_edge_and_outside() {
        assert!((noise_score(&[50.0], 1, 45.0, 55.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((noise_score(&[52.5], 1, 45.0, 55.0).unwrap() - 0.5).abs() < 1e-12);
        assert_eq!(noise_score(&[70.0], 1, 45.0, 55.0), Some(0.0));
        assert!(noise_score(&[], 4, 45.0, 55.0).is_none());
    }

    #[test]
    fn noise_score_smooths_alternation() {
        // Alternating readings around 50 average out to the centre.
        let series = [48.0, 52.0, 48.0, 52.0];
        assert!((noise_score(&series, 4, 45.0, 55.0).unwrap() - 1.0).abs() < 1e-12);
    }
}
