// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX quantifies trend **strength** regardless of direction.
//
// Calculation pipeline:
//   1. Compute +DM (positive directional movement) and -DM per bar.
//   2. Compute True Range (TR) per bar.
//   3. Apply Wilder's smoothing (period) to +DM, -DM, and TR.
//   4. Derive +DI = smoothed(+DM) / smoothed(TR) * 100
//            -DI = smoothed(-DM) / smoothed(TR) * 100
//   5. DX  = |+DI - -DI| / (+DI + -DI) * 100
//   6. ADX = Wilder's smoothed average of DX over `period` bars.
//
// Interpretation:
//   ADX > 25  => trending market
//   ADX < 20  => ranging / choppy market
// =============================================================================

use crate::indicators::atr::true_range;
use crate::indicators::smoothing::WilderAverage;
use crate::market_data::Candle;

/// Latest ADX reading with its directional components.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdxReading {
    pub adx: f64,
    pub plus_di: f64,
    pub minus_di: f64,
}

impl AdxReading {
    /// +1 when +DI dominates, -1 when -DI dominates, 0 otherwise.
    pub fn direction(&self) -> i8 {
        if self.plus_di > self.minus_di {
            1
        } else if self.minus_di > self.plus_di {
            -1
        } else {
            0
        }
    }
}

/// Streaming ADX.
#[derive(Debug, Clone)]
pub struct AdxState {
    prev: Option<Candle>,
    plus_dm: WilderAverage,
    minus_dm: WilderAverage,
    tr: WilderAverage,
    dx: WilderAverage,
}

impl AdxState {
    pub fn new(period: usize) -> Self {
        Self {
            prev: None,
            plus_dm: WilderAverage::new(period),
            minus_dm: WilderAverage::new(period),
            tr: WilderAverage::new(period),
            dx: WilderAverage::new(period),
        }
    }

    pub fn update(&mut self, candle: &Candle) -> Option<AdxReading> {
        let prev = self.prev.replace(candle.clone())?;

        let up_move = candle.high - prev.high;
        let down_move = prev.low - candle.low;
        let pdm = if up_move > down_move && up_move > 0.0 { up_move } else { 0.0 };
        let mdm = if down_move > up_move && down_move > 0.0 { down_move } else { 0.0 };

        let s_plus = self.plus_dm.update(pdm);
        let s_minus = self.minus_dm.update(mdm);
        let s_tr = self.tr.update(true_range(candle, prev.close));

        let (plus_di, minus_di, dx) = compute_dx(s_plus?, s_minus?, s_tr?)?;
        let adx = self.dx.update(dx)?;
        adx.is_finite().then_some(AdxReading {
            adx,
            plus_di,
            minus_di,
        })
    }
}

/// Most recent ADX reading over `candles` (oldest first).
///
/// `None` when `period` is zero, fewer than `2 * period` candles are given
/// (period bars for the initial smoothing plus period DX values to seed ADX),
/// or any intermediate value is non-finite.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<AdxReading> {
    if period == 0 || candles.len() < 2 * period {
        return None;
    }
    let mut state = AdxState::new(period);
    let mut last = None;
    for c in candles {
        last = state.update(c);
    }
    last
}

/// DI and DX from smoothed +DM, -DM and TR. Zero range means zero DX.
fn compute_dx(smooth_plus_dm: f64, smooth_minus_dm: f64, smooth_tr: f64) -> Option<(f64, f64, f64)> {
    if smooth_tr == 0.0 {
        return Some((0.0, 0.0, 0.0));
    }

    let plus_di = (smooth_plus_dm / smooth_tr) * 100.0;
    let minus_di = (smooth_minus_dm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some((plus_di, minus_di, 0.0));
    }

    let dx = ((plus_di - minus_di).abs() / di_sum) * 100.0;
    dx.is_finite().then_some((plus_di, minus_di, dx))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn adx_period_zero() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 50];
        assert!(calculate_adx(&candles, 0).is_none());
    }

    #[test]
    fn adx_insufficient_data() {
        let candles = vec![candle(1.0, 2.0, 0.5, 1.5); 10];
        assert!(calculate_adx(&candles, 14).is_none());
    }

    #[test]
    fn adx_strong_uptrend() {
        let candles: Vec<Candle> = (0..60)
            .map(|i| {
                let base = 100.0 + i as f64 * 2.0;
                candle(base, base + 1.5, base - 0.5, base + 1.0)
            })
            .collect();

        let reading = calculate_adx(&candles, 14).unwrap();
        assert!(reading.adx > 25.0, "expected ADX > 25 for strong trend, got {}", reading.adx);
        assert_eq!(reading.direction(), 1);
    }

    #[test]
    fn adx_flat_market() {
        let candles = vec![candle(100.0, 101.0, 99.0, 100.0); 60];
        let reading = calculate_adx(&candles, 14).unwrap();
        assert!(reading.adx < 1.0, "expected ADX near 0 for flat market, got {}", reading.adx);
        assert_eq!(reading.direction(), 0);
    }

    #[test]
    fn adx_result_range() {
        let candles: Vec<Candle> = (0..100)
            .map(|i| {
                let base = 50.0 + (i as f64 * 0.3).sin() * 10.0;
                candle(base - 0.5, base + 1.0, base - 1.0, base + 0.5)
            })
            .collect();
        if let Some(reading) = calculate_adx(&candles, 14) {
            assert!((0.0..=100.0).contains(&reading.adx), "ADX {} out of [0,100]", reading.adx);
        }
    }

    #[test]
    fn adx_minimum_candles_exact() {
        // period transitions seed the DM/TR averages, period DX values seed ADX.
        let period = 5;
        let min = 2 * period;
        let candles: Vec<Candle> = (0..min)
            .map(|i| {
                let base = 100.0 + i as f64;
                candle(base, base + 1.0, base - 0.5, base + 0.5)
            })
            .collect();
        assert!(calculate_adx(&candles, period).is_some());
        assert!(calculate_adx(&candles[..min - 1], period).is_none());
    }
}
