// =============================================================================
// Average True Range (ATR) - Wilder's Smoothing Method
// =============================================================================
//
// True Range (TR) for each bar:
//   TR = max(H - L, |H - prevClose|, |L - prevClose|)
//
// ATR is the Wilder average of TR. The regime detector consumes ATR as a
// percentage of the last close so that volatility is comparable across price
// scales.
// =============================================================================

use crate::indicators::smoothing::WilderAverage;
use crate::market_data::Candle;

/// True range of `candle` given the previous close.
pub fn true_range(candle: &Candle, prev_close: f64) -> f64 {
    let hl = candle.high - candle.low;
    let hc = (candle.high - prev_close).abs();
    let lc = (candle.low - prev_close).abs();
    hl.max(hc).max(lc)
}

/// Streaming ATR.
#[derive(Debug, Clone)]
pub struct AtrState {
    prev_close: Option<f64>,
    avg: WilderAverage,
}

impl AtrState {
    pub fn new(period: usize) -> Self {
        Self {
            prev_close: None,
            avg: WilderAverage::new(period),
        }
    }

    pub fn update(&mut self, candle: &Candle) -> Option<f64> {
        let out = match self.prev_close {
            Some(prev) => self.avg.update(true_range(candle, prev)),
            None => None,
        };
        self.prev_close = Some(candle.close);
        out
    }
}

/// Most recent ATR over `candles` (oldest first).
///
/// `None` when `period` is zero, fewer than `period + 1` candles are given, or
/// any intermediate value is non-finite.
pub fn calculate_atr(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let mut state = AtrState::new(period);
    let mut last = None;
    for c in candles {
        last = state.update(c);
    }
    last.filter(|v| v.is_finite())
}

/// ATR as a percentage of the latest close.
pub fn calculate_atr_pct(candles: &[Candle], period: usize) -> Option<f64> {
    let atr = calculate_atr(candles, period)?;
    let last_close = candles.last()?.close;
    if last_close == 0.0 {
        return None;
    }
    Some((atr / last_close) * 100.0)
}
