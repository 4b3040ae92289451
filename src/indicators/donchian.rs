// =============================================================================
// Donchian Channel Breakout
// =============================================================================
//
// The channel spans the highest high and lowest low of the `period` bars
// *before* the current one. A close beyond the channel is a breakout; its
// strength is the overshoot measured in ATR units, scaled by a volume factor:
//
//   volume > 1.5 x trailing 4-bar average  =>  strength x 1.5
//   volume < 0.5 x trailing 4-bar average  =>  strength x 0.7
//
// A breakout counts as confirmed when volume is not weak.
// =============================================================================

use crate::market_data::Candle;

/// Bars in the trailing volume average.
const VOLUME_LOOKBACK: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DonchianChannel {
    pub upper: f64,
    pub lower: f64,
}

impl DonchianChannel {
    pub fn middle(&self) -> f64 {
        (self.upper + self.lower) / 2.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakout {
    /// +1 upside, -1 downside, 0 inside the channel.
    pub direction: i8,
    /// Overshoot in ATR units times the volume factor, clamped to [0, 1].
    pub strength: f64,
    pub volume_factor: f64,
    pub confirmed: bool,
}

impl Breakout {
    fn none(volume_factor: f64) -> Self {
        Self {
            direction: 0,
            strength: 0.0,
            volume_factor,
            confirmed: false,
        }
    }
}

/// Channel of the `period` bars preceding the last bar.
pub fn calculate_donchian(candles: &[Candle], period: usize) -> Option<DonchianChannel> {
    if period == 0 || candles.len() < period + 1 {
        return None;
    }
    let prior = &candles[candles.len() - 1 - period..candles.len() - 1];
    let upper = prior.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max);
    let lower = prior.iter().map(|c| c.low).fold(f64::INFINITY, f64::min);
    (upper.is_finite() && lower.is_finite()).then_some(DonchianChannel { upper, lower })
}

/// Multiplier applied to breakout strength from the last bar's volume.
pub fn volume_factor(candles: &[Candle]) -> f64 {
    if candles.len() < VOLUME_LOOKBACK + 1 {
        return 1.0;
    }
    let last = &candles[candles.len() - 1];
    let trailing = &candles[candles.len() - 1 - VOLUME_LOOKBACK..candles.len() - 1];
    let avg = trailing.iter().map(|c| c.volume).sum::<f64>() / VOLUME_LOOKBACK as f64;
    if avg <= 0.0 {
        return 1.0;
    }
    if last.volume > avg * 1.5 {
        1.5
    } else if last.volume < avg * 0.5 {
        0.7
    } else {
        1.0
    }
}

/// Detect a channel breakout on the last bar. `atr` normalises the overshoot.
pub fn detect_breakout(candles: &[Candle], period: usize, atr: f64) -> Option<Breakout> {
    let channel = calculate_donchian(candles, period)?;
    let close = candles.last()?.close;
    let factor = volume_factor(candles);

    let (direction, overshoot) = if close > channel.upper {
        (1, close - channel.upper)
    } else if close < channel.lower {
        (-1, channel.lower - close)
    } else {
        return Some(Breakout::none(factor));
    };

    let raw = if atr > 0.0 { overshoot / atr } else { 1.0 };
    Some(Breakout {
        direction,
        strength: (raw * factor).clamp(0.0, 1.0),
        volume_factor: factor,
        confirmed: factor >= 1.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    fn range_then(last: Candle) -> Vec<Candle> {
        let mut candles = vec![bar(101.0, 99.0, 100.0, 100.0); 20];
        candles.push(last);
        candles
    }

    #[test]
    fn channel_excludes_current_bar() {
        let candles = range_then(bar(150.0, 140.0, 145.0, 100.0));
        let ch = calculate_donchian(&candles, 20).unwrap();
        assert!((ch.upper - 101.0).abs() < 1e-12);
        assert!((ch.lower - 99.0).abs() < 1e-12);
        assert!((ch.middle() - 100.0).abs() < 1e-12);
    }

    #[test]
    fn inside_channel_is_no_breakout() {
        let candles = range_then(bar(100.5, 99.5, 100.2, 100.0));
        let b = detect_breakout(&candles, 20, 2.0).unwrap();
        assert_eq!(b.direction, 0);
        assert!(!b.confirmed);
    }

    #[test]
    fn upside_breakout_with_volume_amplification() {
        let candles = range_then(bar(102.5, 100.5, 102.0, 200.0));
        let b = detect_breakout(&candles, 20, 2.0).unwrap();
        assert_eq!(b.direction, 1);
        assert!((b.volume_factor - 1.5).abs() < 1e-12);
        // overshoot 1.0 / atr 2.0 = 0.5, x1.5 = 0.75
        assert!((b.strength - 0.75).abs() < 1e-12);
        assert!(b.confirmed);
    }

    #[test]
    fn weak_volume_dampens_and_unconfirms() {
        let candles = range_then(bar(98.5, 97.0, 97.0, 10.0));
        let b = detect_breakout(&candles, 20, 2.0).unwrap();
        assert_eq!(b.direction, -1);
        assert!((b.volume_factor - 0.7).abs() < 1e-12);
        assert!(!b.confirmed);
    }

    #[test]
    fn insufficient_data() {
        let candles = vec![bar(101.0, 99.0, 100.0, 1.0); 5];
        assert!(detect_breakout(&candles, 20, 1.0).is_none());
    }
}
