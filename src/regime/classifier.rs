// =============================================================================
// Regime Classifier
// =============================================================================
//
// Fuses the indicator library into one `RegimeMetrics` value and maps it to a
// raw (pre-hysteresis) regime plus a confidence score.
//
//   trend strength = avg( ADX / (2 x threshold), |MA divergence| / (2 x threshold) )
//   volatility     = avg( ATR% / ceiling,        band width / ceiling )
//   noise          = RSI centredness within the neutral band
//
// Classification hierarchy (first match wins):
//
//   1. TRENDING   ADX > threshold AND strength > 0.6
//                 AND (confirmed breakout > 0.3 OR divergence > threshold)
//   2. RANG/VOL   ADX < 0.8 x threshold AND noise > 0.6
//                 -> RANGING if volatility < 0.4 else VOLATILE
//   3. VOLATILE   volatility > 0.7
//   4. RANGING    ADX < 0.8 x threshold, no breakout, strength < 0.4
//   5. UNCERTAIN  otherwise
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{CoreError, CoreResult};
use crate::indicators::{
    calculate_adx, calculate_atr, calculate_bollinger, calculate_rsi, detect_breakout, ma_divergence, noise_score,
};
use crate::market_data::Candle;
use crate::runtime_config::RegimeConfig;
use crate::types::RegimeType;

/// Everything one classification call derives from the bar window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegimeMetrics {
    /// -1, 0 or 1, from the sign of the MA divergence.
    pub trend_direction: i8,
    /// Combined trend strength in [0, 1].
    pub trend_strength: f64,
    /// Combined volatility in [0, 1].
    pub volatility: f64,
    /// Oscillator centredness in [0, 1].
    pub noise_level: f64,
    pub breakout: bool,
    pub breakout_confirmed: bool,
    pub breakout_strength: f64,
    /// (fast EMA - slow EMA) / slow EMA.
    pub ma_distance: f64,
    pub adx: f64,
    pub atr_pct: f64,
    pub band_width: f64,
    pub price: f64,
}

fn indicator_err(indicator: &'static str, bars: usize) -> CoreError {
    CoreError::Indicator {
        indicator,
        reason: format!("no value over {bars} bars"),
    }
}

/// Compute the fused metrics over `candles` (oldest first).
pub fn compute_metrics(candles: &[Candle], cfg: &RegimeConfig) -> CoreResult<RegimeMetrics> {
    let n = candles.len();
    let price = candles.last().map(|c| c.close).ok_or(CoreError::InsufficientData {
        required: cfg.min_required_bars(),
        available: 0,
    })?;
    if price <= 0.0 || !price.is_finite() {
        return Err(CoreError::Indicator {
            indicator: "price",
            reason: format!("last close {price} is not a positive number"),
        });
    }
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let adx = calculate_adx(candles, cfg.adx_period).ok_or_else(|| indicator_err("adx", n))?;
    let div = ma_divergence(&closes, cfg.ema_fast_period, cfg.ema_slow_period)
        .ok_or_else(|| indicator_err("ma_divergence", n))?;
    let atr = calculate_atr(candles, cfg.atr_period).ok_or_else(|| indicator_err("atr", n))?;
    let bands = calculate_bollinger(&closes, cfg.bollinger_period, cfg.bollinger_std)
        .ok_or_else(|| indicator_err("bollinger", n))?;
    let rsi = calculate_rsi(&closes, cfg.rsi_period);
    let noise = noise_score(&rsi, cfg.rsi_smoothing, cfg.noise_band_low, cfg.noise_band_high)
        .ok_or_else(|| indicator_err("rsi", n))?;
    let breakout = detect_breakout(candles, cfg.donchian_period, atr).ok_or_else(|| indicator_err("donchian", n))?;

    let atr_pct = atr / price * 100.0;

    let adx_norm = (adx.adx / (2.0 * cfg.adx_threshold)).clamp(0.0, 1.0);
    let div_norm = (div.divergence.abs() / (2.0 * cfg.ma_divergence_threshold)).clamp(0.0, 1.0);
    let atr_norm = (atr_pct / cfg.atr_pct_ceiling).clamp(0.0, 1.0);
    let bbw_norm = (bands.width / cfg.bbw_ceiling).clamp(0.0, 1.0);

    let metrics = RegimeMetrics {
        trend_direction: div.direction(),
        trend_strength: (adx_norm + div_norm) / 2.0,
        volatility: (atr_norm + bbw_norm) / 2.0,
        noise_level: noise,
        breakout: breakout.direction != 0,
        breakout_confirmed: breakout.direction != 0 && breakout.confirmed,
        breakout_strength: breakout.strength,
        ma_distance: div.divergence,
        adx: adx.adx,
        atr_pct,
        band_width: bands.width,
        price,
    };

    trace!(
        adx = format!("{:.2}", metrics.adx),
        ma_distance = format!("{:.4}", metrics.ma_distance),
        atr_pct = format!("{:.3}", metrics.atr_pct),
        bbw = format!("{:.3}", metrics.band_width),
        noise = format!("{:.2}", metrics.noise_level),
        breakout = metrics.breakout,
        "regime metrics"
    );

    Ok(metrics)
}

/// Raw regime for one set of metrics.
pub fn classify(m: &RegimeMetrics, cfg: &RegimeConfig) -> RegimeType {
    let weak_adx = m.adx < 0.8 * cfg.adx_threshold;

    if m.adx > cfg.adx_threshold
        && m.trend_strength > 0.6
        && ((m.breakout_confirmed && m.breakout_strength > 0.3)
            || m.ma_distance.abs() > cfg.ma_divergence_threshold)
    {
        return RegimeType::Trending;
    }

    if weak_adx && m.noise_level > 0.6 {
        return if m.volatility < 0.4 {
            RegimeType::Ranging
        } else {
            RegimeType::Volatile
        };
    }

    if m.volatility > 0.7 {
        return RegimeType::Volatile;
    }

    if weak_adx && !m.breakout && m.trend_strength < 0.4 {
        return RegimeType::Ranging;
    }

    RegimeType::Uncertain
}

/// Confidence in `regime` given the metrics that produced it, in [0, 1].
pub fn confidence(regime: RegimeType, m: &RegimeMetrics, cfg: &RegimeConfig) -> f64 {
    let thr = cfg.adx_threshold;
    let div_thr = cfg.ma_divergence_threshold;
    let mut c: f64 = 0.5;

    match regime {
        RegimeType::Trending => {
            c += if m.adx > 1.2 * thr { 0.2 } else { 0.1 };
            c += if m.ma_distance.abs() > 2.0 * div_thr { 0.15 } else { 0.05 };
            if m.breakout_confirmed && m.breakout_strength > 0.3 {
                c += 0.15;
            }
            if m.noise_level > 0.5 {
                c -= 0.1;
            }
            if m.volatility > 0.8 {
                c -= 0.1;
            }
        }
        RegimeType::Ranging => {
            c += if m.adx < 0.6 * thr { 0.2 } else { 0.1 };
            if m.noise_level > 0.8 {
                c += 0.15;
            } else if m.noise_level > 0.6 {
                c += 0.05;
            }
            if !m.breakout {
                c += 0.1;
            }
            if m.volatility > 0.4 {
                c -= 0.1;
            }
            if m.ma_distance.abs() > div_thr {
                c -= 0.1;
            }
        }
        RegimeType::Volatile => {
            if m.volatility > 0.85 {
                c += 0.2;
            } else if m.volatility > 0.7 {
                c += 0.1;
            }
            if m.noise_level > 0.5 {
                c += 0.1;
            }
            if m.breakout && !m.breakout_confirmed {
                c += 0.05;
            }
            if m.trend_strength > 0.6 {
                c -= 0.1;
            }
            if m.adx > thr {
                c -= 0.1;
            }
        }
        RegimeType::Uncertain => c -= 0.2,
    }

    c.clamp(0.0, 1.0)
}
