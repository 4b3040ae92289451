// =============================================================================
// Exponential Moving Average (EMA) & dual-average divergence
// =============================================================================
//
// Formula:
//   multiplier = 2 / (period + 1)
//   EMA_t      = close_t * multiplier + EMA_{t-1} * (1 - multiplier)
//
// The very first EMA value is seeded with the SMA of the first `period` closes.
//
// Divergence of a fast/slow pair is (EMA_fast - EMA_slow) / EMA_slow; the
// regime detector treats its magnitude as directional strength and its sign
// as trend direction.
// =============================================================================

/// Streaming EMA. Yields `None` until it has been seeded.
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    seen: usize,
    seed_sum: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            multiplier: 2.0 / (period + 1) as f64,
            seen: 0,
            seed_sum: 0.0,
            value: None,
        }
    }

    pub fn update(&mut self, close: f64) -> Option<f64> {
        self.seen += 1;
        match self.value {
            None => {
                self.seed_sum += close;
                if self.seen >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
            Some(prev) => {
                let ema = close * self.multiplier + prev * (1.0 - self.multiplier);
                // A non-finite input poisons the series; keep the last good value.
                if ema.is_finite() {
                    self.value = Some(ema);
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Compute the EMA series for `closes`. Element `i` corresponds to close
/// `period - 1 + i`. Empty when the input is too short, the period is zero, or
/// the seed is non-finite; stops at the first non-finite value.
pub fn calculate_ema(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period {
        return Vec::new();
    }

    let mut ema = Ema::new(period);
    let mut result = Vec::with_capacity(closes.len() - period + 1);
    for (i, &close) in closes.iter().enumerate() {
        if i >= period && !close.is_finite() {
            break;
        }
        if let Some(v) = ema.update(close) {
            if !v.is_finite() {
                break;
            }
            result.push(v);
        }
    }
    result
}

/// Latest fast/slow EMA pair and their normalised divergence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaDivergence {
    pub fast: f64,
    pub slow: f64,
    /// (fast - slow) / slow, signed.
    pub divergence: f64,
}

impl MaDivergence {
    /// -1, 0 or 1.
    pub fn direction(&self) -> i8 {
        if self.divergence > 0.0 {
            1
        } else if self.divergence < 0.0 {
            -1
        } else {
            0
        }
    }
}

/// Divergence between the latest fast and slow EMA values.
///
/// Returns `None` on insufficient data, a zero slow average, or a
/// non-finite result.
pub fn ma_divergence(closes: &[f64], fast: usize, slow: usize) -> Option<MaDivergence> {
    let fast_v = *calculate_ema(closes, fast).last()?;
    let slow_v = *calculate_ema(closes, slow).last()?;
    if slow_v == 0.0 {
        return None;
    }
    let divergence = (fast_v - slow_v) / slow_v;
    divergence.is_finite().then_some(MaDivergence {
        fast: fast_v,
        slow: slow_v,
        divergence,
    })
}
