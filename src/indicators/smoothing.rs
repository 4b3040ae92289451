// =============================================================================
// Wilder's Smoothing
// =============================================================================
//
// Shared by ATR, RSI and ADX:
//   avg_0 = SMA of the first `period` inputs
//   avg_t = (avg_{t-1} * (period - 1) + x_t) / period
// =============================================================================

/// Streaming Wilder average. Yields `None` until `period` inputs were seen.
#[derive(Debug, Clone)]
pub struct WilderAverage {
    period: usize,
    seen: usize,
    seed_sum: f64,
    value: Option<f64>,
}

impl WilderAverage {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            seen: 0,
            seed_sum: 0.0,
            value: None,
        }
    }

    pub fn update(&mut self, x: f64) -> Option<f64> {
        self.seen += 1;
        match self.value {
            None => {
                self.seed_sum += x;
                if self.seen >= self.period {
                    self.value = Some(self.seed_sum / self.period as f64);
                }
            }
            Some(prev) => {
                let p = self.period as f64;
                self.value = Some((prev * (p - 1.0) + x) / p);
            }
        }
        self.value.filter(|v| v.is_finite())
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_with_sma_then_smooths() {
        let mut w = WilderAverage::new(3);
        assert!(w.update(1.0).is_none());
        assert!(w.update(2.0).is_none());
        assert!((w.update(3.0).unwrap() - 2.0).abs() < 1e-12);
        // (2 * 2 + 5) / 3 = 3
        assert!((w.update(5.0).unwrap() - 3.0).abs() < 1e-12);
    }
}
