pub mod candle_buffer;

pub use candle_buffer::{load_jsonl, parse_candle_line, Candle, CandleBuffer};

/// Synthetic bar series shared by unit tests across the crate.
#[cfg(test)]
pub(crate) mod fixtures {
    use super::Candle;

    const BAR_MS: i64 = 60_000;

    /// Geometric uptrend growing `step_pct` per bar with tight wicks.
    pub fn uptrend(n: usize, step_pct: f64) -> Vec<Candle> {
        let mut price = 100.0;
        (0..n)
            .map(|i| {
                let open = price;
                price *= 1.0 + step_pct;
                Candle {
                    open_time: i as i64 * BAR_MS,
                    open,
                    high: price * 1.002,
                    low: open * 0.998,
                    close: price,
                    volume: 100.0,
                }
            })
            .collect()
    }

    /// Flat market alternating +/- `swing` around 100.
    pub fn chop(n: usize, swing: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let close = if i % 2 == 0 { 100.0 } else { 100.0 + swing };
                let open = if i % 2 == 0 { 100.0 + swing } else { 100.0 };
                Candle {
                    open_time: i as i64 * BAR_MS,
                    open,
                    high: close.max(open) + 0.1,
                    low: close.min(open) - 0.1,
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }

    /// Violent two-sided swings of `amplitude_pct` with a sawtooth drift.
    pub fn whipsaw(n: usize, amplitude_pct: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let drift = ((i / 7) % 2) as f64 * 2.0 - 1.0;
                let base = 100.0 * (1.0 + drift * amplitude_pct * ((i % 7) as f64 / 7.0));
                let close = if i % 2 == 0 {
                    base * (1.0 + amplitude_pct)
                } else {
                    base * (1.0 - amplitude_pct)
                };
                Candle {
                    open_time: i as i64 * BAR_MS,
                    open: base,
                    high: base.max(close) * (1.0 + amplitude_pct * 0.5),
                    low: base.min(close) * (1.0 - amplitude_pct * 0.5),
                    close,
                    volume: 100.0,
                }
            })
            .collect()
    }
}
