// =============================================================================
// Regime Report - offline summary of a signal stream
// =============================================================================
//
// Pure consumer of `RegimeSignal` records (one per processed bar). A change is
// counted as a false signal when the accepted regime reverts to the one it
// replaced within `false_signal_window` signals.

use serde::{Deserialize, Serialize};

use crate::regime::detector::RegimeSignal;
use crate::types::RegimeType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeShare {
    pub regime: RegimeType,
    pub signals: usize,
    pub pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeReport {
    pub total_signals: usize,
    pub distribution: Vec<RegimeShare>,
    pub transitions: usize,
    pub false_signals: usize,
    /// False signals / transitions, in [0, 1].
    pub false_signal_rate: f64,
    /// Share of signals that did not flip the regime, percent.
    pub stability_pct: f64,
    pub mean_confidence: f64,
    /// Mean length of an uninterrupted regime run, in signals.
    pub mean_run_length: f64,
}

impl RegimeReport {
    pub fn from_signals(signals: &[RegimeSignal], false_signal_window: usize) -> Self {
        let total = signals.len();
        if total == 0 {
            return Self {
                total_signals: 0,
                distribution: RegimeType::ALL
                    .iter()
                    .map(|&regime| RegimeShare {
                        regime,
                        signals: 0,
                        pct: 0.0,
                    })
                    .collect(),
                transitions: 0,
                false_signals: 0,
                false_signal_rate: 0.0,
                stability_pct: 100.0,
                mean_confidence: 0.0,
                mean_run_length: 0.0,
            };
        }

        let distribution = RegimeType::ALL
            .iter()
            .map(|&regime| {
                let count = signals.iter().filter(|s| s.regime == regime).count();
                RegimeShare {
                    regime,
                    signals: count,
                    pct: count as f64 / total as f64 * 100.0,
                }
            })
            .collect();

        // Index of each accepted change, with the regime it replaced.
        let changes: Vec<(usize, RegimeType)> = signals
            .windows(2)
            .enumerate()
            .filter(|(_, w)| w[1].regime != w[0].regime)
            .map(|(i, w)| (i + 1, w[0].regime))
            .collect();

        let false_signals = changes
            .iter()
            .filter(|&&(at, replaced)| {
                signals[at + 1..]
                    .iter()
                    .take(false_signal_window)
                    .any(|s| s.regime == replaced)
            })
            .count();

        let transitions = changes.len();
        let mean_confidence = signals.iter().map(|s| s.confidence).sum::<f64>() / total as f64;

        Self {
            total_signals: total,
            distribution,
            transitions,
            false_signals,
            false_signal_rate: if transitions == 0 {
                0.0
            } else {
                false_signals as f64 / transitions as f64
            },
            stability_pct: (total - transitions) as f64 / total as f64 * 100.0,
            mean_confidence,
            mean_run_length: total as f64 / (transitions + 1) as f64,
        }
    }

    pub fn share(&self, regime: RegimeType) -> f64 {
        self.distribution
            .iter()
            .find(|s| s.regime == regime)
            .map(|s| s.pct)
            .unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use RegimeType::*;

    fn stream(regimes: &[RegimeType]) -> Vec<RegimeSignal> {
        regimes
            .iter()
            .map(|&regime| RegimeSignal {
                regime,
                raw_regime: regime,
                confidence: 0.8,
                timestamp: Utc::now(),
                trend_strength: 0.5,
                trend_direction: 0,
                volatility: 0.3,
                noise_level: 0.3,
                price: 100.0,
                transition: false,
            })
            .collect()
    }

    #[test]
    fn empty_stream() {
        let r = RegimeReport::from_signals(&[], 10);
        assert_eq!(r.total_signals, 0);
        assert_eq!(r.transitions, 0);
        assert!((r.stability_pct - 100.0).abs() < 1e-12);
    }

    #[test]
    fn distribution_and_runs() {
        let s = stream(&[Ranging, Ranging, Ranging, Trending, Trending, Trending, Trending, Ranging]);
        let r = RegimeReport::from_signals(&s, 2);
        assert_eq!(r.transitions, 2);
        assert!((r.share(Trending) - 50.0).abs() < 1e-12);
        assert!((r.share(Ranging) - 50.0).abs() < 1e-12);
        assert!((r.mean_run_length - 8.0 / 3.0).abs() < 1e-12);
        assert!((r.stability_pct - 75.0).abs() < 1e-12);
        assert!((r.mean_confidence - 0.8).abs() < 1e-12);
        // Trending lasted 4 signals, longer than the window of 2.
        assert_eq!(r.false_signals, 0);
    }

    #[test]
    fn quick_reversal_is_a_false_signal() {
        let s = stream(&[Ranging, Ranging, Volatile, Ranging, Ranging, Ranging]);
        let r = RegimeReport::from_signals(&s, 3);
        assert_eq!(r.transitions, 2);
        assert_eq!(r.false_signals, 1);
        assert!((r.false_signal_rate - 0.5).abs() < 1e-12);
    }
}
