// =============================================================================
// Market Regime Detector
// =============================================================================
//
// Owns the classification state machine. One detection call:
//
//   1. validate the window length
//   2. compute fused metrics (no lock held)
//   3. classify and score confidence
//   4. run hysteresis under the write lock
//   5. append the signal to the bounded history (bulk trim of the oldest 10%)
//
// Indicator failures propagate; the previous signal stays in place.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{CoreError, CoreResult};
use crate::market_data::Candle;
use crate::regime::classifier::{classify, compute_metrics, confidence, RegimeMetrics};
use crate::regime::hysteresis::HysteresisState;
use crate::runtime_config::RegimeConfig;
use crate::types::{RegimeChange, RegimeType};

// =============================================================================
// Types
// =============================================================================

/// Output of one detection call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeSignal {
    /// Accepted (post-hysteresis) regime.
    pub regime: RegimeType,
    /// Instantaneous classification before hysteresis.
    pub raw_regime: RegimeType,
    pub confidence: f64,
    /// Open time of the last bar in the window.
    pub timestamp: DateTime<Utc>,
    pub trend_strength: f64,
    pub trend_direction: i8,
    pub volatility: f64,
    pub noise_level: f64,
    pub price: f64,
    /// The accepted regime changed on this call.
    pub transition: bool,
}

/// Deep copy of the detector state for persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorSnapshot {
    pub hysteresis: HysteresisState,
    pub last_signal: Option<RegimeSignal>,
    pub last_metrics: Option<RegimeMetrics>,
    pub history: Vec<RegimeSignal>,
}

#[derive(Debug, Default)]
struct DetectorState {
    hysteresis: HysteresisState,
    last_signal: Option<RegimeSignal>,
    last_metrics: Option<RegimeMetrics>,
    history: Vec<RegimeSignal>,
}

// =============================================================================
// RegimeDetector
// =============================================================================

/// Thread-safe regime detector. Wrap in an `Arc` to share.
pub struct RegimeDetector {
    config: RwLock<RegimeConfig>,
    state: RwLock<DetectorState>,
}

impl RegimeDetector {
    pub fn new(config: RegimeConfig) -> Self {
        Self {
            config: RwLock::new(config),
            state: RwLock::new(DetectorState::default()),
        }
    }

    /// Classify the window and advance the state machine.
    pub fn detect_regime(&self, history: &[Candle]) -> CoreResult<RegimeSignal> {
        self.detect_with_change(history).map(|(signal, _)| signal)
    }

    /// Like [`detect_regime`](Self::detect_regime), also returning the
    /// accepted change, if this call produced one.
    pub fn detect_with_change(&self, history: &[Candle]) -> CoreResult<(RegimeSignal, Option<RegimeChange>)> {
        let cfg = self.config.read().clone();

        let required = cfg.min_required_bars();
        if history.len() < required {
            return Err(CoreError::InsufficientData {
                required,
                available: history.len(),
            });
        }

        let metrics = compute_metrics(history, &cfg)?;
        let raw = classify(&metrics, &cfg);
        let conf = confidence(raw, &metrics, &cfg);
        let timestamp = history.last().map(|c| c.timestamp()).unwrap_or_else(Utc::now);

        let mut state = self.state.write();
        let outcome = state
            .hysteresis
            .apply(raw, conf, cfg.confirmation_bars, cfg.regime_switch_cooldown);

        let signal = RegimeSignal {
            regime: outcome.regime,
            raw_regime: raw,
            confidence: conf,
            timestamp,
            trend_strength: metrics.trend_strength,
            trend_direction: metrics.trend_direction,
            volatility: metrics.volatility,
            noise_level: metrics.noise_level,
            price: metrics.price,
            transition: outcome.transition,
        };

        state.last_signal = Some(signal.clone());
        state.last_metrics = Some(metrics);
        state.history.push(signal.clone());
        trim_history(&mut state.history, cfg.history_cap);
        drop(state);

        let change = match (outcome.transition, outcome.previous) {
            (true, Some(old)) => Some(RegimeChange {
                timestamp,
                old_regime: old,
                new_regime: outcome.regime,
                confidence: conf,
                reason: change_reason(&metrics),
                trigger_price: metrics.price,
            }),
            _ => None,
        };

        if let Some(ch) = &change {
            info!(
                old = %ch.old_regime,
                new = %ch.new_regime,
                confidence = format!("{:.2}", ch.confidence),
                price = ch.trigger_price,
                "Regime change accepted"
            );
        } else {
            debug!(
                regime = %signal.regime,
                raw = %raw,
                confidence = format!("{:.2}", conf),
                strength = format!("{:.2}", signal.trend_strength),
                volatility = format!("{:.2}", signal.volatility),
                noise = format!("{:.2}", signal.noise_level),
                "Regime detected"
            );
        }

        Ok((signal, change))
    }

    /// Last accepted regime, if any detection succeeded yet.
    pub fn current_regime(&self) -> Option<RegimeType> {
        self.state.read().hysteresis.current()
    }

    pub fn last_signal(&self) -> Option<RegimeSignal> {
        self.state.read().last_signal.clone()
    }

    pub fn last_metrics(&self) -> Option<RegimeMetrics> {
        self.state.read().last_metrics
    }

    /// Most recent `limit` signals, oldest first.
    pub fn history(&self, limit: usize) -> Vec<RegimeSignal> {
        let state = self.state.read();
        let start = state.history.len().saturating_sub(limit);
        state.history[start..].to_vec()
    }

    pub fn history_len(&self) -> usize {
        self.state.read().history.len()
    }

    pub fn config(&self) -> RegimeConfig {
        self.config.read().clone()
    }

    /// Swap in a new (already validated) configuration. State is kept.
    pub fn update_config(&self, config: RegimeConfig) {
        *self.config.write() = config;
    }

    pub fn snapshot(&self) -> DetectorSnapshot {
        let state = self.state.read();
        DetectorSnapshot {
            hysteresis: state.hysteresis.clone(),
            last_signal: state.last_signal.clone(),
            last_metrics: state.last_metrics,
            history: state.history.clone(),
        }
    }

    pub fn restore(&self, snapshot: DetectorSnapshot) {
        let cap = self.config.read().history_cap;
        let mut state = self.state.write();
        state.hysteresis = snapshot.hysteresis;
        state.last_signal = snapshot.last_signal;
        state.last_metrics = snapshot.last_metrics;
        state.history = snapshot.history;
        trim_history(&mut state.history, cap);
    }
}

impl Default for RegimeDetector {
    fn default() -> Self {
        Self::new(RegimeConfig::default())
    }
}

/// Once over `cap`, drop the oldest tenth in one pass.
fn trim_history(history: &mut Vec<RegimeSignal>, cap: usize) {
    if history.len() <= cap {
        return;
    }
    let excess = history.len() - cap;
    let drop_n = (cap / 10).max(excess).min(history.len());
    history.drain(..drop_n);
}

fn change_reason(m: &RegimeMetrics) -> String {
    format!(
        "confirmed: strength {:.2}, volatility {:.2}, noise {:.2}, adx {:.1}{}",
        m.trend_strength,
        m.volatility,
        m.noise_level,
        m.adx,
        if m.breakout_confirmed { ", breakout" } else { "" }
    )
}
