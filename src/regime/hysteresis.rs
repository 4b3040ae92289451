// =============================================================================
// Hysteresis - confirmation and cooldown state machine
// =============================================================================
//
// Turns the noisy per-bar classification into the externally visible regime.
//
//   no prior regime   -> accept the first classification as is
//   cooldown active   -> decrement, hold the accepted regime
//   same as accepted  -> reset the confirmation counter
//   differs           -> count consecutive detections of the same candidate:
//                          confidence > 0.8  needs confirmation_bars - 1
//                          confidence > 0.6  needs confirmation_bars
//                          otherwise         reset, hold
//                        on acceptance arm the cooldown and flag a transition
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::types::RegimeType;

const HIGH_CONFIDENCE: f64 = 0.8;
const MEDIUM_CONFIDENCE: f64 = 0.6;

/// What the state machine made of one raw classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HysteresisOutcome {
    pub regime: RegimeType,
    /// The accepted regime changed on this call (never on the first call).
    pub transition: bool,
    /// Regime before this call, if any.
    pub previous: Option<RegimeType>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HysteresisState {
    current: Option<RegimeType>,
    pending: Option<RegimeType>,
    confirmations: u32,
    cooldown: u32,
}

impl HysteresisState {
    pub fn current(&self) -> Option<RegimeType> {
        self.current
    }

    pub fn pending(&self) -> Option<RegimeType> {
        self.pending
    }

    pub fn confirmations(&self) -> u32 {
        self.confirmations
    }

    pub fn cooldown_remaining(&self) -> u32 {
        self.cooldown
    }

    /// Feed one raw classification.
    pub fn apply(
        &mut self,
        raw: RegimeType,
        confidence: f64,
        confirmation_bars: u32,
        switch_cooldown: u32,
    ) -> HysteresisOutcome {
        let Some(current) = self.current else {
            self.current = Some(raw);
            return HysteresisOutcome {
                regime: raw,
                transition: false,
                previous: None,
            };
        };

        let hold = HysteresisOutcome {
            regime: current,
            transition: false,
            previous: Some(current),
        };

        if self.cooldown > 0 {
            self.cooldown -= 1;
            return hold;
        }

        if raw == current {
            self.reset_pending();
            return hold;
        }

        let required = if confidence > HIGH_CONFIDENCE {
            confirmation_bars.saturating_sub(1).max(1)
        } else if confidence > MEDIUM_CONFIDENCE {
            confirmation_bars.max(1)
        } else {
            self.reset_pending();
            return hold;
        };

        if self.pending != Some(raw) {
            self.pending = Some(raw);
            self.confirmations = 0;
        }
        self.confirmations += 1;

        if self.confirmations < required {
            return hold;
        }

        self.reset_pending();
        self.current = Some(raw);
        self.cooldown = switch_cooldown;
        HysteresisOutcome {
            regime: raw,
            transition: true,
            previous: Some(current),
        }
    }

    fn reset_pending(&mut self) {
        self.pending = None;
        self.confirmations = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use RegimeType::*;

    const BARS: u32 = 3;
    const COOLDOWN: u32 = 5;

    fn feed(state: &mut HysteresisState, raw: RegimeType, conf: f64) -> HysteresisOutcome {
        state.apply(raw, conf, BARS, COOLDOWN)
    }

    #[test]
    fn first_detection_is_accepted_without_flag() {
        let mut s = HysteresisState::default();
        let out = feed(&mut s, Ranging, 0.1);
        assert_eq!(out.regime, Ranging);
        assert!(!out.transition);
        assert_eq!(out.previous, None);
    }

    #[test]
    fn medium_confidence_needs_full_confirmation() {
        let mut s = HysteresisState::default();
        feed(&mut s, Ranging, 0.7);
        assert_eq!(feed(&mut s, Trending, 0.7).regime, Ranging);
        assert_eq!(feed(&mut s, Trending, 0.7).regime, Ranging);
        let out = feed(&mut s, Trending, 0.7);
        assert_eq!(out.regime, Trending);
        assert!(out.transition);
        assert_eq!(out.previous, Some(Ranging));
    }

    #[test]
    fn high_confidence_needs_one_less() {
        let mut s = HysteresisState::default();
        feed(&mut s, Ranging, 0.9);
        assert!(!feed(&mut s, Trending, 0.9).transition);
        assert!(feed(&mut s, Trending, 0.9).transition);
    }

    #[test]
    fn low_confidence_resets_counter() {
        let mut s = HysteresisState::default();
        feed(&mut s, Ranging, 0.9);
        feed(&mut s, Trending, 0.7);
        feed(&mut s, Trending, 0.7);
        feed(&mut s, Trending, 0.5);
        assert_eq!(s.confirmations(), 0);
        assert_eq!(feed(&mut s, Trending, 0.7).regime, Ranging);
    }

    #[test]
    fn non_repeating_differences_never_switch() {
        let mut s = HysteresisState::default();
        feed(&mut s, Ranging, 0.9);
        let seq = [Trending, Volatile, Trending, Uncertain, Volatile, Trending, Uncertain];
        for _ in 0..10 {
            for &raw in &seq {
                let out = feed(&mut s, raw, 0.75);
                assert_eq!(out.regime, Ranging);
                assert!(!out.transition);
            }
        }
    }

    #[test]
    fn cooldown_holds_new_regime() {
        let mut s = HysteresisState::default();
        feed(&mut s, Ranging, 0.9);
        feed(&mut s, Trending, 0.9);
        assert!(feed(&mut s, Trending, 0.9).transition);
        for _ in 0..COOLDOWN {
            let out = feed(&mut s, Volatile, 0.95);
            assert_eq!(out.regime, Trending);
            assert!(!out.transition);
        }
        assert_eq!(s.cooldown_remaining(), 0);
        feed(&mut s, Volatile, 0.95);
        assert!(feed(&mut s, Volatile, 0.95).transition);
    }

    #[test]
    fn single_bar_confirmation_never_requires_zero() {
        let mut s = HysteresisState::default();
        s.apply(Ranging, 0.9, 1, 0);
        let out = s.apply(Trending, 0.9, 1, 0);
        assert!(out.transition);
    }
}
