// =============================================================================
// Regime Detection Module
// =============================================================================
//
// Rule-based market regime classification:
// - classifier: fused indicator metrics, classification rules, confidence
// - hysteresis: confirmation / cooldown state machine
// - detector:   thread-safe owner of the state machine and signal history
// - analysis:   offline summary of a signal stream

pub mod analysis;
pub mod classifier;
pub mod detector;
pub mod hysteresis;

pub use analysis::{RegimeReport, RegimeShare};
pub use classifier::{classify, compute_metrics, confidence, RegimeMetrics};
pub use detector::{DetectorSnapshot, RegimeDetector, RegimeSignal};
pub use hysteresis::{HysteresisOutcome, HysteresisState};
