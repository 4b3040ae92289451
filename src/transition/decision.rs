// =============================================================================
// Regime-pair decision trees
// =============================================================================
//
// TRENDING -> RANGING
//   immediate exit      P&L < -2%  AND confidence > 0.8 AND age > 4h
//   graceful migration  P&L > 0    AND age < 2h       AND confidence < 0.7
//   protective hold     P&L > -1%
//   hold
//
// RANGING -> TRENDING
//   flatten hedge       trend strength > 25 AND confidence > 0.8 AND book opposes trend
//   convert to trend    book aligned with trend AND P&L > 0
//   gradual unwind      20 < trend strength <= 25 AND P&L > 0
//   hold
//
// Any other pair
//   immediate exit      confidence > 0.8 AND compatibility < 0.3
//   switch              confidence > 0.6 AND compatibility > 0.5
//   hold
// =============================================================================

use crate::transition::evaluator::PositionEvaluation;
use crate::transition::types::TransitionActionType;
use crate::types::RegimeType;

/// Action suggested by the tree, with the rule that fired.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeOutcome {
    pub action: TransitionActionType,
    pub reason: String,
}

impl TreeOutcome {
    fn new(action: TransitionActionType, reason: impl Into<String>) -> Self {
        Self {
            action,
            reason: reason.into(),
        }
    }
}

pub fn decide(evaluation: &PositionEvaluation, old: RegimeType, new: RegimeType, confidence: f64) -> TreeOutcome {
    match (old, new) {
        (RegimeType::Trending, RegimeType::Ranging) => trending_to_ranging(evaluation, confidence),
        (RegimeType::Ranging, RegimeType::Trending) => ranging_to_trending(evaluation, confidence),
        _ => generic(evaluation, confidence),
    }
}

pub fn trending_to_ranging(e: &PositionEvaluation, confidence: f64) -> TreeOutcome {
    let pnl = e.pnl_pct;
    let age = e.average_age_hours;

    if pnl < -2.0 && confidence > 0.8 && age > 4.0 {
        TreeOutcome::new(
            TransitionActionType::ImmediateExit,
            format!("trend ended with P&L {pnl:.2}% after {age:.1}h"),
        )
    } else if pnl > 0.0 && age < 2.0 && confidence < 0.7 {
        TreeOutcome::new(
            TransitionActionType::GracefulMigration,
            format!("young profitable book (P&L {pnl:.2}%, {age:.1}h) migrates to grid"),
        )
    } else if pnl > -1.0 {
        TreeOutcome::new(
            TransitionActionType::ProtectiveHold,
            format!("P&L {pnl:.2}% within tolerance, protecting positions"),
        )
    } else {
        TreeOutcome::new(TransitionActionType::Hold, format!("no trending->ranging rule matched (P&L {pnl:.2}%)"))
    }
}

pub fn ranging_to_trending(e: &PositionEvaluation, confidence: f64) -> TreeOutcome {
    let strength = e.market.trend_strength;
    let alignment = e.trend_alignment();
    let pnl = e.pnl_pct;

    if strength > 25.0 && confidence > 0.8 && alignment < 0 {
        TreeOutcome::new(
            TransitionActionType::FlattenHedge,
            format!("book opposes a strong trend (strength {strength:.1})"),
        )
    } else if alignment > 0 && pnl > 0.0 {
        TreeOutcome::new(
            TransitionActionType::ConvertToTrend,
            format!("profitable book aligned with trend (P&L {pnl:.2}%)"),
        )
    } else if strength > 20.0 && strength <= 25.0 && pnl > 0.0 {
        TreeOutcome::new(
            TransitionActionType::GradualUnwind,
            format!("emerging trend (strength {strength:.1}), unwinding profitable grid"),
        )
    } else {
        TreeOutcome::new(TransitionActionType::Hold, "no ranging->trending rule matched")
    }
}

pub fn generic(e: &PositionEvaluation, confidence: f64) -> TreeOutcome {
    let compat = e.compatibility;
    if confidence > 0.8 && compat < 0.3 {
        TreeOutcome::new(
            TransitionActionType::ImmediateExit,
            format!("book incompatible with new regime (compatibility {compat:.2})"),
        )
    } else if confidence > 0.6 && compat > 0.5 {
        TreeOutcome::new(
            TransitionActionType::Switch,
            format!("book compatible with new regime (compatibility {compat:.2}), switching engine only"),
        )
    } else {
        TreeOutcome::new(
            TransitionActionType::Hold,
            format!("inconclusive: confidence {confidence:.2}, compatibility {compat:.2}"),
        )
    }
}
