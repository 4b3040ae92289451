// =============================================================================
// Transition data model
// =============================================================================
//
// Decision -> Plan -> Steps -> Record.
//
//   TransitionDecision  one per evaluation call, optionally carrying a plan
//   TransitionPlan      ordered steps, consumed once by the executor
//   ActiveTransition    the single in-flight transition (manager-owned)
//   TransitionRecord    what remains in history once it finishes
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EngineType, EnginePosition, PositionSide, RegimeType};

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Recommended way of resolving open positions after a regime change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionActionType {
    Hold,
    ProtectiveHold,
    ImmediateExit,
    GracefulMigration,
    FlattenHedge,
    ConvertToTrend,
    GradualUnwind,
    /// Engine switch only, positions untouched.
    Switch,
}

impl TransitionActionType {
    /// Everything except a plain hold produces a plan.
    pub fn requires_plan(self) -> bool {
        !matches!(self, Self::Hold)
    }
}

impl std::fmt::Display for TransitionActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Hold => "hold",
            Self::ProtectiveHold => "protective_hold",
            Self::ImmediateExit => "immediate_exit",
            Self::GracefulMigration => "graceful_migration",
            Self::FlattenHedge => "flatten_hedge",
            Self::ConvertToTrend => "convert_to_trend",
            Self::GradualUnwind => "gradual_unwind",
            Self::Switch => "switch",
        };
        f.write_str(s)
    }
}

/// Named policy bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Conservative,
    Aggressive,
    Adaptive,
}

impl std::fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Conservative => write!(f, "conservative"),
            Self::Aggressive => write!(f, "aggressive"),
            Self::Adaptive => write!(f, "adaptive"),
        }
    }
}

// ---------------------------------------------------------------------------
// Plan & steps
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    ImmediateExit,
    ClosePosition,
    ModifyOrder,
    PlaceOrder,
    EngineSwitch,
    ProtectiveStop,
    ScaleOut,
    TightenStops,
    Convert,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ImmediateExit => "immediate_exit",
            Self::ClosePosition => "close_position",
            Self::ModifyOrder => "modify_order",
            Self::PlaceOrder => "place_order",
            Self::EngineSwitch => "engine_switch",
            Self::ProtectiveStop => "protective_stop",
            Self::ScaleOut => "scale_out",
            Self::TightenStops => "tighten_stops",
            Self::Convert => "convert",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

/// Priority that marks a step as must-not-fail.
pub const CRITICAL_PRIORITY: u8 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionStep {
    pub id: String,
    pub step_type: StepType,
    /// Position the step acts on, if any.
    pub position_id: Option<String>,
    /// Fraction of the position affected (close/scale steps), in (0, 1].
    pub fraction: f64,
    /// Stop price, re-anchor price, or reference price of a new market order.
    pub price: Option<f64>,
    /// Side and size of a new order (place-order steps).
    pub side: Option<PositionSide>,
    pub quantity: Option<f64>,
    pub priority: u8,
    pub estimated_cost: f64,
    /// Only set once the step reported success.
    pub actual_cost: Option<f64>,
    pub status: StepStatus,
    pub attempts: u32,
    pub error: Option<String>,
    pub description: String,
}

impl TransitionStep {
    pub fn new(step_type: StepType, priority: u8, estimated_cost: f64, description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            step_type,
            position_id: None,
            fraction: 1.0,
            price: None,
            side: None,
            quantity: None,
            priority,
            estimated_cost,
            actual_cost: None,
            status: StepStatus::Pending,
            attempts: 0,
            error: None,
            description: description.into(),
        }
    }

    pub fn for_position(mut self, position_id: impl Into<String>) -> Self {
        self.position_id = Some(position_id.into());
        self
    }

    pub fn with_fraction(mut self, fraction: f64) -> Self {
        self.fraction = fraction.clamp(0.0, 1.0);
        self
    }

    pub fn with_price(mut self, price: f64) -> Self {
        self.price = Some(price);
        self
    }

    pub fn with_order(mut self, side: PositionSide, quantity: f64) -> Self {
        self.side = Some(side);
        self.quantity = Some(quantity);
        self
    }

    pub fn is_critical(&self) -> bool {
        self.priority == CRITICAL_PRIORITY
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionPlan {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub action: TransitionActionType,
    pub from_regime: RegimeType,
    pub to_regime: RegimeType,
    pub from_engine: EngineType,
    pub to_engine: EngineType,
    pub steps: Vec<TransitionStep>,
}

impl TransitionPlan {
    pub fn total_estimated_cost(&self) -> f64 {
        self.steps.iter().map(|s| s.estimated_cost).sum()
    }

    /// Sum of actual costs of completed steps.
    pub fn actual_cost(&self) -> f64 {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .filter_map(|s| s.actual_cost)
            .sum()
    }

    pub fn completed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Completed).count()
    }

    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| s.status == StepStatus::Failed).count()
    }

    /// Distinct positions referenced by the plan.
    pub fn positions_affected(&self) -> usize {
        let mut ids: Vec<&str> = self.steps.iter().filter_map(|s| s.position_id.as_deref()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Positions expected to remain once every step succeeds.
    pub fn target_positions(&self, original: &[EnginePosition]) -> Vec<EnginePosition> {
        original
            .iter()
            .filter_map(|pos| {
                let mut remaining = 1.0_f64;
                for step in self.steps.iter().filter(|s| s.position_id.as_deref() == Some(pos.id.as_str())) {
                    match step.step_type {
                        StepType::ImmediateExit | StepType::ClosePosition => remaining = 0.0,
                        StepType::ScaleOut => remaining -= step.fraction,
                        _ => {}
                    }
                }
                if remaining <= 1e-9 {
                    return None;
                }
                let mut kept = pos.clone();
                kept.size *= remaining;
                kept.unrealized_pnl *= remaining;
                Some(kept)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDecision {
    pub action: TransitionActionType,
    pub reason: String,
    pub confidence: f64,
    pub estimated_cost: f64,
    /// Estimated cost as a percentage of gross exposure.
    pub estimated_cost_pct: f64,
    pub plan: Option<TransitionPlan>,
    pub risk_factors: Vec<String>,
    pub policy: Option<PolicyKind>,
    pub timestamp: DateTime<Utc>,
}

impl TransitionDecision {
    pub fn hold(reason: impl Into<String>, confidence: f64) -> Self {
        Self {
            action: TransitionActionType::Hold,
            reason: reason.into(),
            confidence,
            estimated_cost: 0.0,
            estimated_cost_pct: 0.0,
            plan: None,
            risk_factors: Vec::new(),
            policy: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.action.requires_plan() && self.plan.is_some()
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionStatus {
    Evaluating,
    Planned,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl TransitionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveTransition {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub from_regime: RegimeType,
    pub to_regime: RegimeType,
    pub from_engine: EngineType,
    pub to_engine: EngineType,
    pub action: TransitionActionType,
    pub status: TransitionStatus,
    /// Completed steps / total steps.
    pub progress: f64,
    pub original_positions: Vec<EnginePosition>,
    pub target_positions: Vec<EnginePosition>,
    pub plan_id: String,
    pub estimated_cost: f64,
    pub actual_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub from_regime: RegimeType,
    pub to_regime: RegimeType,
    pub from_engine: EngineType,
    pub to_engine: EngineType,
    pub action: TransitionActionType,
    pub status: TransitionStatus,
    pub success: bool,
    pub estimated_cost: f64,
    pub actual_cost: f64,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub positions_affected: usize,
    /// min(1, estimated / actual); 1.0 when nothing was spent.
    pub efficiency: f64,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Cost efficiency of an execution.
pub fn efficiency_score(estimated: f64, actual: f64) -> f64 {
    if actual <= 0.0 {
        1.0
    } else {
        (estimated / actual).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionMetrics {
    pub total_transitions: u64,
    pub successful: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub success_rate: f64,
    pub average_cost: f64,
    pub average_duration_ms: f64,
    pub transitions_today: u32,
    pub cost_today: f64,
    pub last_transition_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(id: &str, size: f64) -> EnginePosition {
        EnginePosition {
            id: id.into(),
            side: PositionSide::Long,
            size,
            entry_price: 100.0,
            current_price: 100.0,
            unrealized_pnl: 10.0,
            entry_time: Utc::now(),
        }
    }

    fn plan(steps: Vec<TransitionStep>) -> TransitionPlan {
        TransitionPlan {
            id: "plan".into(),
            created_at: Utc::now(),
            action: TransitionActionType::GradualUnwind,
            from_regime: RegimeType::Ranging,
            to_regime: RegimeType::Trending,
            from_engine: EngineType::Grid,
            to_engine: EngineType::Trend,
            steps,
        }
    }

    #[test]
    fn total_estimated_cost_is_sum_of_steps() {
        let p = plan(vec![
            TransitionStep::new(StepType::ScaleOut, 2, 1.5, "a"),
            TransitionStep::new(StepType::ScaleOut, 2, 2.5, "b"),
            TransitionStep::new(StepType::EngineSwitch, 1, 0.0, "c"),
        ]);
        assert!((p.total_estimated_cost() - 4.0).abs() < 1e-12);
    }

    #[test]
    fn actual_cost_counts_only_completed_steps() {
        let mut p = plan(vec![
            TransitionStep::new(StepType::ScaleOut, 2, 1.0, "a"),
            TransitionStep::new(StepType::ScaleOut, 2, 1.0, "b"),
        ]);
        p.steps[0].status = StepStatus::Completed;
        p.steps[0].actual_cost = Some(1.2);
        p.steps[1].status = StepStatus::Failed;
        assert!((p.actual_cost() - 1.2).abs() < 1e-12);
        assert_eq!(p.completed_steps(), 1);
        assert_eq!(p.failed_steps(), 1);
    }

    #[test]
    fn target_positions_apply_closes_and_scale_outs() {
        let original = vec![pos("a", 2.0), pos("b", 1.0)];
        let p = plan(vec![
            TransitionStep::new(StepType::ScaleOut, 2, 0.0, "").for_position("a").with_fraction(0.5),
            TransitionStep::new(StepType::ClosePosition, 1, 0.0, "").for_position("b"),
        ]);
        let target = p.target_positions(&original);
        assert_eq!(target.len(), 1);
        assert!((target[0].size - 1.0).abs() < 1e-12);
        assert_eq!(p.positions_affected(), 2);
    }

    #[test]
    fn efficiency_is_capped() {
        assert!((efficiency_score(2.0, 1.0) - 1.0).abs() < 1e-12);
        assert!((efficiency_score(1.0, 2.0) - 0.5).abs() < 1e-12);
        assert!((efficiency_score(1.0, 0.0) - 1.0).abs() < 1e-12);
    }
}
