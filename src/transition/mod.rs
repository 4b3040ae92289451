// =============================================================================
// Transition Module
// =============================================================================
//
// From an accepted regime change to reconciled positions:
// - evaluator: exposure, P&L, compatibility and cost estimates of a book
// - decision:  per regime-pair decision rules
// - policy:    named threshold bundles with gates and bookkeeping
// - plan:      ordered, prioritised steps for a chosen action
// - budget:    per-day transition count and cost
// - executor:  sequential step execution with retries and cancellation
// - manager:   gating, the single active slot, history and metrics

pub mod budget;
pub mod decision;
pub mod evaluator;
pub mod executor;
pub mod manager;
pub mod plan;
pub mod policy;
pub mod types;

pub use budget::DailyBudget;
pub use evaluator::{CostEstimate, CostEstimates, PositionEvaluation, PositionEvaluator, PositionRisk};
pub use executor::{ExecutionReport, TransitionExecutor};
pub use manager::{ManagerSnapshot, TransitionManager};
pub use plan::{EngineRoute, PlanBuilder};
pub use policy::{PolicyBook, PolicyPerformance, PolicyVerdict, TransitionPolicy};
pub use types::*;
