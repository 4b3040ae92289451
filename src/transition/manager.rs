// =============================================================================
// Transition Manager
// =============================================================================
//
// Gatekeeper and bookkeeper for regime transitions.
//
// evaluate_transition gates, in order:
//   1. emergency stop
//   2. manual override
//   3. confidence floor
//   4. daily budget (count and cost, reset at the local day boundary)
//   5. cooldown since the last executed transition
//   6. a transition already running
// then: empty book -> zero-cost engine switch; otherwise evaluator -> active
// policy -> plan -> cost re-validation.
//
// execute_transition claims the single active slot under the state lock,
// releases the lock, runs the executor, then records the outcome. The slot is
// always cleared on the way out, including on panic or a dropped future.
//
// Lock scope: `state` is never held across an await or a call into an engine.
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::TradingEngine;
use crate::error::{CoreError, CoreResult};
use crate::execution::ExecutionVenue;
use crate::runtime_config::{EvaluatorConfig, ExecutorConfig, RuntimeConfig, TransitionConfig};
use crate::transition::budget::DailyBudget;
use crate::transition::evaluator::{PositionEvaluation, PositionEvaluator};
use crate::transition::executor::TransitionExecutor;
use crate::transition::plan::{EngineRoute, PlanBuilder};
use crate::transition::policy::{PolicyBook, PolicyPerformance, TransitionPolicy};
use crate::transition::types::{
    efficiency_score, ActiveTransition, PolicyKind, StepType, TransitionActionType, TransitionDecision,
    TransitionMetrics, TransitionPlan, TransitionRecord, TransitionStatus, TransitionStep, CRITICAL_PRIORITY,
};
use crate::types::{preferred_engine_for, EngineType, EnginePosition, MarketContext, RegimeChange};

struct ActiveSlot {
    transition: ActiveTransition,
    cancel: CancellationToken,
}

struct ManagerState {
    budget: DailyBudget,
    last_transition_at: Option<DateTime<Utc>>,
    active: Option<ActiveSlot>,
    history: VecDeque<TransitionRecord>,
    metrics: TransitionMetrics,
}

/// Persisted part of the manager. The active slot is never persisted: an
/// interrupted transition is not resumed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub budget: Option<DailyBudget>,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub history: Vec<TransitionRecord>,
    pub metrics: TransitionMetrics,
    pub policies: Vec<TransitionPolicy>,
    pub emergency_stop: bool,
    pub manual_override: bool,
}

pub struct TransitionManager {
    config: RwLock<TransitionConfig>,
    evaluator_config: RwLock<EvaluatorConfig>,
    executor_config: RwLock<ExecutorConfig>,
    policies: PolicyBook,
    venue: Arc<dyn ExecutionVenue>,
    state: RwLock<ManagerState>,
    emergency_stop: AtomicBool,
    manual_override: AtomicBool,
}

impl TransitionManager {
    pub fn new(config: &RuntimeConfig, venue: Arc<dyn ExecutionVenue>) -> Self {
        Self {
            config: RwLock::new(config.transition.clone()),
            evaluator_config: RwLock::new(config.evaluator),
            executor_config: RwLock::new(config.executor),
            policies: PolicyBook::new(&config.policies),
            venue,
            state: RwLock::new(ManagerState {
                budget: DailyBudget::new(Utc::now()),
                last_transition_at: None,
                active: None,
                history: VecDeque::new(),
                metrics: TransitionMetrics::default(),
            }),
            emergency_stop: AtomicBool::new(false),
            manual_override: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Evaluation
    // =========================================================================

    pub fn evaluate_transition(
        &self,
        change: &RegimeChange,
        from_engine: EngineType,
        positions: &[EnginePosition],
        market: &MarketContext,
    ) -> CoreResult<TransitionDecision> {
        let now = Utc::now();
        let cfg = self.config.read().clone();
        let confidence = change.confidence;

        if let Some(reason) = self.gate(&cfg, confidence, now) {
            debug!(
                from = %change.old_regime,
                to = %change.new_regime,
                reason = %reason,
                "transition held at gate"
            );
            return Ok(TransitionDecision::hold(reason, confidence));
        }

        let route = EngineRoute {
            from: from_engine,
            to: preferred_engine_for(change.new_regime).unwrap_or(from_engine),
        };

        if positions.is_empty() {
            let plan = switch_plan(change, route);
            return Ok(TransitionDecision {
                action: TransitionActionType::Switch,
                reason: format!("no open positions, switching {} -> {}", route.from, route.to),
                confidence,
                estimated_cost: 0.0,
                estimated_cost_pct: 0.0,
                plan: Some(plan),
                risk_factors: Vec::new(),
                policy: None,
                timestamp: now,
            });
        }

        let evaluator = PositionEvaluator::new(*self.evaluator_config.read());
        let evaluation = evaluator.evaluate_at(positions, change.old_regime, change.new_regime, market, now)?;

        let verdict = self
            .policies
            .evaluate(cfg.active_policy, &evaluation, change.old_regime, change.new_regime, confidence, now)
            .ok_or_else(|| CoreError::Configuration(format!("policy {} is not configured", cfg.active_policy)))?;

        let risk_factors = risk_factors(&evaluation, confidence);
        if verdict.action == TransitionActionType::Hold {
            let mut decision = TransitionDecision::hold(verdict.reason, confidence);
            decision.policy = Some(verdict.policy);
            decision.risk_factors = risk_factors;
            return Ok(decision);
        }

        let plan = PlanBuilder::new(evaluator.config()).generate_transition_plan(
            change,
            &evaluation,
            positions,
            verdict.action,
            route,
        )?;
        let estimated_cost = plan.total_estimated_cost();
        let estimated_cost_pct = if evaluation.gross_exposure > 0.0 {
            estimated_cost / evaluation.gross_exposure * 100.0
        } else {
            0.0
        };

        if estimated_cost_pct > cfg.max_transition_cost_pct {
            let mut decision = TransitionDecision::hold(
                format!(
                    "cost validation failed: {} would cost {estimated_cost_pct:.3}% (max {:.3}%)",
                    verdict.action, cfg.max_transition_cost_pct
                ),
                confidence,
            );
            decision.policy = Some(verdict.policy);
            decision.risk_factors = risk_factors;
            return Ok(decision);
        }

        info!(
            from = %change.old_regime,
            to = %change.new_regime,
            action = %verdict.action,
            policy = %verdict.policy,
            steps = plan.steps.len(),
            cost_pct = format!("{:.3}", estimated_cost_pct),
            confidence = format!("{:.2}", confidence),
            "transition decided"
        );

        Ok(TransitionDecision {
            action: verdict.action,
            reason: verdict.reason,
            confidence,
            estimated_cost,
            estimated_cost_pct,
            plan: Some(plan),
            risk_factors,
            policy: Some(verdict.policy),
            timestamp: now,
        })
    }

    /// First failing gate, as a hold reason.
    fn gate(&self, cfg: &TransitionConfig, confidence: f64, now: DateTime<Utc>) -> Option<String> {
        if self.emergency_stop.load(Ordering::SeqCst) {
            return Some("emergency stop active".into());
        }
        if self.manual_override.load(Ordering::SeqCst) {
            return Some("manual override active".into());
        }
        if confidence < cfg.min_confidence {
            return Some(format!(
                "confidence {confidence:.2} below minimum {:.2}",
                cfg.min_confidence
            ));
        }

        let policy_cap = self
            .policies
            .definition(cfg.active_policy)
            .map(|d| d.max_daily_applications)
            .unwrap_or(u32::MAX);
        let max_transitions = cfg.max_daily_transitions.min(policy_cap);

        let mut st = self.state.write();
        st.budget.maybe_reset(now);
        if let (false, Some(reason)) = st.budget.can_transition(max_transitions, cfg.max_daily_cost_pct) {
            return Some(reason);
        }

        if let Some(last) = st.last_transition_at {
            let ready_at = last + Duration::seconds(cfg.transition_cooldown_secs as i64);
            if now < ready_at {
                return Some(format!(
                    "transition cooldown: {}s remaining",
                    (ready_at - now).num_seconds().max(1)
                ));
            }
        }

        if let Some(slot) = &st.active {
            return Some(format!("transition {} already in progress", slot.transition.id));
        }
        None
    }

    // =========================================================================
    // Execution
    // =========================================================================

    pub async fn execute_transition(
        &self,
        decision: &TransitionDecision,
        from: Arc<dyn TradingEngine>,
        to: Arc<dyn TradingEngine>,
    ) -> CoreResult<TransitionRecord> {
        let mut plan = decision
            .plan
            .clone()
            .ok_or_else(|| CoreError::Validation(format!("{} decision carries no plan", decision.action)))?;

        let original_positions = from.current_positions();
        let gross: f64 = original_positions.iter().map(|p| p.signed_notional().abs()).sum();
        let cancel = CancellationToken::new();
        let started_at = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        {
            let mut st = self.state.write();
            if let Some(slot) = &st.active {
                return Err(CoreError::TransitionInProgress(slot.transition.id.clone()));
            }
            st.active = Some(ActiveSlot {
                transition: ActiveTransition {
                    id: id.clone(),
                    started_at,
                    from_regime: plan.from_regime,
                    to_regime: plan.to_regime,
                    from_engine: plan.from_engine,
                    to_engine: plan.to_engine,
                    action: plan.action,
                    status: TransitionStatus::Executing,
                    progress: 0.0,
                    target_positions: plan.target_positions(&original_positions),
                    original_positions,
                    plan_id: plan.id.clone(),
                    estimated_cost: plan.total_estimated_cost(),
                    actual_cost: 0.0,
                },
                cancel: cancel.clone(),
            });
        }
        let _slot = SlotGuard {
            state: &self.state,
            id: id.clone(),
        };

        info!(
            transition_id = %id,
            action = %plan.action,
            from = %plan.from_engine,
            to = %plan.to_engine,
            steps = plan.steps.len(),
            "transition started"
        );

        let executor = TransitionExecutor::new(*self.executor_config.read(), self.venue.clone());
        let report = executor.execute_transition_plan(&mut plan, from, to, cancel).await;

        let finished_at = Utc::now();
        let estimated_cost = plan.total_estimated_cost();
        let record = TransitionRecord {
            id: id.clone(),
            started_at,
            finished_at,
            from_regime: plan.from_regime,
            to_regime: plan.to_regime,
            from_engine: plan.from_engine,
            to_engine: plan.to_engine,
            action: plan.action,
            status: report.status,
            success: report.success(),
            estimated_cost,
            actual_cost: report.actual_cost,
            steps_completed: report.steps_completed,
            steps_failed: report.steps_failed,
            positions_affected: plan.positions_affected(),
            efficiency: efficiency_score(estimated_cost, report.actual_cost),
            duration_ms: report.duration_ms,
            error: report.error.clone(),
        };
        let cost_pct = if gross > 0.0 {
            report.actual_cost / gross * 100.0
        } else {
            0.0
        };

        let history_cap = self.config.read().history_cap.max(1);
        {
            let mut st = self.state.write();
            st.budget.record(record.actual_cost, cost_pct, finished_at);
            st.last_transition_at = Some(finished_at);

            let n = {
                let m = &mut st.metrics;
                m.total_transitions += 1;
                match record.status {
                    TransitionStatus::Completed => m.successful += 1,
                    TransitionStatus::Cancelled => m.cancelled += 1,
                    _ => m.failed += 1,
                }
                m.total_transitions as f64
            };
            let (transitions_today, cost_today) = (st.budget.transitions, st.budget.cost);
            let m = &mut st.metrics;
            m.success_rate = m.successful as f64 / n;
            m.average_cost += (record.actual_cost - m.average_cost) / n;
            m.average_duration_ms += (record.duration_ms as f64 - m.average_duration_ms) / n;
            m.transitions_today = transitions_today;
            m.cost_today = cost_today;
            m.last_transition_at = Some(finished_at);

            st.history.push_back(record.clone());
            while st.history.len() > history_cap {
                st.history.pop_front();
            }
            st.active = None;
        }

        if let Some(kind) = decision.policy {
            self.policies
                .record_outcome(kind, record.actual_cost, record.success, finished_at);
        }

        if record.success {
            info!(
                transition_id = %record.id,
                action = %record.action,
                actual_cost = format!("{:.4}", record.actual_cost),
                efficiency = format!("{:.2}", record.efficiency),
                duration_ms = record.duration_ms,
                "transition completed"
            );
        } else {
            warn!(
                transition_id = %record.id,
                status = ?record.status,
                completed = record.steps_completed,
                actual_cost = format!("{:.4}", record.actual_cost),
                error = record.error.as_deref().unwrap_or(""),
                "transition did not complete"
            );
        }
        Ok(record)
    }

    /// Signal the running transition to stop. Returns false when idle.
    pub fn cancel_active_transition(&self) -> bool {
        match &self.state.read().active {
            Some(slot) => {
                info!(transition_id = %slot.transition.id, "cancelling active transition");
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Controls & accessors
    // =========================================================================

    pub fn set_emergency_stop(&self, on: bool) {
        let was = self.emergency_stop.swap(on, Ordering::SeqCst);
        if was != on {
            warn!(emergency_stop = on, "emergency stop toggled");
        }
        if on {
            self.cancel_active_transition();
        }
    }

    pub fn is_emergency_stopped(&self) -> bool {
        self.emergency_stop.load(Ordering::SeqCst)
    }

    pub fn set_manual_override(&self, on: bool) {
        let was = self.manual_override.swap(on, Ordering::SeqCst);
        if was != on {
            info!(manual_override = on, "manual override toggled");
        }
    }

    pub fn is_manual_override(&self) -> bool {
        self.manual_override.load(Ordering::SeqCst)
    }

    pub fn metrics(&self) -> TransitionMetrics {
        let st = self.state.read();
        let mut m = st.metrics.clone();
        if !st.budget.is_current(Utc::now()) {
            m.transitions_today = 0;
            m.cost_today = 0.0;
        }
        m
    }

    pub fn active(&self) -> Option<ActiveTransition> {
        self.state.read().active.as_ref().map(|s| s.transition.clone())
    }

    pub fn is_transitioning(&self) -> bool {
        self.state.read().active.is_some()
    }

    /// Most recent `limit` records, oldest first.
    pub fn history(&self, limit: usize) -> Vec<TransitionRecord> {
        let st = self.state.read();
        let skip = st.history.len().saturating_sub(limit);
        st.history.iter().skip(skip).cloned().collect()
    }

    pub fn policy_performance(&self, kind: PolicyKind) -> Option<PolicyPerformance> {
        self.policies.performance(kind)
    }

    pub fn config(&self) -> TransitionConfig {
        self.config.read().clone()
    }

    pub fn update_config(&self, config: &RuntimeConfig) {
        *self.config.write() = config.transition.clone();
        *self.evaluator_config.write() = config.evaluator;
        *self.executor_config.write() = config.executor;
        self.policies.update_definitions(&config.policies);
        let mut st = self.state.write();
        while st.history.len() > config.transition.history_cap.max(1) {
            st.history.pop_front();
        }
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    pub fn snapshot(&self) -> ManagerSnapshot {
        let (budget, last_transition_at, history, metrics) = {
            let st = self.state.read();
            (
                st.budget.clone(),
                st.last_transition_at,
                st.history.iter().cloned().collect(),
                st.metrics.clone(),
            )
        };
        ManagerSnapshot {
            budget: Some(budget),
            last_transition_at,
            history,
            metrics,
            policies: self.policies.snapshot(),
            emergency_stop: self.is_emergency_stopped(),
            manual_override: self.is_manual_override(),
        }
    }

    pub fn restore(&self, snapshot: &ManagerSnapshot) {
        let cap = self.config.read().history_cap.max(1);
        {
            let mut st = self.state.write();
            if let Some(budget) = &snapshot.budget {
                st.budget = budget.clone();
                st.budget.maybe_reset(Utc::now());
            }
            st.last_transition_at = snapshot.last_transition_at;
            let skip = snapshot.history.len().saturating_sub(cap);
            st.history = snapshot.history.iter().skip(skip).cloned().collect();
            st.metrics = snapshot.metrics.clone();
        }
        self.policies.restore(&snapshot.policies);
        self.emergency_stop.store(snapshot.emergency_stop, Ordering::SeqCst);
        self.manual_override.store(snapshot.manual_override, Ordering::SeqCst);
        info!(
            history = snapshot.history.len(),
            total_transitions = snapshot.metrics.total_transitions,
            "transition manager state restored"
        );
    }
}

impl std::fmt::Debug for TransitionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.read();
        f.debug_struct("TransitionManager")
            .field("active", &st.active.as_ref().map(|s| s.transition.id.as_str()))
            .field("history", &st.history.len())
            .field("emergency_stop", &self.is_emergency_stopped())
            .field("manual_override", &self.is_manual_override())
            .finish()
    }
}

/// Clears the active slot it claimed, however execution ends.
struct SlotGuard<'a> {
    state: &'a RwLock<ManagerState>,
    id: String,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.state.write();
        if st.active.as_ref().is_some_and(|s| s.transition.id == self.id) {
            st.active = None;
        }
    }
}

fn switch_plan(change: &RegimeChange, route: EngineRoute) -> TransitionPlan {
    TransitionPlan {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: Utc::now(),
        action: TransitionActionType::Switch,
        from_regime: change.old_regime,
        to_regime: change.new_regime,
        from_engine: route.from,
        to_engine: route.to,
        steps: vec![TransitionStep::new(
            StepType::EngineSwitch,
            CRITICAL_PRIORITY,
            0.0,
            format!("switch {} -> {}", route.from, route.to),
        )],
    }
}

fn risk_factors(e: &PositionEvaluation, confidence: f64) -> Vec<String> {
    let mut out = Vec::new();
    if e.pnl_pct < -2.0 {
        out.push(format!("unrealized loss {:.2}%", e.pnl_pct));
    }
    if e.average_age_hours > 4.0 {
        out.push(format!("positions aged {:.1}h on average", e.average_age_hours));
    }
    if e.compatibility < 0.3 {
        out.push(format!("low compatibility {:.2} with {}", e.compatibility, e.new_regime));
    }
    if e.market.volatility > 0.7 {
        out.push(format!("high volatility {:.2}", e.market.volatility));
    }
    if confidence < 0.8 {
        out.push(format!("moderate confidence {confidence:.2}"));
    }
    out
}
