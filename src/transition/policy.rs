// =============================================================================
// Transition Policies
// =============================================================================
//
// A policy is a `PolicyDefinition` (configuration) plus its own bookkeeping.
// Evaluation order:
//
//   1. pair gate        (from, to) must be in the applicability set
//   2. daily cap        applications today < max_daily_applications
//   3. cooldown         cooldown_secs since the last application
//   4. confidence floor (adaptive policies move it with success rate and
//                        volatility, at most -10% / +20%)
//   5. forced exits     loss_exit_pct / max_position_age_hours, if set;
//                       generic pairs only, trending<->ranging keep their trees
//   6. decision tree    a tree `hold` becomes `protective_hold` only when that
//                       is the policy's preferred action
//   7. cost ceiling     above max_cost_pct the fallback action is used
//
// Gate failures are `hold` verdicts, never errors.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Local, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::runtime_config::PolicyDefinition;
use crate::transition::decision::decide;
use crate::transition::evaluator::{CostEstimate, PositionEvaluation};
use crate::transition::types::{PolicyKind, TransitionActionType};
use crate::types::RegimeType;

/// Outcomes kept for the adaptive success rate.
const OUTCOME_WINDOW: usize = 20;
/// Outcomes needed before the success rate moves the floor.
const MIN_OUTCOMES: usize = 5;

// ---------------------------------------------------------------------------
// Bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyPerformance {
    pub applications: u64,
    pub successes: u64,
    pub failures: u64,
    /// Running mean of actual cost per application.
    pub average_cost: f64,
    pub last_applied: Option<DateTime<Utc>>,
    pub applications_today: u32,
    /// Local calendar day `applications_today` refers to.
    pub day: Option<NaiveDate>,
    #[serde(default)]
    pub recent_outcomes: VecDeque<bool>,
}

impl PolicyPerformance {
    pub fn success_rate(&self) -> Option<f64> {
        if self.recent_outcomes.len() < MIN_OUTCOMES {
            return None;
        }
        let ok = self.recent_outcomes.iter().filter(|&&o| o).count();
        Some(ok as f64 / self.recent_outcomes.len() as f64)
    }

    fn applications_on(&self, day: NaiveDate) -> u32 {
        if self.day == Some(day) {
            self.applications_today
        } else {
            0
        }
    }

    fn record(&mut self, cost: f64, success: bool, now: DateTime<Utc>) {
        let today = local_day(now);
        if self.day != Some(today) {
            self.day = Some(today);
            self.applications_today = 0;
        }
        self.applications_today += 1;
        self.applications += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        let n = self.applications as f64;
        self.average_cost += (cost - self.average_cost) / n;
        self.last_applied = Some(now);

        self.recent_outcomes.push_back(success);
        while self.recent_outcomes.len() > OUTCOME_WINDOW {
            self.recent_outcomes.pop_front();
        }
    }
}

/// Pairs with their own decision tree. Forced exits never pre-empt them.
fn has_dedicated_tree(old: RegimeType, new: RegimeType) -> bool {
    matches!(
        (old, new),
        (RegimeType::Trending, RegimeType::Ranging) | (RegimeType::Ranging, RegimeType::Trending)
    )
}

pub(crate) fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Result of running one policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub policy: PolicyKind,
    pub action: TransitionActionType,
    pub reason: String,
    /// Floor in force for this evaluation.
    pub confidence_floor: f64,
    pub estimated_cost: CostEstimate,
    /// The verdict came from a gate, not from the decision rules.
    pub gated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionPolicy {
    pub definition: PolicyDefinition,
    pub performance: PolicyPerformance,
}

impl TransitionPolicy {
    pub fn new(definition: PolicyDefinition) -> Self {
        Self {
            definition,
            performance: PolicyPerformance::default(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.definition.kind
    }

    /// Confidence floor after adaptive adjustment, in [0, 1].
    pub fn effective_floor(&self, volatility: f64) -> f64 {
        let base = self.definition.confidence_floor;
        if !self.definition.adaptive {
            return base;
        }
        let mut factor: f64 = 1.0;
        match self.performance.success_rate() {
            Some(rate) if rate >= 0.8 => factor -= 0.1,
            Some(rate) if rate < 0.5 => factor += 0.2,
            _ => {}
        }
        if volatility > 0.7 {
            factor += 0.1;
        } else if volatility < 0.3 {
            factor -= 0.1;
        }
        (base * factor.clamp(0.9, 1.2)).clamp(0.0, 1.0)
    }

    pub fn evaluate_policy(
        &self,
        evaluation: &PositionEvaluation,
        old: RegimeType,
        new: RegimeType,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> PolicyVerdict {
        let def = &self.definition;
        let floor = self.effective_floor(evaluation.market.volatility);
        let gate = |reason: String| PolicyVerdict {
            policy: def.kind,
            action: TransitionActionType::Hold,
            reason,
            confidence_floor: floor,
            estimated_cost: CostEstimate::ZERO,
            gated: true,
        };

        if !def.applies_to(old, new) {
            return gate(format!("{} policy does not cover {old}->{new}", def.kind));
        }

        let used = self.performance.applications_on(local_day(now));
        if used >= def.max_daily_applications {
            return gate(format!(
                "{} policy daily limit reached ({used}/{})",
                def.kind, def.max_daily_applications
            ));
        }

        if let Some(last) = self.performance.last_applied {
            let elapsed = (now - last).num_seconds();
            let cooldown = def.cooldown_secs as i64;
            if elapsed < cooldown {
                return gate(format!("{} policy cooling down ({}s remaining)", def.kind, cooldown - elapsed));
            }
        }

        if confidence < floor {
            return gate(format!(
                "confidence {confidence:.2} below {} floor {floor:.2}",
                def.kind
            ));
        }

        let forced = if has_dedicated_tree(old, new) {
            None
        } else {
            self.forced_exit(evaluation)
        };
        let (mut action, mut reason) = match forced {
            Some(reason) => (TransitionActionType::ImmediateExit, reason),
            None => {
                let tree = decide(evaluation, old, new, confidence);
                if tree.action == TransitionActionType::Hold
                    && def.preferred_action == TransitionActionType::ProtectiveHold
                {
                    (
                        TransitionActionType::ProtectiveHold,
                        format!("{}; {} policy protects instead of holding", tree.reason, def.kind),
                    )
                } else {
                    (tree.action, tree.reason)
                }
            }
        };

        let mut cost = evaluation.costs.for_action(action);
        if cost.pct > def.max_cost_pct {
            reason = format!(
                "{action} would cost {:.3}% (max {:.3}%), falling back to {}",
                cost.pct, def.max_cost_pct, def.fallback_action
            );
            action = def.fallback_action;
            cost = evaluation.costs.for_action(action);
        }

        debug!(
            policy = %def.kind,
            action = %action,
            floor = format!("{:.2}", floor),
            cost_pct = format!("{:.3}", cost.pct),
            "policy evaluated"
        );

        PolicyVerdict {
            policy: def.kind,
            action,
            reason,
            confidence_floor: floor,
            estimated_cost: cost,
            gated: false,
        }
    }

    fn forced_exit(&self, e: &PositionEvaluation) -> Option<String> {
        if let Some(limit) = self.definition.loss_exit_pct {
            if e.pnl_pct < limit {
                return Some(format!("P&L {:.2}% breached the {limit:.1}% loss limit", e.pnl_pct));
            }
        }
        if let Some(max_age) = self.definition.max_position_age_hours {
            if e.average_age_hours > max_age {
                return Some(format!(
                    "positions aged {:.1}h exceed the {max_age:.0}h limit",
                    e.average_age_hours
                ));
            }
        }
        None
    }

    pub fn record_outcome(&mut self, cost: f64, success: bool, now: DateTime<Utc>) {
        self.performance.record(cost, success, now);
    }
}

// ---------------------------------------------------------------------------
// PolicyBook
// ---------------------------------------------------------------------------

/// Thread-safe set of policies keyed by kind.
pub struct PolicyBook {
    policies: RwLock<Vec<TransitionPolicy>>,
}

impl PolicyBook {
    pub fn new(definitions: &[PolicyDefinition]) -> Self {
        Self {
            policies: RwLock::new(definitions.iter().cloned().map(TransitionPolicy::new).collect()),
        }
    }

    pub fn evaluate(
        &self,
        kind: PolicyKind,
        evaluation: &PositionEvaluation,
        old: RegimeType,
        new: RegimeType,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Option<PolicyVerdict> {
        let policies = self.policies.read();
        policies
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.evaluate_policy(evaluation, old, new, confidence, now))
    }

    pub fn definition(&self, kind: PolicyKind) -> Option<PolicyDefinition> {
        self.policies.read().iter().find(|p| p.kind() == kind).map(|p| p.definition.clone())
    }

    pub fn record_outcome(&self, kind: PolicyKind, cost: f64, success: bool, now: DateTime<Utc>) {
        if let Some(p) = self.policies.write().iter_mut().find(|p| p.kind() == kind) {
            p.record_outcome(cost, success, now);
        }
    }

    pub fn performance(&self, kind: PolicyKind) -> Option<PolicyPerformance> {
        self.policies
            .read()
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.performance.clone())
    }

    /// Replace definitions, keeping bookkeeping of kinds that remain.
    pub fn update_definitions(&self, definitions: &[PolicyDefinition]) {
        let mut policies = self.policies.write();
        let next = definitions
            .iter()
            .map(|def| TransitionPolicy {
                definition: def.clone(),
                performance: policies
                    .iter()
                    .find(|p| p.kind() == def.kind)
                    .map(|p| p.performance.clone())
                    .unwrap_or_default(),
            })
            .collect();
        *policies = next;
    }

    pub fn snapshot(&self) -> Vec<TransitionPolicy> {
        self.policies.read().clone()
    }

    /// Restore bookkeeping from a snapshot. Definitions stay as configured.
    pub fn restore(&self, saved: &[TransitionPolicy]) {
        let mut policies = self.policies.write();
        for p in policies.iter_mut() {
            if let Some(s) = saved.iter().find(|s| s.kind() == p.kind()) {
                p.performance = s.performance.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::decision::tests::evaluation;
    use chrono::Duration;

    fn t2r(policy: &TransitionPolicy, pnl: f64, age: f64, conf: f64, now: DateTime<Utc>) -> PolicyVerdict {
        policy.evaluate_policy(&evaluation(pnl, age), RegimeType::Trending, RegimeType::Ranging, conf, now)
    }

    #[test]
    fn adaptive_exits_losing_trend_book() {
        let p = TransitionPolicy::new(PolicyDefinition::adaptive());
        let v = t2r(&p, -5.0, 6.0, 0.85, Utc::now());
        assert_eq!(v.action, TransitionActionType::ImmediateExit);
        assert!(!v.gated);
    }

    #[test]
    fn confidence_floor_gates() {
        let p = TransitionPolicy::new(PolicyDefinition::conservative());
        let v = t2r(&p, -5.0, 6.0, 0.75, Utc::now());
        assert_eq!(v.action, TransitionActionType::Hold);
        assert!(v.gated);
        assert!(v.reason.contains("floor"));
    }

    #[test]
    fn tree_hold_becomes_protective_only_for_conservative() {
        let p = TransitionPolicy::new(PolicyDefinition::conservative());
        let v = t2r(&p, -1.5, 1.0, 0.9, Utc::now());
        assert_eq!(v.action, TransitionActionType::ProtectiveHold);

        for def in [PolicyDefinition::adaptive(), PolicyDefinition::aggressive()] {
            let p = TransitionPolicy::new(def);
            let v = t2r(&p, -1.5, 1.0, 0.9, Utc::now());
            assert_eq!(v.action, TransitionActionType::Hold, "{}", p.kind());
            assert!(!v.gated);
        }
    }

    #[test]
    fn forced_exit_never_preempts_trending_ranging_tree() {
        let mut def = PolicyDefinition::adaptive();
        def.loss_exit_pct = Some(-3.0);
        def.max_position_age_hours = Some(24.0);
        let p = TransitionPolicy::new(def);

        // -3.5% after 1h at 0.75: the tree holds, the loss limit does not fire.
        let v = t2r(&p, -3.5, 1.0, 0.75, Utc::now());
        assert_eq!(v.action, TransitionActionType::Hold);

        // Generic pairs still honour the limit.
        let v = p.evaluate_policy(
            &evaluation(-3.5, 1.0),
            RegimeType::Volatile,
            RegimeType::Uncertain,
            0.75,
            Utc::now(),
        );
        assert_eq!(v.action, TransitionActionType::ImmediateExit);
        assert!(v.reason.contains("loss limit"));
    }

    #[test]
    fn expensive_action_falls_back() {
        let p = TransitionPolicy::new(PolicyDefinition::conservative());
        let mut e = evaluation(-5.0, 6.0);
        e.costs.exit = CostEstimate { amount: 9.0, pct: 0.9 };
        let v = p.evaluate_policy(&e, RegimeType::Trending, RegimeType::Ranging, 0.85, Utc::now());
        assert_eq!(v.action, TransitionActionType::Hold);
        assert!(v.reason.contains("falling back"));
    }

    #[test]
    fn daily_cap_and_cooldown() {
        let mut def = PolicyDefinition::aggressive();
        def.max_daily_applications = 2;
        let mut p = TransitionPolicy::new(def);
        let start = Utc::now();
        p.record_outcome(1.0, true, start);

        let v = t2r(&p, -5.0, 6.0, 0.9, start + Duration::seconds(60));
        assert!(v.reason.contains("cooling down"));

        let later = start + Duration::seconds(301);
        assert_eq!(t2r(&p, -5.0, 6.0, 0.9, later).action, TransitionActionType::ImmediateExit);

        p.record_outcome(1.0, true, later);
        let v = t2r(&p, -5.0, 6.0, 0.9, later + Duration::seconds(301));
        // Same local day unless the test runs across midnight.
        if local_day(later + Duration::seconds(301)) == local_day(start) {
            assert!(v.reason.contains("daily limit reached"));
        }
    }

    #[test]
    fn pair_gate() {
        let mut def = PolicyDefinition::aggressive();
        def.applicable_pairs.retain(|pair| pair.from != RegimeType::Trending);
        let p = TransitionPolicy::new(def);
        let v = t2r(&p, -5.0, 6.0, 0.9, Utc::now());
        assert!(v.gated);
        assert!(v.reason.contains("does not cover"));
    }

    #[test]
    fn adaptive_floor_moves_with_history_and_volatility() {
        let mut p = TransitionPolicy::new(PolicyDefinition::adaptive());
        assert!((p.effective_floor(0.5) - 0.7).abs() < 1e-12);
        let t = Utc::now();
        for _ in 0..6 {
            p.record_outcome(0.5, false, t);
        }
        assert!((p.effective_floor(0.5) - 0.84).abs() < 1e-12);
        // Capped at +20% even in high volatility.
        assert!((p.effective_floor(0.9) - 0.84).abs() < 1e-12);

        let mut q = TransitionPolicy::new(PolicyDefinition::adaptive());
        for _ in 0..6 {
            q.record_outcome(0.5, true, t);
        }
        // -10% success, -10% calm market, clamped to -10%.
        assert!((q.effective_floor(0.1) - 0.63).abs() < 1e-12);
    }

    #[test]
    fn running_average_cost() {
        let mut perf = PolicyPerformance::default();
        let t = Utc::now();
        perf.record(1.0, true, t);
        perf.record(3.0, false, t);
        assert_eq!(perf.applications, 2);
        assert_eq!(perf.successes, 1);
        assert!((perf.average_cost - 2.0).abs() < 1e-12);
    }

    #[test]
    fn book_restores_bookkeeping_only() {
        let book = PolicyBook::new(&[PolicyDefinition::adaptive()]);
        book.record_outcome(PolicyKind::Adaptive, 2.0, true, Utc::now());
        let snap = book.snapshot();

        let fresh = PolicyBook::new(&[PolicyDefinition::adaptive()]);
        fresh.restore(&snap);
        assert_eq!(fresh.performance(PolicyKind::Adaptive).unwrap().applications, 1);
        assert!(fresh.performance(PolicyKind::Aggressive).is_none());
    }
}
