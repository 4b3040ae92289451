// =============================================================================
// Transition Executor
// =============================================================================
//
// Runs a plan's steps one at a time, in plan order. Later steps may depend on
// capital freed by earlier ones, so nothing runs concurrently.
//
//   per step     up to `retry_attempts` attempts, each bounded by
//                `step_timeout_ms`; only retryable errors are retried
//   between      `inter_step_pause_ms`, whatever the outcome
//   overall      deadline of steps x step timeout
//   critical     a priority-1 step that fails after its retries aborts the
//                plan; remaining steps stay pending
//   cancel       checked before every step and during retry waits
//
// The plan is mutated in place (status, attempts, actual cost per step) so
// partial progress is always visible to the caller.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::TradingEngine;
use crate::error::{CoreError, CoreResult};
use crate::execution::{ExecutionVenue, VenueInstruction};
use crate::runtime_config::ExecutorConfig;
use crate::transition::types::{StepStatus, StepType, TransitionPlan, TransitionStatus, TransitionStep};
use crate::types::EnginePosition;

/// Outcome of one plan execution. Cost and step counts cover completed work
/// even when the plan failed or was cancelled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub plan_id: String,
    pub status: TransitionStatus,
    pub actual_cost: f64,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionReport {
    pub fn success(&self) -> bool {
        self.status == TransitionStatus::Completed
    }
}

pub struct TransitionExecutor {
    config: ExecutorConfig,
    venue: Arc<dyn ExecutionVenue>,
}

impl TransitionExecutor {
    pub fn new(config: ExecutorConfig, venue: Arc<dyn ExecutionVenue>) -> Self {
        Self { config, venue }
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config
    }

    pub async fn execute_transition_plan(
        &self,
        plan: &mut TransitionPlan,
        from: Arc<dyn TradingEngine>,
        to: Arc<dyn TradingEngine>,
        cancel: CancellationToken,
    ) -> ExecutionReport {
        let started = Instant::now();
        let deadline = Duration::from_millis(self.config.step_timeout_ms.saturating_mul(plan.steps.len().max(1) as u64));

        info!(
            plan_id = %plan.id,
            action = %plan.action,
            steps = plan.steps.len(),
            from = %from.engine_type(),
            to = %to.engine_type(),
            deadline_ms = deadline.as_millis() as u64,
            "executing transition plan"
        );

        let outcome = match tokio::time::timeout(deadline, self.run_steps(plan, &from, &to, &cancel)).await {
            Ok(result) => result,
            Err(_) => {
                // The step in flight was dropped with the timed-out future.
                for step in plan.steps.iter_mut().filter(|s| s.status == StepStatus::Executing) {
                    step.status = StepStatus::Failed;
                    step.error = Some("plan deadline exceeded".into());
                }
                Err(CoreError::Timeout(format!("plan exceeded {} ms", deadline.as_millis())))
            }
        };

        let (status, error) = match outcome {
            Ok(()) => (TransitionStatus::Completed, None),
            Err(CoreError::Cancelled) => (TransitionStatus::Cancelled, Some(CoreError::Cancelled.to_string())),
            Err(e) => (TransitionStatus::Failed, Some(e.to_string())),
        };

        let report = ExecutionReport {
            plan_id: plan.id.clone(),
            status,
            actual_cost: plan.actual_cost(),
            steps_completed: plan.completed_steps(),
            steps_failed: plan.failed_steps(),
            error,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        if report.success() {
            info!(
                plan_id = %report.plan_id,
                actual_cost = format!("{:.4}", report.actual_cost),
                completed = report.steps_completed,
                failed = report.steps_failed,
                duration_ms = report.duration_ms,
                "transition plan completed"
            );
        } else {
            warn!(
                plan_id = %report.plan_id,
                status = ?report.status,
                actual_cost = format!("{:.4}", report.actual_cost),
                completed = report.steps_completed,
                error = report.error.as_deref().unwrap_or(""),
                "transition plan did not complete"
            );
        }
        report
    }

    async fn run_steps(
        &self,
        plan: &mut TransitionPlan,
        from: &Arc<dyn TradingEngine>,
        to: &Arc<dyn TradingEngine>,
        cancel: &CancellationToken,
    ) -> CoreResult<()> {
        let count = plan.steps.len();
        let pause = Duration::from_millis(self.config.inter_step_pause_ms);

        for idx in 0..count {
            if cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }

            let step = &mut plan.steps[idx];
            let result = self.run_with_retries(step, from.as_ref(), to.as_ref(), cancel).await;
            match result {
                Ok(cost) => {
                    step.status = StepStatus::Completed;
                    step.actual_cost = Some(cost);
                    debug!(step = %step.step_type, attempts = step.attempts, cost, "step completed");
                }
                Err(CoreError::Cancelled) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(CoreError::Cancelled.to_string());
                    return Err(CoreError::Cancelled);
                }
                Err(e) => {
                    step.status = StepStatus::Failed;
                    step.error = Some(e.to_string());
                    warn!(
                        step = %step.step_type,
                        position = step.position_id.as_deref().unwrap_or("-"),
                        attempts = step.attempts,
                        critical = step.is_critical(),
                        error = %e,
                        "transition step failed"
                    );
                    if step.is_critical() {
                        return Err(e);
                    }
                }
            }

            if idx + 1 < count && !pause.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        Ok(())
    }

    async fn run_with_retries(
        &self,
        step: &mut TransitionStep,
        from: &dyn TradingEngine,
        to: &dyn TradingEngine,
        cancel: &CancellationToken,
    ) -> CoreResult<f64> {
        let max_attempts = self.config.retry_attempts.max(1);
        let step_timeout = Duration::from_millis(self.config.step_timeout_ms);
        let base_delay = Duration::from_millis(self.config.retry_delay_ms);
        step.status = StepStatus::Executing;

        loop {
            step.attempts += 1;
            let result = match tokio::time::timeout(step_timeout, self.run_step(step, from, to)).await {
                Ok(r) => r,
                Err(_) => Err(CoreError::Timeout(format!(
                    "{} step exceeded {} ms",
                    step.step_type, self.config.step_timeout_ms
                ))),
            };

            match result {
                Ok(cost) => return Ok(cost),
                Err(e) if e.is_retryable() && step.attempts < max_attempts => {
                    let wait = e.retry_delay(base_delay);
                    debug!(
                        step = %step.step_type,
                        attempt = step.attempts,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "retrying step"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One attempt of one step. Returns the step's realised cost.
    async fn run_step(&self, step: &TransitionStep, from: &dyn TradingEngine, to: &dyn TradingEngine) -> CoreResult<f64> {
        match step.step_type {
            StepType::ImmediateExit | StepType::ClosePosition | StepType::ScaleOut => {
                let pos = held_by(step, from)?;
                let size = if step.step_type == StepType::ScaleOut {
                    pos.size * step.fraction
                } else {
                    pos.size
                };
                let fill = self
                    .venue
                    .execute(&VenueInstruction::Close {
                        position_id: pos.id.clone(),
                        side: pos.side,
                        size,
                        reference_price: pos.current_price,
                    })
                    .await?;
                from.reduce_position(&pos.id, size, fill.price).map_err(|e| after_fill(&pos.id, e))?;
                Ok(fill.cost)
            }
            StepType::ModifyOrder => {
                let pos = located(step, from, to)?;
                let fill = self
                    .venue
                    .execute(&VenueInstruction::Modify {
                        position_id: pos.id,
                        price: step.price.unwrap_or(pos.current_price),
                    })
                    .await?;
                Ok(fill.cost)
            }
            StepType::PlaceOrder => {
                let (side, size) = match (step.side, step.quantity) {
                    (Some(side), Some(size)) if size > 0.0 => (side, size),
                    _ => return Err(CoreError::Validation("place-order step without side and size".into())),
                };
                let reference_price = step
                    .price
                    .ok_or_else(|| CoreError::Validation("place-order step without reference price".into()))?;
                let fill = self
                    .venue
                    .execute(&VenueInstruction::Place {
                        side,
                        size,
                        price: None,
                        reference_price,
                    })
                    .await?;
                to.open_position(side, size, fill.price);
                Ok(fill.cost)
            }
            StepType::ProtectiveStop | StepType::TightenStops => {
                let pos = located(step, from, to)?;
                let stop_price = step
                    .price
                    .ok_or_else(|| CoreError::Validation(format!("{} step without stop price", step.step_type)))?;
                let fill = self
                    .venue
                    .execute(&VenueInstruction::SetStop {
                        position_id: pos.id,
                        side: pos.side,
                        size: pos.size,
                        stop_price,
                    })
                    .await?;
                Ok(fill.cost)
            }
            StepType::Convert => {
                let pos = held_by(step, from)?;
                let fill = self
                    .venue
                    .execute(&VenueInstruction::Transfer {
                        position_id: pos.id.clone(),
                        size: pos.size,
                        reference_price: pos.current_price,
                    })
                    .await?;
                if from.engine_type() != to.engine_type() {
                    let moved = from.release_position(&pos.id).map_err(|e| after_fill(&pos.id, e))?;
                    to.adopt_position(moved);
                }
                Ok(fill.cost)
            }
            StepType::EngineSwitch => {
                if from.engine_type() != to.engine_type() {
                    from.set_active(false);
                }
                to.set_active(true);
                Ok(0.0)
            }
        }
    }
}

/// Engine bookkeeping failed after the venue filled. Never retried: a second
/// attempt would repeat the fill.
fn after_fill(position_id: &str, error: CoreError) -> CoreError {
    CoreError::Position(format!("venue filled {position_id} but engine update failed: {error}"))
}

fn position_id(step: &TransitionStep) -> CoreResult<&str> {
    step.position_id
        .as_deref()
        .ok_or_else(|| CoreError::Validation(format!("{} step without a position", step.step_type)))
}

fn held_by(step: &TransitionStep, engine: &dyn TradingEngine) -> CoreResult<EnginePosition> {
    let id = position_id(step)?;
    engine
        .position(id)
        .ok_or_else(|| CoreError::Position(format!("position {id} not held by {} engine", engine.engine_type())))
}

/// Position from either engine; converted positions live on the target.
fn located(step: &TransitionStep, from: &dyn TradingEngine, to: &dyn TradingEngine) -> CoreResult<EnginePosition> {
    let id = position_id(step)?;
    from.position(id)
        .or_else(|| to.position(id))
        .ok_or_else(|| CoreError::Position(format!("position {id} not found")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::PaperEngine;
    use crate::execution::{PaperVenue, VenueFill};
    use crate::runtime_config::EvaluatorConfig;
    use crate::transition::types::{TransitionActionType, CRITICAL_PRIORITY};
    use crate::types::{EngineType, PositionSide, RegimeType};
    use async_trait::async_trait;
    use chrono::Utc;

    fn fast() -> ExecutorConfig {
        ExecutorConfig {
            retry_attempts: 3,
            retry_delay_ms: 1,
            step_timeout_ms: 1_000,
            inter_step_pause_ms: 0,
        }
    }

    fn engines() -> (Arc<PaperEngine>, Arc<PaperEngine>) {
        (
            Arc::new(PaperEngine::new(EngineType::Grid, true)),
            Arc::new(PaperEngine::new(EngineType::Trend, false)),
        )
    }

    fn plan(steps: Vec<TransitionStep>) -> TransitionPlan {
        TransitionPlan {
            id: "plan".into(),
            created_at: Utc::now(),
            action: TransitionActionType::ImmediateExit,
            from_regime: RegimeType::Ranging,
            to_regime: RegimeType::Trending,
            from_engine: EngineType::Grid,
            to_engine: EngineType::Trend,
            steps,
        }
    }

    fn exit(id: &str) -> TransitionStep {
        TransitionStep::new(StepType::ImmediateExit, CRITICAL_PRIORITY, 0.15, "exit").for_position(id)
    }

    fn switch() -> TransitionStep {
        TransitionStep::new(StepType::EngineSwitch, CRITICAL_PRIORITY, 0.0, "switch")
    }

    /// Always rejects instructions that touch one position.
    struct RejectingVenue {
        position_id: String,
        inner: PaperVenue,
    }

    #[async_trait]
    impl ExecutionVenue for RejectingVenue {
        async fn execute(&self, instruction: &VenueInstruction) -> CoreResult<VenueFill> {
            if let VenueInstruction::Close { position_id, .. } = instruction {
                if *position_id == self.position_id {
                    return Err(CoreError::Order("insufficient balance".into()));
                }
            }
            self.inner.execute(instruction).await
        }
    }

    struct SlowVenue;

    #[async_trait]
    impl ExecutionVenue for SlowVenue {
        async fn execute(&self, _instruction: &VenueInstruction) -> CoreResult<VenueFill> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(VenueFill { price: 1.0, cost: 0.0 })
        }
    }

    /// Paper book whose close bookkeeping always fails with a transient error.
    struct StuckBook(PaperEngine);

    impl TradingEngine for StuckBook {
        fn engine_type(&self) -> EngineType {
            self.0.engine_type()
        }
        fn current_positions(&self) -> Vec<EnginePosition> {
            self.0.current_positions()
        }
        fn is_active(&self) -> bool {
            self.0.is_active()
        }
        fn set_active(&self, active: bool) {
            self.0.set_active(active)
        }
        fn reduce_position(&self, _id: &str, _size: f64, _price: f64) -> CoreResult<f64> {
            Err(CoreError::Temporary("ledger locked".into()))
        }
        fn release_position(&self, id: &str) -> CoreResult<EnginePosition> {
            self.0.release_position(id)
        }
        fn adopt_position(&self, position: EnginePosition) {
            self.0.adopt_position(position)
        }
        fn open_position(&self, side: PositionSide, size: f64, price: f64) -> EnginePosition {
            self.0.open_position(side, size, price)
        }
    }

    #[tokio::test]
    async fn exits_positions_then_switches_engines() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let b = grid.open_position(PositionSide::Short, 2.0, 100.0);
        let venue = Arc::new(PaperVenue::new(EvaluatorConfig::default()));
        let executor = TransitionExecutor::new(fast(), venue.clone());
        let mut p = plan(vec![exit(&a.id), exit(&b.id), switch()]);

        let report = executor
            .execute_transition_plan(&mut p, grid.clone(), trend.clone(), CancellationToken::new())
            .await;

        assert!(report.success());
        assert_eq!(report.steps_completed, 3);
        assert!((report.actual_cost - 300.0 * 0.0015).abs() < 1e-9);
        assert!((report.actual_cost - p.actual_cost()).abs() < 1e-12);
        assert!(grid.current_positions().is_empty());
        assert!(!grid.is_active());
        assert!(trend.is_active());
        assert_eq!(venue.fill_count(), 2);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let venue = Arc::new(PaperVenue::new(EvaluatorConfig::default()));
        venue.fail_next(CoreError::Network("connection reset".into()));
        let executor = TransitionExecutor::new(fast(), venue);
        let mut p = plan(vec![exit(&a.id)]);

        let report = executor
            .execute_transition_plan(&mut p, grid.clone(), trend, CancellationToken::new())
            .await;

        assert!(report.success());
        assert_eq!(p.steps[0].attempts, 2);
        assert!(grid.current_positions().is_empty());
    }

    #[tokio::test]
    async fn bookkeeping_failure_after_fill_is_not_retried() {
        let book = Arc::new(StuckBook(PaperEngine::new(EngineType::Grid, true)));
        let a = book.open_position(PositionSide::Long, 1.0, 100.0);
        let (_, trend) = engines();
        let venue = Arc::new(PaperVenue::new(EvaluatorConfig::default()));
        let executor = TransitionExecutor::new(fast(), venue.clone());
        let mut p = plan(vec![exit(&a.id), switch()]);

        let report = executor
            .execute_transition_plan(&mut p, book.clone(), trend, CancellationToken::new())
            .await;

        assert_eq!(report.status, TransitionStatus::Failed);
        assert!(report.error.unwrap().contains("engine update failed"));
        assert_eq!(p.steps[0].attempts, 1);
        assert_eq!(venue.fill_count(), 1);
        assert_eq!(book.current_positions().len(), 1);
    }

    #[tokio::test]
    async fn critical_failure_aborts_remaining_steps() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 2.0, 100.0);
        let b = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let venue = Arc::new(RejectingVenue {
            position_id: b.id.clone(),
            inner: PaperVenue::new(EvaluatorConfig::default()),
        });
        let executor = TransitionExecutor::new(fast(), venue);
        let scale = TransitionStep::new(StepType::ScaleOut, 2, 0.1, "scale").for_position(&a.id).with_fraction(0.5);
        let mut p = plan(vec![scale, exit(&b.id), exit(&a.id), switch()]);

        let report = executor
            .execute_transition_plan(&mut p, grid.clone(), trend.clone(), CancellationToken::new())
            .await;

        assert_eq!(report.status, TransitionStatus::Failed);
        assert_eq!(report.steps_completed, 1);
        assert_eq!(report.steps_failed, 1);
        // Order rejections are not retried.
        assert_eq!(p.steps[1].attempts, 1);
        assert!(p.steps[2..].iter().all(|s| s.status == StepStatus::Pending));
        assert!((report.actual_cost - 100.0 * 0.0015).abs() < 1e-9);
        assert!(grid.is_active());
        assert!(!trend.is_active());
    }

    #[tokio::test]
    async fn non_critical_failure_is_skipped() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let executor = TransitionExecutor::new(fast(), Arc::new(PaperVenue::new(EvaluatorConfig::default())));
        let missing = TransitionStep::new(StepType::ProtectiveStop, 2, 0.0, "stop")
            .for_position("ghost")
            .with_price(95.0);
        let mut p = plan(vec![missing, exit(&a.id), switch()]);

        let report = executor
            .execute_transition_plan(&mut p, grid, trend, CancellationToken::new())
            .await;

        assert!(report.success());
        assert_eq!(report.steps_completed, 2);
        assert_eq!(report.steps_failed, 1);
    }

    #[tokio::test]
    async fn cancelled_before_start_runs_nothing() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let executor = TransitionExecutor::new(fast(), Arc::new(PaperVenue::new(EvaluatorConfig::default())));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut p = plan(vec![exit(&a.id), switch()]);

        let report = executor.execute_transition_plan(&mut p, grid.clone(), trend, cancel).await;

        assert_eq!(report.status, TransitionStatus::Cancelled);
        assert_eq!(report.steps_completed, 0);
        assert_eq!(grid.current_positions().len(), 1);
    }

    #[tokio::test]
    async fn slow_venue_times_out() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let config = ExecutorConfig {
            retry_attempts: 1,
            retry_delay_ms: 1,
            step_timeout_ms: 20,
            inter_step_pause_ms: 0,
        };
        let executor = TransitionExecutor::new(config, Arc::new(SlowVenue));
        let mut p = plan(vec![exit(&a.id), switch()]);

        let report = executor.execute_transition_plan(&mut p, grid, trend, CancellationToken::new()).await;

        assert_eq!(report.status, TransitionStatus::Failed);
        assert!(report.error.unwrap().contains("timed out"));
        assert_eq!(report.steps_completed, 0);
    }

    #[tokio::test]
    async fn convert_moves_position_to_target_engine() {
        let (grid, trend) = engines();
        let a = grid.open_position(PositionSide::Long, 1.0, 100.0);
        let executor = TransitionExecutor::new(fast(), Arc::new(PaperVenue::new(EvaluatorConfig::default())));
        let convert = TransitionStep::new(StepType::Convert, 2, 0.0, "convert").for_position(&a.id);
        let stop = TransitionStep::new(StepType::ProtectiveStop, 3, 0.0, "stop")
            .for_position(&a.id)
            .with_price(97.0);
        let mut p = plan(vec![convert, stop, switch()]);

        let report = executor
            .execute_transition_plan(&mut p, grid.clone(), trend.clone(), CancellationToken::new())
            .await;

        assert!(report.success());
        assert_eq!(report.steps_failed, 0);
        assert!(grid.current_positions().is_empty());
        assert_eq!(trend.current_positions().len(), 1);
    }
}
