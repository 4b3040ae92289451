// =============================================================================
// Transition Plan Builder
// =============================================================================
//
// Turns a decided action into ordered steps. Order is execution order: steps
// that free capital come before steps that use it, and the engine switch is
// always last. Priority 1 marks steps whose failure aborts the plan.
//
//   immediate exit      exit every position (1)                  -> switch
//   graceful migration  tighten stops (3), scale out 50% (2),
//                       re-anchor remaining order (3)            -> switch
//   flatten hedge       close positions against the trend (1),
//                       re-enter with the trend (3)              -> switch
//   convert to trend    close opposing (2), convert aligned (2),
//                       trailing protective stop (3)             -> switch
//   gradual unwind      scale out 50% of each (3), then close the rest (2)
//                                                                -> switch
//   protective hold     protective stop on every position (2), no switch
//   switch              engine switch only
//
// Step costs use the evaluator's rates so a plan's total matches the
// evaluation's estimate for the same action.
// =============================================================================

use chrono::Utc;

use crate::error::{CoreError, CoreResult};
use crate::runtime_config::EvaluatorConfig;
use crate::transition::evaluator::PositionEvaluation;
use crate::transition::types::{StepType, TransitionActionType, TransitionPlan, TransitionStep, CRITICAL_PRIORITY};
use crate::types::{EngineType, EnginePosition, PositionSide, RegimeChange};

const NORMAL_PRIORITY: u8 = 2;
const LOW_PRIORITY: u8 = 3;

/// Source and destination engine of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineRoute {
    pub from: EngineType,
    pub to: EngineType,
}

#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    costs: EvaluatorConfig,
}

impl PlanBuilder {
    pub fn new(costs: EvaluatorConfig) -> Self {
        Self { costs }
    }

    pub fn generate_transition_plan(
        &self,
        change: &RegimeChange,
        evaluation: &PositionEvaluation,
        positions: &[EnginePosition],
        action: TransitionActionType,
        route: EngineRoute,
    ) -> CoreResult<TransitionPlan> {
        let f = self.costs.fee_rate;
        let s = self.costs.slippage_rate;
        let exit_rate = f + s;
        let unwind_rate = f + 0.5 * s;

        // Riskiest first, positions missing from the ranking last.
        let mut ordered: Vec<&EnginePosition> = positions.iter().collect();
        ordered.sort_by_key(|p| {
            evaluation
                .ranked
                .iter()
                .position(|r| r.position_id == p.id)
                .unwrap_or(usize::MAX)
        });

        let stop_distance = 0.01 + 0.02 * evaluation.market.volatility.clamp(0.0, 1.0);
        let trend_dir = evaluation.market.trend_direction as f64;

        let mut steps = Vec::new();
        let mut switch = true;

        match action {
            TransitionActionType::Hold => {
                return Err(CoreError::Validation("a hold decision has no plan".into()));
            }
            TransitionActionType::Switch => {}
            TransitionActionType::ImmediateExit => {
                for p in &ordered {
                    steps.push(
                        TransitionStep::new(
                            StepType::ImmediateExit,
                            CRITICAL_PRIORITY,
                            notional(p) * exit_rate,
                            format!("exit {} {}", p.side, p.id),
                        )
                        .for_position(&p.id),
                    );
                }
            }
            TransitionActionType::GracefulMigration => {
                for p in &ordered {
                    steps.push(
                        TransitionStep::new(StepType::TightenStops, LOW_PRIORITY, 0.0, format!("tighten stop on {}", p.id))
                            .for_position(&p.id)
                            .with_price(stop_price(p, stop_distance / 2.0)),
                    );
                }
                for p in &ordered {
                    steps.push(
                        TransitionStep::new(
                            StepType::ScaleOut,
                            NORMAL_PRIORITY,
                            notional(p) * 0.5 * f,
                            format!("scale out half of {}", p.id),
                        )
                        .for_position(&p.id)
                        .with_fraction(0.5),
                    );
                    steps.push(
                        TransitionStep::new(
                            StepType::ModifyOrder,
                            LOW_PRIORITY,
                            0.0,
                            format!("re-anchor {} at grid centre", p.id),
                        )
                        .for_position(&p.id)
                        .with_price(evaluation.market.price),
                    );
                }
            }
            TransitionActionType::FlattenHedge => {
                let opposing: Vec<&&EnginePosition> =
                    ordered.iter().filter(|p| p.side.sign() * trend_dir < 0.0).collect();
                if opposing.is_empty() {
                    return Err(CoreError::Validation("no position opposes the trend".into()));
                }
                let mut closed = 0.0;
                for p in &opposing {
                    closed += p.size;
                    steps.push(
                        TransitionStep::new(
                            StepType::ClosePosition,
                            CRITICAL_PRIORITY,
                            notional(p) * exit_rate,
                            format!("close hedge {} against trend", p.id),
                        )
                        .for_position(&p.id),
                    );
                }
                let side = if trend_dir > 0.0 {
                    PositionSide::Long
                } else {
                    PositionSide::Short
                };
                steps.push(
                    TransitionStep::new(
                        StepType::PlaceOrder,
                        LOW_PRIORITY,
                        closed * evaluation.market.price * exit_rate,
                        format!("re-enter {closed:.4} {side} with the trend"),
                    )
                    .with_order(side, closed)
                    .with_price(evaluation.market.price),
                );
            }
            TransitionActionType::ConvertToTrend => {
                let (aligned, opposing): (Vec<&EnginePosition>, Vec<&EnginePosition>) =
                    ordered.iter().copied().partition(|p| p.side.sign() * trend_dir >= 0.0);
                for p in &opposing {
                    steps.push(
                        TransitionStep::new(
                            StepType::ClosePosition,
                            NORMAL_PRIORITY,
                            notional(p) * exit_rate,
                            format!("close {} against trend", p.id),
                        )
                        .for_position(&p.id),
                    );
                }
                for p in &aligned {
                    steps.push(
                        TransitionStep::new(
                            StepType::Convert,
                            NORMAL_PRIORITY,
                            notional(p) * (0.5 * f + 0.25 * s),
                            format!("hand {} to {} engine", p.id, route.to),
                        )
                        .for_position(&p.id),
                    );
                    steps.push(
                        TransitionStep::new(StepType::ProtectiveStop, LOW_PRIORITY, 0.0, format!("trail stop on {}", p.id))
                            .for_position(&p.id)
                            .with_price(stop_price(p, stop_distance)),
                    );
                }
            }
            TransitionActionType::GradualUnwind => {
                for p in &ordered {
                    steps.push(
                        TransitionStep::new(
                            StepType::ScaleOut,
                            LOW_PRIORITY,
                            notional(p) * 0.5 * unwind_rate,
                            format!("first tranche of {}", p.id),
                        )
                        .for_position(&p.id)
                        .with_fraction(0.5),
                    );
                }
                for p in &ordered {
                    steps.push(
                        TransitionStep::new(
                            StepType::ClosePosition,
                            NORMAL_PRIORITY,
                            notional(p) * 0.5 * unwind_rate,
                            format!("final tranche of {}", p.id),
                        )
                        .for_position(&p.id),
                    );
                }
            }
            TransitionActionType::ProtectiveHold => {
                switch = false;
                for p in &ordered {
                    steps.push(
                        TransitionStep::new(
                            StepType::ProtectiveStop,
                            NORMAL_PRIORITY,
                            0.0,
                            format!("protective stop on {}", p.id),
                        )
                        .for_position(&p.id)
                        .with_price(stop_price(p, stop_distance)),
                    );
                }
            }
        }

        if switch {
            steps.push(TransitionStep::new(
                StepType::EngineSwitch,
                CRITICAL_PRIORITY,
                0.0,
                format!("switch {} -> {}", route.from, route.to),
            ));
        }

        if steps.is_empty() {
            return Err(CoreError::Validation(format!("{action} produced no steps")));
        }

        Ok(TransitionPlan {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            action,
            from_regime: change.old_regime,
            to_regime: change.new_regime,
            from_engine: route.from,
            to_engine: route.to,
            steps,
        })
    }
}

fn notional(p: &EnginePosition) -> f64 {
    p.size * p.current_price
}

/// Stop `distance` (fraction) away from the current price, on the losing side.
fn stop_price(p: &EnginePosition, distance: f64) -> f64 {
    p.current_price * (1.0 - p.side.sign() * distance)
}
