// =============================================================================
// Position Evaluator
// =============================================================================
//
// Pure function of (positions, old regime, new regime, market, now). Nothing
// is cached between calls.
//
// Exposure:       signed notional, long positive / short negative
// Compatibility:  how well net exposure fits the new regime
//   TRENDING   0.5 + 0.5 * (net / gross) * trend direction
//   RANGING    1 - |net| / gross            (grids want a flat book)
//   VOLATILE   0.3 * (1 - |net| / gross)
//   UNCERTAIN  0.5
//
// Cost estimates (gross notional G, fee f, slippage s):
//   exit     G * (f + s)
//   unwind   G * (f + s/2)     worked in tranches
//   migrate  G * f / 2         half the book re-anchored on the grid
//   convert  G * (f/2 + s/4)   handed over to the trend engine
//   flatten  |net| * (f + s)   close the side against the trend
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::runtime_config::EvaluatorConfig;
use crate::transition::types::TransitionActionType;
use crate::types::{EnginePosition, MarketContext, RegimeType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub amount: f64,
    /// Percent of gross exposure.
    pub pct: f64,
}

impl CostEstimate {
    fn of(amount: f64, gross: f64) -> Self {
        Self {
            amount,
            pct: if gross > 0.0 { amount / gross * 100.0 } else { 0.0 },
        }
    }

    pub const ZERO: CostEstimate = CostEstimate { amount: 0.0, pct: 0.0 };
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimates {
    pub exit: CostEstimate,
    pub migrate: CostEstimate,
    pub convert: CostEstimate,
    pub unwind: CostEstimate,
    pub flatten: CostEstimate,
}

impl CostEstimates {
    /// Estimate for resolving positions with `action`.
    pub fn for_action(&self, action: TransitionActionType) -> CostEstimate {
        match action {
            TransitionActionType::ImmediateExit => self.exit,
            TransitionActionType::GracefulMigration => self.migrate,
            TransitionActionType::ConvertToTrend => self.convert,
            TransitionActionType::GradualUnwind => self.unwind,
            TransitionActionType::FlattenHedge => self.flatten,
            TransitionActionType::Hold | TransitionActionType::ProtectiveHold | TransitionActionType::Switch => {
                CostEstimate::ZERO
            }
        }
    }
}

/// Per-position risk ranking entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRisk {
    pub position_id: String,
    pub notional: f64,
    pub pnl_pct: f64,
    pub age_hours: f64,
    /// Weighted size share, loss depth and age, in [0, 1].
    pub risk_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvaluation {
    pub old_regime: RegimeType,
    pub new_regime: RegimeType,
    pub position_count: usize,
    pub net_exposure: f64,
    pub gross_exposure: f64,
    pub unrealized_pnl: f64,
    /// Unrealized P&L in percent of entry notional.
    pub pnl_pct: f64,
    pub average_age_hours: f64,
    pub compatibility: f64,
    pub costs: CostEstimates,
    pub market: MarketContext,
    pub largest_position: Option<PositionRisk>,
    pub riskiest_position: Option<PositionRisk>,
    /// All positions, riskiest first.
    pub ranked: Vec<PositionRisk>,
    pub evaluated_at: DateTime<Utc>,
}

impl PositionEvaluation {
    /// Sign of net exposure relative to the market trend: 1 aligned, -1
    /// opposed, 0 flat or no trend.
    pub fn trend_alignment(&self) -> i8 {
        let dir = self.market.trend_direction as f64;
        let v = self.net_exposure * dir;
        if v > 0.0 {
            1
        } else if v < 0.0 {
            -1
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PositionEvaluator {
    config: EvaluatorConfig,
}

impl PositionEvaluator {
    pub fn new(config: EvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> EvaluatorConfig {
        self.config
    }

    pub fn evaluate_positions(
        &self,
        positions: &[EnginePosition],
        old_regime: RegimeType,
        new_regime: RegimeType,
        market: &MarketContext,
    ) -> CoreResult<PositionEvaluation> {
        self.evaluate_at(positions, old_regime, new_regime, market, Utc::now())
    }

    /// Evaluation against an explicit clock.
    pub fn evaluate_at(
        &self,
        positions: &[EnginePosition],
        old_regime: RegimeType,
        new_regime: RegimeType,
        market: &MarketContext,
        now: DateTime<Utc>,
    ) -> CoreResult<PositionEvaluation> {
        for p in positions {
            if !(p.size.is_finite() && p.size > 0.0) || !(p.current_price.is_finite() && p.current_price > 0.0) {
                return Err(CoreError::Validation(format!(
                    "position {} has invalid size {} or price {}",
                    p.id, p.size, p.current_price
                )));
            }
        }

        let net: f64 = positions.iter().map(|p| p.signed_notional()).sum();
        let gross: f64 = positions.iter().map(|p| p.signed_notional().abs()).sum();
        let pnl: f64 = positions.iter().map(|p| p.unrealized_pnl).sum();
        let entry: f64 = positions.iter().map(|p| p.entry_notional()).sum();
        let pnl_pct = if entry > 0.0 { pnl / entry * 100.0 } else { 0.0 };

        let ages: Vec<f64> = positions.iter().map(|p| age_hours(p, now)).collect();
        let average_age_hours = if ages.is_empty() {
            0.0
        } else {
            ages.iter().sum::<f64>() / ages.len() as f64
        };

        let f = self.config.fee_rate;
        let s = self.config.slippage_rate;
        let costs = CostEstimates {
            exit: CostEstimate::of(gross * (f + s), gross),
            migrate: CostEstimate::of(gross * f * 0.5, gross),
            convert: CostEstimate::of(gross * (0.5 * f + 0.25 * s), gross),
            unwind: CostEstimate::of(gross * (f + 0.5 * s), gross),
            flatten: CostEstimate::of(net.abs() * (f + s), gross),
        };

        let mut ranked: Vec<PositionRisk> = positions
            .iter()
            .zip(&ages)
            .map(|(p, &age)| {
                let notional = p.signed_notional().abs();
                let share = if gross > 0.0 { notional / gross } else { 0.0 };
                let pnl_pct = p.pnl_pct();
                let loss = (-pnl_pct / 5.0).clamp(0.0, 1.0);
                let staleness = (age / 24.0).clamp(0.0, 1.0);
                PositionRisk {
                    position_id: p.id.clone(),
                    notional,
                    pnl_pct,
                    age_hours: age,
                    risk_score: 0.5 * share + 0.3 * loss + 0.2 * staleness,
                }
            })
            .collect();

        let largest_position = ranked
            .iter()
            .max_by(|a, b| a.notional.total_cmp(&b.notional))
            .cloned();
        ranked.sort_by(|a, b| b.risk_score.total_cmp(&a.risk_score));
        let riskiest_position = ranked.first().cloned();

        Ok(PositionEvaluation {
            old_regime,
            new_regime,
            position_count: positions.len(),
            net_exposure: net,
            gross_exposure: gross,
            unrealized_pnl: pnl,
            pnl_pct,
            average_age_hours,
            compatibility: compatibility(new_regime, net, gross, market.trend_direction),
            costs,
            market: *market,
            largest_position,
            riskiest_position,
            ranked,
            evaluated_at: now,
        })
    }
}

fn age_hours(p: &EnginePosition, now: DateTime<Utc>) -> f64 {
    ((now - p.entry_time).num_milliseconds() as f64 / 3_600_000.0).max(0.0)
}

/// Fit of the book to `regime`, in [0, 1]. An empty book fits anything.
pub fn compatibility(regime: RegimeType, net: f64, gross: f64, trend_direction: i8) -> f64 {
    if gross <= 0.0 {
        return 1.0;
    }
    let bias = net / gross;
    let score = match regime {
        RegimeType::Trending => 0.5 + 0.5 * bias * trend_direction as f64,
        RegimeType::Ranging => 1.0 - bias.abs(),
        RegimeType::Volatile => 0.3 * (1.0 - bias.abs()),
        RegimeType::Uncertain => 0.5,
    };
    score.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PositionSide;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    fn pos(id: &str, side: PositionSide, size: f64, entry: f64, current: f64, hours: i64) -> EnginePosition {
        EnginePosition {
            id: id.into(),
            side,
            size,
            entry_price: entry,
            current_price: current,
            unrealized_pnl: side.sign() * (current - entry) * size,
            entry_time: now() - Duration::hours(hours),
        }
    }

    fn market(direction: i8) -> MarketContext {
        MarketContext {
            price: 100.0,
            trend_strength: 30.0,
            trend_direction: direction,
            volatility: 0.3,
        }
    }

    #[test]
    fn exposure_pnl_and_age() {
        let ev = PositionEvaluator::default();
        let positions = vec![
            pos("a", PositionSide::Long, 2.0, 100.0, 110.0, 2),
            pos("b", PositionSide::Short, 1.0, 100.0, 110.0, 4),
        ];
        let e = ev
            .evaluate_at(&positions, RegimeType::Ranging, RegimeType::Trending, &market(1), now())
            .unwrap();
        assert!((e.net_exposure - 110.0).abs() < 1e-9);
        assert!((e.gross_exposure - 330.0).abs() < 1e-9);
        assert!((e.unrealized_pnl - 10.0).abs() < 1e-9);
        assert!((e.pnl_pct - 10.0 / 300.0 * 100.0).abs() < 1e-9);
        assert!((e.average_age_hours - 3.0).abs() < 1e-9);
        assert_eq!(e.trend_alignment(), 1);
        assert_eq!(e.largest_position.unwrap().position_id, "a");
    }

    #[test]
    fn cost_estimates_are_linear_in_exposure() {
        let ev = PositionEvaluator::default();
        let one = vec![pos("a", PositionSide::Long, 1.0, 100.0, 100.0, 1)];
        let two = vec![pos("a", PositionSide::Long, 2.0, 100.0, 100.0, 1)];
        let e1 = ev.evaluate_at(&one, RegimeType::Trending, RegimeType::Ranging, &market(0), now()).unwrap();
        let e2 = ev.evaluate_at(&two, RegimeType::Trending, RegimeType::Ranging, &market(0), now()).unwrap();
        assert!((e2.costs.exit.amount - 2.0 * e1.costs.exit.amount).abs() < 1e-12);
        assert!((e1.costs.exit.amount - 100.0 * 0.0015).abs() < 1e-12);
        assert!((e1.costs.exit.pct - 0.15).abs() < 1e-9);
        assert!((e1.costs.migrate.pct - 0.05).abs() < 1e-9);
        assert!((e1.costs.convert.pct - 0.0625).abs() < 1e-9);
        assert!((e1.costs.unwind.pct - 0.125).abs() < 1e-9);
    }

    #[test]
    fn compatibility_by_regime() {
        assert!((compatibility(RegimeType::Trending, 100.0, 100.0, 1) - 1.0).abs() < 1e-12);
        assert!((compatibility(RegimeType::Trending, -100.0, 100.0, 1)).abs() < 1e-12);
        assert!((compatibility(RegimeType::Ranging, 0.0, 200.0, 1) - 1.0).abs() < 1e-12);
        assert!((compatibility(RegimeType::Ranging, 200.0, 200.0, 1)).abs() < 1e-12);
        assert!((compatibility(RegimeType::Volatile, 0.0, 200.0, 0) - 0.3).abs() < 1e-12);
        assert!((compatibility(RegimeType::Uncertain, 50.0, 200.0, 0) - 0.5).abs() < 1e-12);
        assert!((compatibility(RegimeType::Volatile, 0.0, 0.0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn riskiest_position_ranks_first() {
        let ev = PositionEvaluator::default();
        let positions = vec![
            pos("fresh", PositionSide::Long, 1.0, 100.0, 101.0, 1),
            pos("bleeding", PositionSide::Long, 1.0, 100.0, 94.0, 20),
        ];
        let e = ev
            .evaluate_at(&positions, RegimeType::Trending, RegimeType::Ranging, &market(1), now())
            .unwrap();
        assert_eq!(e.riskiest_position.unwrap().position_id, "bleeding");
        assert_eq!(e.ranked.len(), 2);
    }

    #[test]
    fn evaluation_is_idempotent() {
        let ev = PositionEvaluator::default();
        let positions = vec![
            pos("a", PositionSide::Long, 1.5, 100.0, 97.0, 6),
            pos("b", PositionSide::Short, 0.5, 95.0, 97.0, 3),
        ];
        let m = market(-1);
        let first = ev
            .evaluate_at(&positions, RegimeType::Trending, RegimeType::Volatile, &m, now())
            .unwrap();
        let second = ev
            .evaluate_at(&positions, RegimeType::Trending, RegimeType::Volatile, &m, now())
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_position_is_rejected() {
        let ev = PositionEvaluator::default();
        let mut p = pos("a", PositionSide::Long, 1.0, 100.0, 100.0, 1);
        p.size = f64::NAN;
        let err = ev
            .evaluate_at(&[p], RegimeType::Trending, RegimeType::Ranging, &market(0), now())
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
