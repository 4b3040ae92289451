// =============================================================================
// Execution Venue - collaborator contract and paper simulation
// =============================================================================
//
// The transition executor's step handlers are the only callers. A venue
// reports success with a realised price and cost, or a categorised
// `CoreError` that drives the executor's retry policy.
// =============================================================================

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::runtime_config::EvaluatorConfig;
use crate::types::PositionSide;

// ---------------------------------------------------------------------------
// Instructions & fills
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VenueInstruction {
    /// Market-close `size` of a position.
    Close {
        position_id: String,
        side: PositionSide,
        size: f64,
        reference_price: f64,
    },
    /// Re-price the resting order attached to a position.
    Modify { position_id: String, price: f64 },
    /// New order; market when `price` is `None`.
    Place {
        side: PositionSide,
        size: f64,
        price: Option<f64>,
        reference_price: f64,
    },
    /// Place or move a stop for a position.
    SetStop {
        position_id: String,
        side: PositionSide,
        size: f64,
        stop_price: f64,
    },
    /// Re-book a position under another engine (hedge re-tagging).
    Transfer {
        position_id: String,
        size: f64,
        reference_price: f64,
    },
}

impl VenueInstruction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Close { .. } => "close",
            Self::Modify { .. } => "modify",
            Self::Place { .. } => "place",
            Self::SetStop { .. } => "set_stop",
            Self::Transfer { .. } => "transfer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VenueFill {
    pub price: f64,
    /// Fees plus slippage, in quote currency.
    pub cost: f64,
}

/// Abstract place / modify / close capability.
///
/// Implementations must be at-most-once per instruction: an `Err`, or a call
/// dropped by the executor's step timeout, means nothing was filled. The
/// executor retries on that basis.
#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn execute(&self, instruction: &VenueInstruction) -> CoreResult<VenueFill>;
}

// ---------------------------------------------------------------------------
// PaperVenue
// ---------------------------------------------------------------------------

/// Simulated venue: immediate fills charged with fee + slippage.
///
/// Failures can be queued with [`PaperVenue::fail_next`]; each queued error is
/// returned by one subsequent call, in order.
pub struct PaperVenue {
    costs: EvaluatorConfig,
    injected: RwLock<VecDeque<CoreError>>,
    fills: RwLock<u64>,
}

impl PaperVenue {
    pub fn new(costs: EvaluatorConfig) -> Self {
        Self {
            costs,
            injected: RwLock::new(VecDeque::new()),
            fills: RwLock::new(0),
        }
    }

    pub fn fail_next(&self, error: CoreError) {
        self.injected.write().push_back(error);
    }

    pub fn fill_count(&self) -> u64 {
        *self.fills.read()
    }

    fn market_fill(&self, side: PositionSide, size: f64, reference: f64, closing: bool) -> VenueFill {
        let f = self.costs.fee_rate;
        let s = self.costs.slippage_rate;
        // Closing a long sells, opening a long buys.
        let adverse = if closing { -side.sign() } else { side.sign() };
        VenueFill {
            price: reference * (1.0 + adverse * s),
            cost: size * reference * (f + s),
        }
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn execute(&self, instruction: &VenueInstruction) -> CoreResult<VenueFill> {
        let injected = self.injected.write().pop_front();
        if let Some(err) = injected {
            debug!(instruction = instruction.label(), error = %err, "paper venue injected failure");
            return Err(err);
        }

        let fill = match instruction {
            VenueInstruction::Close {
                side,
                size,
                reference_price,
                ..
            } => self.market_fill(*side, *size, *reference_price, true),
            VenueInstruction::Place {
                side,
                size,
                price,
                reference_price,
            } => match price {
                Some(limit) => VenueFill {
                    price: *limit,
                    cost: size * limit * self.costs.fee_rate,
                },
                None => self.market_fill(*side, *size, *reference_price, false),
            },
            VenueInstruction::Modify { price, .. } => VenueFill { price: *price, cost: 0.0 },
            VenueInstruction::SetStop { stop_price, .. } => VenueFill {
                price: *stop_price,
                cost: 0.0,
            },
            VenueInstruction::Transfer {
                size, reference_price, ..
            } => VenueFill {
                price: *reference_price,
                cost: size * reference_price * (0.5 * self.costs.fee_rate + 0.25 * self.costs.slippage_rate),
            },
        };

        *self.fills.write() += 1;
        let sim_order_id = Uuid::new_v4().to_string();
        info!(
            instruction = instruction.label(),
            price = fill.price,
            cost = fill.cost,
            sim_order_id = %sim_order_id,
            "paper fill"
        );
        Ok(fill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_charged_fee_and_slippage() {
        let venue = PaperVenue::new(EvaluatorConfig::default());
        let fill = venue
            .execute(&VenueInstruction::Close {
                position_id: "p".into(),
                side: PositionSide::Long,
                size: 2.0,
                reference_price: 100.0,
            })
            .await
            .unwrap();
        assert!((fill.cost - 200.0 * 0.0015).abs() < 1e-12);
        assert!(fill.price < 100.0);
        assert_eq!(venue.fill_count(), 1);
    }

    #[tokio::test]
    async fn stops_are_free() {
        let venue = PaperVenue::new(EvaluatorConfig::default());
        let fill = venue
            .execute(&VenueInstruction::SetStop {
                position_id: "p".into(),
                side: PositionSide::Short,
                size: 1.0,
                stop_price: 105.0,
            })
            .await
            .unwrap();
        assert_eq!(fill.cost, 0.0);
        assert_eq!(fill.price, 105.0);
    }

    #[tokio::test]
    async fn injected_failures_are_consumed_in_order() {
        let venue = PaperVenue::new(EvaluatorConfig::default());
        venue.fail_next(CoreError::Network("reset".into()));
        let instr = VenueInstruction::Modify {
            position_id: "p".into(),
            price: 1.0,
        };
        assert!(matches!(venue.execute(&instr).await, Err(CoreError::Network(_))));
        assert!(venue.execute(&instr).await.is_ok());
    }
}
