// =============================================================================
// Trading Engines - collaborator contract and paper implementation
// =============================================================================
//
// The core only sees an engine's type, its open positions and whether it is
// active. The transition executor additionally moves positions through the
// mutation hooks below; it never inspects strategy internals.
//
// Thread-safety: each engine guards its position list with one
// `parking_lot::RwLock`.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{EngineType, EnginePosition, PositionSide};

/// Contract implemented by grid and trend engines.
pub trait TradingEngine: Send + Sync {
    fn engine_type(&self) -> EngineType;

    fn current_positions(&self) -> Vec<EnginePosition>;

    fn is_active(&self) -> bool;

    fn set_active(&self, active: bool);

    fn position(&self, id: &str) -> Option<EnginePosition> {
        self.current_positions().into_iter().find(|p| p.id == id)
    }

    /// Close `size` of a position at `price`. Returns the realised P&L.
    fn reduce_position(&self, id: &str, size: f64, price: f64) -> CoreResult<f64>;

    /// Remove a position without closing it (hand-over to another engine).
    fn release_position(&self, id: &str) -> CoreResult<EnginePosition>;

    fn adopt_position(&self, position: EnginePosition);

    fn open_position(&self, side: PositionSide, size: f64, price: f64) -> EnginePosition;
}

// ---------------------------------------------------------------------------
// PaperEngine
// ---------------------------------------------------------------------------

/// In-memory engine used by the host binary and tests.
pub struct PaperEngine {
    engine_type: EngineType,
    active: AtomicBool,
    open: RwLock<Vec<EnginePosition>>,
    realized_pnl: RwLock<f64>,
}

/// Remaining size below which a position counts as closed.
const DUST: f64 = 1e-9;

impl PaperEngine {
    pub fn new(engine_type: EngineType, active: bool) -> Self {
        Self {
            engine_type,
            active: AtomicBool::new(active),
            open: RwLock::new(Vec::new()),
            realized_pnl: RwLock::new(0.0),
        }
    }

    /// Re-mark every open position at `price`.
    pub fn mark_price(&self, price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut() {
            pos.current_price = price;
            pos.unrealized_pnl = pos.side.sign() * (price - pos.entry_price) * pos.size;
        }
    }

    pub fn realized_pnl(&self) -> f64 {
        *self.realized_pnl.read()
    }
}

impl TradingEngine for PaperEngine {
    fn engine_type(&self) -> EngineType {
        self.engine_type
    }

    fn current_positions(&self) -> Vec<EnginePosition> {
        self.open.read().clone()
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        let was = self.active.swap(active, Ordering::SeqCst);
        if was != active {
            info!(engine = %self.engine_type, active, "engine activity changed");
        }
    }

    fn reduce_position(&self, id: &str, size: f64, price: f64) -> CoreResult<f64> {
        let mut open = self.open.write();
        let idx = open
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| CoreError::Position(format!("position {id} not found in {} engine", self.engine_type)))?;

        let pos = &mut open[idx];
        let closed = size.min(pos.size);
        let pnl = pos.side.sign() * (price - pos.entry_price) * closed;
        pos.size -= closed;
        pos.current_price = price;
        pos.unrealized_pnl = pos.side.sign() * (price - pos.entry_price) * pos.size;

        if pos.size <= DUST {
            let removed = open.remove(idx);
            info!(id = %removed.id, price, realized_pnl = pnl, "position closed");
        } else {
            debug!(id, closed, remaining = pos.size, "position reduced");
        }
        drop(open);

        *self.realized_pnl.write() += pnl;
        Ok(pnl)
    }

    fn release_position(&self, id: &str) -> CoreResult<EnginePosition> {
        let mut open = self.open.write();
        let idx = open
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| CoreError::Position(format!("position {id} not found in {} engine", self.engine_type)))?;
        Ok(open.remove(idx))
    }

    fn adopt_position(&self, position: EnginePosition) {
        debug!(id = %position.id, engine = %self.engine_type, "position adopted");
        self.open.write().push(position);
    }

    fn open_position(&self, side: PositionSide, size: f64, price: f64) -> EnginePosition {
        let pos = EnginePosition {
            id: Uuid::new_v4().to_string(),
            side,
            size,
            entry_price: price,
            current_price: price,
            unrealized_pnl: 0.0,
            entry_time: Utc::now(),
        };
        info!(id = %pos.id, engine = %self.engine_type, side = %side, size, price, "position opened");
        self.open.write().push(pos.clone());
        pos
    }
}

impl std::fmt::Debug for PaperEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PaperEngine")
            .field("engine_type", &self.engine_type)
            .field("active", &self.is_active())
            .field("open_positions", &self.open.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The engines a host runs, one per type.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: Vec<Arc<dyn TradingEngine>>,
}

impl EngineRegistry {
    pub fn new(engines: Vec<Arc<dyn TradingEngine>>) -> Self {
        Self { engines }
    }

    pub fn get(&self, engine_type: EngineType) -> Option<Arc<dyn TradingEngine>> {
        self.engines.iter().find(|e| e.engine_type() == engine_type).cloned()
    }

    /// First active engine.
    pub fn active(&self) -> Option<Arc<dyn TradingEngine>> {
        self.engines.iter().find(|e| e.is_active()).cloned()
    }

    pub fn all_positions(&self) -> Vec<(EngineType, EnginePosition)> {
        self.engines
            .iter()
            .flat_map(|e| {
                let t = e.engine_type();
                e.current_positions().into_iter().map(move |p| (t, p))
            })
            .collect()
    }

    pub fn engines(&self) -> &[Arc<dyn TradingEngine>] {
        &self.engines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_mark_and_partial_close() {
        let engine = PaperEngine::new(EngineType::Grid, true);
        let pos = engine.open_position(PositionSide::Long, 2.0, 100.0);
        engine.mark_price(110.0);
        assert!((engine.current_positions()[0].unrealized_pnl - 20.0).abs() < 1e-12);

        let pnl = engine.reduce_position(&pos.id, 1.0, 110.0).unwrap();
        assert!((pnl - 10.0).abs() < 1e-12);
        assert!((engine.current_positions()[0].size - 1.0).abs() < 1e-12);

        engine.reduce_position(&pos.id, 1.0, 105.0).unwrap();
        assert!(engine.current_positions().is_empty());
        assert!((engine.realized_pnl() - 15.0).abs() < 1e-12);
    }

    #[test]
    fn unknown_position_is_a_position_error() {
        let engine = PaperEngine::new(EngineType::Trend, false);
        let err = engine.reduce_position("nope", 1.0, 1.0).unwrap_err();
        assert!(matches!(err, CoreError::Position(_)));
    }

    #[test]
    fn hand_over_between_engines() {
        let grid = PaperEngine::new(EngineType::Grid, true);
        let trend = PaperEngine::new(EngineType::Trend, false);
        let pos = grid.open_position(PositionSide::Short, 1.0, 50.0);
        let moved = grid.release_position(&pos.id).unwrap();
        trend.adopt_position(moved);
        assert!(grid.current_positions().is_empty());
        assert_eq!(trend.position(&pos.id).unwrap().side, PositionSide::Short);
    }

    #[test]
    fn registry_finds_active_engine() {
        let grid: Arc<dyn TradingEngine> = Arc::new(PaperEngine::new(EngineType::Grid, false));
        let trend: Arc<dyn TradingEngine> = Arc::new(PaperEngine::new(EngineType::Trend, true));
        let registry = EngineRegistry::new(vec![grid, trend]);
        assert_eq!(registry.active().unwrap().engine_type(), EngineType::Trend);
        assert!(registry.get(EngineType::Grid).is_some());
    }
}
