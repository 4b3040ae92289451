// =============================================================================
// Central Application State
// =============================================================================
//
// Ties the core components together for the host binary and the HTTP API.
// Every component owns its own lock; AppState only holds Arcs and never
// holds one component's lock while calling into another.
//
// Per bar (`on_bar`):
//   bar history -> mark engines -> detect -> publish change -> evaluate
// Execution of an actionable decision is left to the caller so it can run
// on a background task (`run_transition`).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{EngineRegistry, PaperEngine, TradingEngine};
use crate::error::{CoreError, CoreResult};
use crate::execution::PaperVenue;
use crate::market_data::{Candle, CandleBuffer};
use crate::notify::EventBus;
use crate::persistence::{JsonFileStore, SnapshotScheduler, StateSnapshot};
use crate::regime::{RegimeDetector, RegimeSignal};
use crate::runtime_config::{ConfigPatch, RuntimeConfig};
use crate::transition::{TransitionDecision, TransitionManager, TransitionRecord};
use crate::types::{EngineType, MarketContext, RegimeChange, RegimeType};

// =============================================================================
// Error Record
// =============================================================================

/// A recorded error event for the error log endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// Error category, when the error came from the core.
    pub category: Option<String>,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// What one bar produced.
#[derive(Debug, Clone, Default)]
pub struct BarOutcome {
    /// `None` while the history is still warming up.
    pub signal: Option<RegimeSignal>,
    pub change: Option<RegimeChange>,
    pub decision: Option<TransitionDecision>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub symbol: String,
    pub bars: usize,
    pub regime: Option<RegimeType>,
    pub active_engine: Option<EngineType>,
    pub transitioning: bool,
    pub emergency_stop: bool,
    pub manual_override: bool,
    pub subscribers: usize,
    pub state_version: u64,
    pub snapshots_saved: u64,
    pub snapshot_failures: u64,
}

// =============================================================================
// AppState
// =============================================================================

const MAX_RECENT_ERRORS: usize = 50;
const MAX_RECENT_DECISIONS: usize = 100;

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Bumped on every meaningful mutation.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    pub candle_buffer: Arc<CandleBuffer>,
    pub regime_detector: Arc<RegimeDetector>,
    pub transition_manager: Arc<TransitionManager>,

    // ── Collaborators ───────────────────────────────────────────────────
    pub grid_engine: Arc<PaperEngine>,
    pub trend_engine: Arc<PaperEngine>,
    pub engines: EngineRegistry,
    pub venue: Arc<PaperVenue>,

    pub event_bus: Arc<EventBus>,
    pub snapshots: Arc<SnapshotScheduler>,

    pub recent_decisions: RwLock<Vec<TransitionDecision>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Bearer token for the control routes. `None` rejects them all.
    pub admin_token: Option<String>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Build every component from `config`. The grid engine starts active.
    pub fn new(config: RuntimeConfig) -> Self {
        let venue = Arc::new(PaperVenue::new(config.evaluator));
        let grid_engine = Arc::new(PaperEngine::new(EngineType::Grid, true));
        let trend_engine = Arc::new(PaperEngine::new(EngineType::Trend, false));
        let engines = EngineRegistry::new(vec![
            grid_engine.clone() as Arc<dyn TradingEngine>,
            trend_engine.clone() as Arc<dyn TradingEngine>,
        ]);
        let store = Arc::new(JsonFileStore::new(&config.persistence.state_path));

        Self {
            state_version: AtomicU64::new(1),
            candle_buffer: Arc::new(CandleBuffer::new(config.bar_buffer_capacity)),
            regime_detector: Arc::new(RegimeDetector::new(config.regime.clone())),
            transition_manager: Arc::new(TransitionManager::new(&config, venue.clone())),
            grid_engine,
            trend_engine,
            engines,
            venue,
            event_bus: Arc::new(EventBus::new(&config.notify)),
            snapshots: Arc::new(SnapshotScheduler::new(store, config.persistence.save_interval_secs)),
            recent_decisions: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            runtime_config: Arc::new(RwLock::new(config)),
            admin_token: None,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error Logging ───────────────────────────────────────────────────

    pub fn push_error(&self, msg: String) {
        self.push_error_with_category(msg, None);
    }

    pub fn push_core_error(&self, err: &CoreError) {
        self.push_error_with_category(err.to_string(), Some(format!("{:?}", err.category())));
    }

    fn push_error_with_category(&self, message: String, category: Option<String>) {
        let record = ErrorRecord {
            message,
            category,
            at: Utc::now().to_rfc3339(),
        };

        let mut errors = self.recent_errors.write();
        errors.push(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);

        self.increment_version();
    }

    // ── Decision Audit ──────────────────────────────────────────────────

    pub fn push_decision(&self, decision: TransitionDecision) {
        let mut decisions = self.recent_decisions.write();
        decisions.push(decision);
        while decisions.len() > MAX_RECENT_DECISIONS {
            decisions.remove(0);
        }
        drop(decisions);

        self.increment_version();
    }

    // ── Bar Pipeline ────────────────────────────────────────────────────

    pub fn symbol(&self) -> String {
        self.runtime_config.read().symbol.clone()
    }

    pub fn active_engine(&self) -> Arc<dyn TradingEngine> {
        self.engines
            .active()
            .unwrap_or_else(|| self.grid_engine.clone() as Arc<dyn TradingEngine>)
    }

    /// Market context from the detector's latest metrics.
    pub fn market_context(&self) -> Option<MarketContext> {
        self.regime_detector.last_metrics().map(|m| MarketContext {
            price: m.price,
            trend_strength: m.adx,
            trend_direction: m.trend_direction,
            volatility: m.volatility,
        })
    }

    /// Feed one closed bar through detection and transition evaluation.
    pub fn on_bar(&self, candle: Candle) -> CoreResult<BarOutcome> {
        let (symbol, capacity) = {
            let cfg = self.runtime_config.read();
            (cfg.symbol.clone(), cfg.bar_buffer_capacity)
        };

        let close = candle.close;
        if !self.candle_buffer.push(&symbol, candle) {
            return Ok(BarOutcome::default());
        }
        self.grid_engine.mark_price(close);
        self.trend_engine.mark_price(close);

        let bars = self.candle_buffer.recent(&symbol, capacity);
        let (signal, change) = match self.regime_detector.detect_with_change(&bars) {
            Ok(out) => out,
            Err(CoreError::InsufficientData { required, available }) => {
                debug!(required, available, "warming up");
                return Ok(BarOutcome::default());
            }
            Err(e) => return Err(e),
        };
        self.increment_version();

        let Some(change) = change else {
            return Ok(BarOutcome {
                signal: Some(signal),
                ..Default::default()
            });
        };

        self.event_bus.publish(&change);

        let from = self.active_engine();
        let market = self.market_context().unwrap_or(MarketContext {
            price: close,
            trend_strength: 0.0,
            trend_direction: 0,
            volatility: signal.volatility,
        });
        let decision = self.transition_manager.evaluate_transition(
            &change,
            from.engine_type(),
            &from.current_positions(),
            &market,
        )?;
        info!(
            from = %change.old_regime,
            to = %change.new_regime,
            action = %decision.action,
            reason = %decision.reason,
            "transition evaluated"
        );
        self.push_decision(decision.clone());

        Ok(BarOutcome {
            signal: Some(signal),
            change: Some(change),
            decision: Some(decision),
        })
    }

    /// Execute an actionable decision between the engines its plan names.
    pub async fn run_transition(&self, decision: &TransitionDecision) -> CoreResult<TransitionRecord> {
        let plan = decision
            .plan
            .as_ref()
            .ok_or_else(|| CoreError::Validation("decision carries no plan".into()))?;
        let from = self
            .engines
            .get(plan.from_engine)
            .ok_or_else(|| CoreError::Configuration(format!("no {} engine registered", plan.from_engine)))?;
        let to = self
            .engines
            .get(plan.to_engine)
            .ok_or_else(|| CoreError::Configuration(format!("no {} engine registered", plan.to_engine)))?;

        let result = self.transition_manager.execute_transition(decision, from, to).await;
        match &result {
            Ok(record) => {
                if let Some(err) = &record.error {
                    self.push_error(format!("transition {}: {err}", record.id));
                }
            }
            Err(e) => self.push_core_error(e),
        }
        self.increment_version();
        result
    }

    // ── Configuration ───────────────────────────────────────────────────

    /// Validate and apply a partial update, then push the result into the
    /// components. Returns the new configuration.
    pub fn apply_config_patch(&self, patch: &ConfigPatch) -> CoreResult<RuntimeConfig> {
        let updated = {
            let mut cfg = self.runtime_config.write();
            cfg.apply_patch(patch)?;
            cfg.clone()
        };
        self.regime_detector.update_config(updated.regime.clone());
        self.transition_manager.update_config(&updated);
        self.increment_version();
        info!("runtime config patched");
        Ok(updated)
    }

    // ── Persistence ─────────────────────────────────────────────────────

    pub fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot::new(
            self.symbol(),
            self.regime_detector.snapshot(),
            self.transition_manager.snapshot(),
        )
    }

    pub fn restore(&self, snapshot: StateSnapshot) {
        self.regime_detector.restore(snapshot.detector);
        self.transition_manager.restore(&snapshot.manager);
        self.increment_version();
    }

    /// Trigger a background save if one is due.
    pub fn maybe_snapshot(&self) -> bool {
        self.snapshots.maybe_save(|| self.state_snapshot()).is_some()
    }

    // ── Health ──────────────────────────────────────────────────────────

    pub fn health(&self) -> HealthReport {
        let symbol = self.symbol();
        let bars = self.candle_buffer.count(&symbol);
        HealthReport {
            status: if self.transition_manager.is_emergency_stopped() {
                "halted"
            } else {
                "ok"
            },
            uptime_secs: self.start_time.elapsed().as_secs(),
            bars,
            symbol,
            regime: self.regime_detector.current_regime(),
            active_engine: self.engines.active().map(|e| e.engine_type()),
            transitioning: self.transition_manager.is_transitioning(),
            emergency_stop: self.transition_manager.is_emergency_stopped(),
            manual_override: self.transition_manager.is_manual_override(),
            subscribers: self.event_bus.subscriber_count(),
            state_version: self.current_state_version(),
            snapshots_saved: self.snapshots.saves(),
            snapshot_failures: self.snapshots.failures(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::fixtures::{chop, uptrend};
    use crate::runtime_config::{RegimePatch, TransitionPatch};
    use crate::types::PositionSide;

    fn state() -> AppState {
        let mut cfg = RuntimeConfig::default();
        cfg.persistence.state_path = std::env::temp_dir()
            .join(format!("regime-shift-app-{}", uuid::Uuid::new_v4()))
            .join("state.json")
            .to_string_lossy()
            .into_owned();
        cfg.transition.transition_cooldown_secs = 0;
        cfg.executor.inter_step_pause_ms = 0;
        AppState::new(cfg)
    }

    #[test]
    fn warm_up_produces_no_signal() {
        let s = state();
        let out = s.on_bar(uptrend(1, 0.01).remove(0)).unwrap();
        assert!(out.signal.is_none());
        assert_eq!(s.health().bars, 1);
    }

    #[tokio::test]
    async fn ranging_then_trending_switches_engines() {
        let mut cfg = RuntimeConfig::default();
        cfg.persistence.state_path = std::env::temp_dir()
            .join(format!("regime-shift-app-{}", uuid::Uuid::new_v4()))
            .join("state.json")
            .to_string_lossy()
            .into_owned();
        cfg.transition.transition_cooldown_secs = 0;
        cfg.transition.min_confidence = 0.6;
        cfg.transition.max_daily_transitions = 100;
        for p in &mut cfg.policies {
            p.max_daily_applications = 100;
        }
        cfg.executor.inter_step_pause_ms = 0;
        let s = AppState::new(cfg);
        let mut sub = s.event_bus.subscribe("test");

        let mut candles = chop(120, 0.5);
        let scale = candles[119].close / 100.0;
        candles.extend(uptrend(120, 0.01).into_iter().enumerate().map(|(i, mut c)| {
            c.open *= scale;
            c.high *= scale;
            c.low *= scale;
            c.close *= scale;
            c.open_time = (120 + i as i64) * 60_000;
            c
        }));

        let mut executed = 0;
        for (i, bar) in candles.into_iter().enumerate() {
            let out = s.on_bar(bar).unwrap();
            if i == 119 {
                assert_eq!(s.regime_detector.current_regime(), Some(RegimeType::Ranging));
            }
            if let Some(decision) = out.decision {
                // An empty book always gets a plain engine switch.
                assert_eq!(decision.action, crate::transition::TransitionActionType::Switch);
                let record = s.run_transition(&decision).await.unwrap();
                assert!(record.success);
                executed += 1;
            }
        }

        assert!(executed >= 1);
        assert_eq!(sub.receiver.recv().await.unwrap().old_regime, RegimeType::Ranging);
        assert_eq!(s.regime_detector.current_regime(), Some(RegimeType::Trending));
        assert!(s.trend_engine.is_active());
        assert!(!s.grid_engine.is_active());
        assert_eq!(s.health().active_engine, Some(EngineType::Trend));
        assert_eq!(s.transition_manager.metrics().total_transitions, executed);
    }

    #[test]
    fn config_patch_reaches_components() {
        let s = state();
        let patch = ConfigPatch {
            regime: Some(RegimePatch {
                confirmation_bars: Some(5),
                ..Default::default()
            }),
            transition: Some(TransitionPatch {
                max_daily_transitions: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        s.apply_config_patch(&patch).unwrap();
        assert_eq!(s.regime_detector.config().confirmation_bars, 5);
        assert_eq!(s.transition_manager.config().max_daily_transitions, 2);
    }

    #[test]
    fn snapshot_restores_into_fresh_state() {
        let s = state();
        for bar in uptrend(80, 0.01) {
            s.on_bar(bar).unwrap();
        }
        s.grid_engine.open_position(PositionSide::Long, 1.0, 100.0);
        s.transition_manager.set_manual_override(true);
        let snap = s.state_snapshot();

        let fresh = state();
        fresh.restore(snap);
        assert_eq!(fresh.regime_detector.current_regime(), s.regime_detector.current_regime());
        assert_eq!(fresh.regime_detector.history_len(), s.regime_detector.history_len());
        assert!(fresh.transition_manager.is_manual_override());
    }
}
