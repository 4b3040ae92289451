// =============================================================================
// REST API Endpoints - Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Read endpoints are public; control
// and config endpoints require a valid Bearer token via `AuthBearer`.
//
// CORS is permissive; the service is meant to sit behind a private network.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::error::{CoreError, ErrorCategory};
use crate::notify::SubscriberStats;
use crate::regime::{RegimeMetrics, RegimeReport, RegimeSignal};
use crate::runtime_config::ConfigPatch;
use crate::transition::{
    ActiveTransition, PolicyKind, PolicyPerformance, TransitionDecision, TransitionMetrics, TransitionRecord,
};
use crate::types::{EnginePosition, EngineType, RegimeChange, RegimeType};

const DEFAULT_LIMIT: usize = 50;

// =============================================================================
// Router construction
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/regime", get(regime))
        .route("/api/v1/regime/history", get(regime_history))
        .route("/api/v1/regime/report", get(regime_report))
        .route("/api/v1/transitions", get(transitions))
        .route("/api/v1/positions", get(positions))
        .route("/api/v1/notifications", get(notifications))
        .route("/api/v1/errors", get(errors))
        .route("/api/v1/config", get(get_config))
        // ── Authenticated ───────────────────────────────────────────
        .route("/api/v1/config", post(patch_config))
        .route("/api/v1/control/emergency-stop", post(control_emergency_stop))
        .route("/api/v1/control/manual-override", post(control_manual_override))
        .route("/api/v1/control/cancel-transition", post(control_cancel_transition))
        // ── Middleware & State ───────────────────────────────────────
        .layer(cors)
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    #[serde(default)]
    limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

/// Map a core error onto an HTTP status and a JSON body.
fn error_response(err: &CoreError) -> Response {
    let status = match err.category() {
        ErrorCategory::Configuration | ErrorCategory::Validation => StatusCode::BAD_REQUEST,
        ErrorCategory::Conflict => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = serde_json::json!({
        "error": err.to_string(),
        "category": err.category(),
    });
    (status, Json(body)).into_response()
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.health())
}

// =============================================================================
// Regime
// =============================================================================

#[derive(Serialize)]
struct RegimeResponse {
    regime: Option<RegimeType>,
    signal: Option<RegimeSignal>,
    metrics: Option<RegimeMetrics>,
    signals_recorded: usize,
}

async fn regime(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let detector = &state.regime_detector;
    Json(RegimeResponse {
        regime: detector.current_regime(),
        signal: detector.last_signal(),
        metrics: detector.last_metrics(),
        signals_recorded: detector.history_len(),
    })
}

async fn regime_history(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    Json(state.regime_detector.history(q.limit()))
}

async fn regime_report(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let window = state.runtime_config.read().regime.false_signal_window;
    let signals = state.regime_detector.history(usize::MAX);
    Json(RegimeReport::from_signals(&signals, window))
}

// =============================================================================
// Transitions
// =============================================================================

#[derive(Serialize)]
struct PolicyStats {
    policy: PolicyKind,
    performance: PolicyPerformance,
}

#[derive(Serialize)]
struct TransitionsResponse {
    active: Option<ActiveTransition>,
    metrics: TransitionMetrics,
    emergency_stop: bool,
    manual_override: bool,
    history: Vec<TransitionRecord>,
    recent_decisions: Vec<TransitionDecision>,
    policies: Vec<PolicyStats>,
}

async fn transitions(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    let manager = &state.transition_manager;
    let policies = [PolicyKind::Conservative, PolicyKind::Aggressive, PolicyKind::Adaptive]
        .into_iter()
        .filter_map(|policy| {
            manager
                .policy_performance(policy)
                .map(|performance| PolicyStats { policy, performance })
        })
        .collect();
    let recent_decisions = {
        let decisions = state.recent_decisions.read();
        let skip = decisions.len().saturating_sub(q.limit());
        decisions[skip..].to_vec()
    };

    Json(TransitionsResponse {
        active: manager.active(),
        metrics: manager.metrics(),
        emergency_stop: manager.is_emergency_stopped(),
        manual_override: manager.is_manual_override(),
        history: manager.history(q.limit()),
        recent_decisions,
        policies,
    })
}

// =============================================================================
// Positions
// =============================================================================

#[derive(Serialize)]
struct PositionView {
    engine: EngineType,
    #[serde(flatten)]
    position: EnginePosition,
}

#[derive(Serialize)]
struct PositionsResponse {
    active_engine: Option<EngineType>,
    positions: Vec<PositionView>,
}

async fn positions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let positions = state
        .engines
        .all_positions()
        .into_iter()
        .map(|(engine, position)| PositionView { engine, position })
        .collect();
    Json(PositionsResponse {
        active_engine: state.engines.active().map(|e| e.engine_type()),
        positions,
    })
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Serialize)]
struct NotificationsResponse {
    published: u64,
    subscribers: Vec<SubscriberStats>,
    recent: Vec<RegimeChange>,
}

async fn notifications(State(state): State<Arc<AppState>>, Query(q): Query<LimitQuery>) -> impl IntoResponse {
    Json(NotificationsResponse {
        published: state.event_bus.published(),
        subscribers: state.event_bus.stats(),
        recent: state.event_bus.recent(q.limit()),
    })
}

async fn errors(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.recent_errors.read().clone())
}

// =============================================================================
// Config
// =============================================================================

async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.runtime_config.read().clone())
}

async fn patch_config(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(patch): Json<ConfigPatch>,
) -> Response {
    if patch.is_empty() {
        return Json(state.runtime_config.read().clone()).into_response();
    }
    match state.apply_config_patch(&patch) {
        Ok(updated) => Json(updated).into_response(),
        Err(e) => {
            warn!(error = %e, "config patch rejected");
            error_response(&e)
        }
    }
}

// =============================================================================
// Control endpoints (authenticated)
// =============================================================================

#[derive(Deserialize)]
struct ToggleRequest {
    enabled: bool,
}

#[derive(Serialize)]
struct ControlResponse {
    emergency_stop: bool,
    manual_override: bool,
    transitioning: bool,
    message: String,
}

fn control_response(state: &AppState, message: impl Into<String>) -> Json<ControlResponse> {
    Json(ControlResponse {
        emergency_stop: state.transition_manager.is_emergency_stopped(),
        manual_override: state.transition_manager.is_manual_override(),
        transitioning: state.transition_manager.is_transitioning(),
        message: message.into(),
    })
}

async fn control_emergency_stop(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    state.transition_manager.set_emergency_stop(req.enabled);
    state.increment_version();
    if req.enabled {
        warn!("Emergency stop ENGAGED via API");
    } else {
        info!("Emergency stop released via API");
    }
    let message = if req.enabled {
        "Emergency stop engaged, active transition cancelled"
    } else {
        "Emergency stop released"
    };
    control_response(&state, message)
}

async fn control_manual_override(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<ToggleRequest>,
) -> impl IntoResponse {
    state.transition_manager.set_manual_override(req.enabled);
    state.increment_version();
    info!(enabled = req.enabled, "Manual override changed via API");
    let message = if req.enabled {
        "Manual override on, automatic transitions suspended"
    } else {
        "Manual override off"
    };
    control_response(&state, message)
}

async fn control_cancel_transition(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> Response {
    if state.transition_manager.cancel_active_transition() {
        state.increment_version();
        info!("Active transition cancellation requested via API");
        control_response(&state, "Cancellation requested").into_response()
    } else {
        let body = serde_json::json!({ "error": "no transition in progress" });
        (StatusCode::NOT_FOUND, Json(body)).into_response()
    }
}

// =============================================================================
// Tests
// =============================================================================
