// =============================================================================
// Regime Shift - Main Entry Point
// =============================================================================
//
// Replays closed bars from a JSON-lines file through detection and
// transition evaluation, or idles with the HTTP surface up until Ctrl-C when
// no bar file is given. Transitions execute on background tasks so detection
// never waits on them.
// =============================================================================

use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use regime_shift::api;
use regime_shift::app_state::AppState;
use regime_shift::market_data::{self, Candle};
use regime_shift::runtime_config::RuntimeConfig;
use regime_shift::CoreError;

const DEFAULT_CONFIG_PATH: &str = "regime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Regime Shift starting up");

    let config_path = std::env::var("REGIME_CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, path = %config_path, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });
    if let Err(e) = config.validate() {
        warn!(error = %e, "Config failed validation, using defaults");
        config = RuntimeConfig::default();
    }
    if let Ok(addr) = std::env::var("REGIME_BIND_ADDR") {
        config.api.bind_addr = addr;
    }
    info!(
        symbol = %config.symbol,
        policy = %config.transition.active_policy,
        min_confidence = config.transition.min_confidence,
        "Configuration loaded"
    );

    // ── 2. Shared state ──────────────────────────────────────────────────
    let admin_token = std::env::var("REGIME_ADMIN_TOKEN").ok();
    if admin_token.as_deref().map_or(true, str::is_empty) {
        warn!("REGIME_ADMIN_TOKEN is not set, control endpoints will reject every request");
    }
    let state = Arc::new(AppState::new(config).with_admin_token(admin_token));

    match state.snapshots.store().load_state() {
        Ok(Some(snapshot)) if snapshot.symbol == state.symbol() => state.restore(snapshot),
        Ok(Some(snapshot)) => warn!(
            saved = %snapshot.symbol,
            configured = %state.symbol(),
            "Saved state belongs to another symbol, starting fresh"
        ),
        Ok(None) => info!("No saved state, starting fresh"),
        Err(e) => warn!(error = %e, "Failed to load saved state, starting fresh"),
    }

    // ── 3. Regime-change log subscriber ──────────────────────────────────
    let mut subscription = state.event_bus.subscribe("log");
    tokio::spawn(async move {
        while let Some(change) = subscription.receiver.recv().await {
            info!(
                from = %change.old_regime,
                to = %change.new_regime,
                confidence = format!("{:.2}", change.confidence),
                price = change.trigger_price,
                reason = %change.reason,
                "Regime change"
            );
        }
    });

    // ── 4. API server ────────────────────────────────────────────────────
    let bind_addr = state.runtime_config.read().api.bind_addr.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("Failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let shutdown = CancellationToken::new();
    let server = {
        let app = api::rest::router(state.clone());
        let token = shutdown.clone();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "API server failed");
            }
        })
    };

    // ── 5. Bar replay or idle ────────────────────────────────────────────
    match std::env::var("REGIME_BARS_PATH") {
        Ok(path) => {
            let bars = market_data::load_jsonl(&path)?;
            info!(path = %path, bars = bars.len(), "Replaying bars");
            tokio::select! {
                _ = replay(state.clone(), bars) => info!("Replay finished"),
                _ = tokio::signal::ctrl_c() => warn!("Interrupted during replay"),
            }
        }
        Err(_) => {
            info!("No REGIME_BARS_PATH given. Press Ctrl+C to stop.");
            tokio::signal::ctrl_c().await?;
        }
    }

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    warn!("Shutting down");
    if state.transition_manager.cancel_active_transition() {
        warn!("Active transition cancelled for shutdown");
    }

    if let Err(e) = state.snapshots.save_now(state.state_snapshot()).await {
        error!(error = %e, "Failed to save state on shutdown");
    }
    if let Err(e) = state.runtime_config.read().save(&config_path) {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    shutdown.cancel();
    if let Err(e) = server.await {
        error!(error = %e, "API server task panicked");
    }

    let metrics = state.transition_manager.metrics();
    info!(
        regime = ?state.regime_detector.current_regime(),
        transitions = metrics.total_transitions,
        successful = metrics.successful,
        "Regime Shift shut down complete"
    );
    Ok(())
}

/// Feed bars one by one. Actionable decisions run on their own task; the
/// manager refuses overlap, so a second decision during a running transition
/// is logged and dropped.
async fn replay(state: Arc<AppState>, bars: Vec<Candle>) {
    let mut running: Vec<JoinHandle<()>> = Vec::new();

    for bar in bars {
        match state.on_bar(bar) {
            Ok(outcome) => {
                if let Some(decision) = outcome.decision.filter(|d| d.is_actionable()) {
                    let task_state = state.clone();
                    running.push(tokio::spawn(async move {
                        match task_state.run_transition(&decision).await {
                            Ok(record) => info!(
                                id = %record.id,
                                action = %record.action,
                                success = record.success,
                                cost = record.actual_cost,
                                "Transition finished"
                            ),
                            Err(CoreError::TransitionInProgress(id)) => {
                                warn!(active = %id, "Transition skipped, another is running")
                            }
                            Err(e) => warn!(error = %e, "Transition failed to start"),
                        }
                    }));
                }
            }
            Err(e) => {
                warn!(error = %e, "Bar processing failed");
                state.push_core_error(&e);
            }
        }

        state.maybe_snapshot();
        running.retain(|h| !h.is_finished());
        tokio::task::yield_now().await;
    }

    for handle in running {
        if let Err(e) = handle.await {
            error!(error = %e, "Transition task panicked");
        }
    }
}
