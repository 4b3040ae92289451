// =============================================================================
// Regime Shift - market regime detection and engine transitions
// =============================================================================

pub mod api;
pub mod app_state;
pub mod engine;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod market_data;
pub mod notify;
pub mod persistence;
pub mod regime;
pub mod runtime_config;
pub mod transition;
pub mod types;

pub use error::{CoreError, CoreResult, ErrorCategory};
