// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Each indicator comes as a streaming calculator (`update` per bar) plus a
// slice function that folds the calculator over a window. Slice functions
// return `Option<T>` so callers must handle insufficient data and numerical
// edge cases; the regime detector turns `None` into an error.

pub mod adx;
pub mod atr;
pub mod bollinger;
pub mod donchian;
pub mod ema;
pub mod rsi;
pub mod smoothing;

pub use adx::{calculate_adx, AdxReading, AdxState};
pub use atr::{calculate_atr, calculate_atr_pct, AtrState};
pub use bollinger::{calculate_bollinger, BollingerResult, BollingerState};
pub use donchian::{calculate_donchian, detect_breakout, Breakout, DonchianChannel};
pub use ema::{calculate_ema, ma_divergence, Ema, MaDivergence};
pub use rsi::{calculate_rsi, noise_score, RsiState};
pub use smoothing::WilderAverage;
