// =============================================================================
// Shared contracts used across the regime-shift core
// =============================================================================
//
// Every type that crosses a component boundary (detector -> manager -> engines
// -> persistence) is defined exactly once here so that no module needs to
// alias another module's types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Regimes
// ---------------------------------------------------------------------------

/// Qualitative market-condition label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegimeType {
    Trending,
    Ranging,
    Volatile,
    Uncertain,
}

impl RegimeType {
    pub const ALL: [RegimeType; 4] = [
        RegimeType::Trending,
        RegimeType::Ranging,
        RegimeType::Volatile,
        RegimeType::Uncertain,
    ];
}

impl std::fmt::Display for RegimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trending => write!(f, "TRENDING"),
            Self::Ranging => write!(f, "RANGING"),
            Self::Volatile => write!(f, "VOLATILE"),
            Self::Uncertain => write!(f, "UNCERTAIN"),
        }
    }
}

/// An accepted change of the externally visible regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeChange {
    pub timestamp: DateTime<Utc>,
    pub old_regime: RegimeType,
    pub new_regime: RegimeType,
    pub confidence: f64,
    pub reason: String,
    pub trigger_price: f64,
}

// ---------------------------------------------------------------------------
// Engines & positions
// ---------------------------------------------------------------------------

/// Strategy family an engine belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineType {
    Grid,
    Trend,
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Grid => write!(f, "grid"),
            Self::Trend => write!(f, "trend"),
        }
    }
}

/// Engine best suited to a regime, or `None` when the current engine should
/// be kept.
pub fn preferred_engine_for(regime: RegimeType) -> Option<EngineType> {
    match regime {
        RegimeType::Trending => Some(EngineType::Trend),
        RegimeType::Ranging => Some(EngineType::Grid),
        RegimeType::Volatile | RegimeType::Uncertain => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// +1 for long, -1 for short.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

/// Open position as reported by an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnginePosition {
    pub id: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub unrealized_pnl: f64,
    pub entry_time: DateTime<Utc>,
}

impl EnginePosition {
    /// Signed notional at the current price (long positive, short negative).
    pub fn signed_notional(&self) -> f64 {
        self.side.sign() * self.size * self.current_price
    }

    /// Notional at entry, used as the P&L percentage base.
    pub fn entry_notional(&self) -> f64 {
        self.size * self.entry_price
    }

    pub fn pnl_pct(&self) -> f64 {
        let base = self.entry_notional();
        if base > 0.0 {
            self.unrealized_pnl / base * 100.0
        } else {
            0.0
        }
    }
}

/// Market context handed to the position evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketContext {
    pub price: f64,
    /// ADX-like trend strength on a 0..100 scale.
    pub trend_strength: f64,
    /// -1, 0 or 1.
    pub trend_direction: i8,
    /// Combined volatility in [0, 1].
    pub volatility: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regime_display() {
        assert_eq!(RegimeType::Trending.to_string(), "TRENDING");
        assert_eq!(RegimeType::Uncertain.to_string(), "UNCERTAIN");
    }

    #[test]
    fn signed_notional_follows_side() {
        let mut pos = EnginePosition {
            id: "p1".into(),
            side: PositionSide::Long,
            size: 2.0,
            entry_price: 100.0,
            current_price: 110.0,
            unrealized_pnl: 20.0,
            entry_time: Utc::now(),
        };
        assert!((pos.signed_notional() - 220.0).abs() < 1e-10);
        assert!((pos.pnl_pct() - 10.0).abs() < 1e-10);
        pos.side = PositionSide::Short;
        assert!((pos.signed_notional() + 220.0).abs() < 1e-10);
    }

    #[test]
    fn engine_preference() {
        assert_eq!(preferred_engine_for(RegimeType::Trending), Some(EngineType::Trend));
        assert_eq!(preferred_engine_for(RegimeType::Ranging), Some(EngineType::Grid));
        assert_eq!(preferred_engine_for(RegimeType::Volatile), None);
    }
}
