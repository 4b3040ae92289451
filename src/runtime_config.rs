// =============================================================================
// Runtime Configuration - typed settings with validated patches and atomic save
// =============================================================================
//
// Every tunable parameter of the detector, evaluator, transition manager,
// executor and policies lives here. All fields carry serde defaults so an
// older config file keeps loading after new fields are added.
//
// Partial updates arrive as a `ConfigPatch`: typed, unknown keys rejected at
// every level, validated as a whole before being committed.
//
// Persistence uses the tmp + rename pattern.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{CoreError, CoreResult};
use crate::transition::types::{PolicyKind, TransitionActionType};
use crate::types::RegimeType;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}
fn default_bar_buffer_capacity() -> usize {
    2000
}

fn default_adx_period() -> usize {
    14
}
fn default_adx_threshold() -> f64 {
    25.0
}
fn default_ema_fast_period() -> usize {
    20
}
fn default_ema_slow_period() -> usize {
    50
}
fn default_ma_divergence_threshold() -> f64 {
    0.02
}
fn default_donchian_period() -> usize {
    20
}
fn default_atr_period() -> usize {
    14
}
fn default_atr_pct_ceiling() -> f64 {
    4.0
}
fn default_bollinger_period() -> usize {
    20
}
fn default_bollinger_std() -> f64 {
    2.0
}
fn default_bbw_ceiling() -> f64 {
    10.0
}
fn default_rsi_period() -> usize {
    14
}
fn default_rsi_smoothing() -> usize {
    4
}
fn default_noise_band_low() -> f64 {
    45.0
}
fn default_noise_band_high() -> f64 {
    55.0
}
fn default_confirmation_bars() -> u32 {
    3
}
fn default_regime_switch_cooldown() -> u32 {
    5
}
fn default_signal_history_cap() -> usize {
    1000
}
fn default_false_signal_window() -> usize {
    10
}

fn default_fee_rate() -> f64 {
    0.001
}
fn default_slippage_rate() -> f64 {
    0.0005
}

fn default_min_confidence() -> f64 {
    0.7
}
fn default_max_transition_cost_pct() -> f64 {
    1.0
}
fn default_max_daily_transitions() -> u32 {
    10
}
fn default_max_daily_cost_pct() -> f64 {
    3.0
}
fn default_transition_cooldown_secs() -> u64 {
    300
}
fn default_transition_history_cap() -> usize {
    100
}
fn default_active_policy() -> PolicyKind {
    PolicyKind::Adaptive
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_step_timeout_ms() -> u64 {
    10_000
}
fn default_inter_step_pause_ms() -> u64 {
    100
}

fn default_state_path() -> String {
    "state/regime_state.json".to_string()
}
fn default_save_interval_secs() -> u64 {
    60
}
fn default_subscriber_queue_capacity() -> usize {
    64
}
fn default_recent_notifications() -> usize {
    100
}
fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_policies() -> Vec<PolicyDefinition> {
    vec![
        PolicyDefinition::conservative(),
        PolicyDefinition::aggressive(),
        PolicyDefinition::adaptive(),
    ]
}

// =============================================================================
// RegimeConfig
// =============================================================================

/// Indicator periods, classification thresholds and hysteresis settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    /// ADX level above which the market counts as trending.
    #[serde(default = "default_adx_threshold")]
    pub adx_threshold: f64,
    #[serde(default = "default_ema_fast_period")]
    pub ema_fast_period: usize,
    #[serde(default = "default_ema_slow_period")]
    pub ema_slow_period: usize,
    /// Fractional EMA distance (0.02 = 2%) that counts as significant.
    #[serde(default = "default_ma_divergence_threshold")]
    pub ma_divergence_threshold: f64,
    #[serde(default = "default_donchian_period")]
    pub donchian_period: usize,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    /// ATR% that maps to volatility 1.0.
    #[serde(default = "default_atr_pct_ceiling")]
    pub atr_pct_ceiling: f64,
    #[serde(default = "default_bollinger_period")]
    pub bollinger_period: usize,
    #[serde(default = "default_bollinger_std")]
    pub bollinger_std: f64,
    /// Band width % that maps to volatility 1.0.
    #[serde(default = "default_bbw_ceiling")]
    pub bbw_ceiling: f64,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    /// RSI readings averaged before scoring noise.
    #[serde(default = "default_rsi_smoothing")]
    pub rsi_smoothing: usize,
    #[serde(default = "default_noise_band_low")]
    pub noise_band_low: f64,
    #[serde(default = "default_noise_band_high")]
    pub noise_band_high: f64,
    #[serde(default = "default_confirmation_bars")]
    pub confirmation_bars: u32,
    #[serde(default = "default_regime_switch_cooldown")]
    pub regime_switch_cooldown: u32,
    #[serde(default = "default_signal_history_cap")]
    pub history_cap: usize,
    /// Signals within which a reverted change counts as false (reporting).
    #[serde(default = "default_false_signal_window")]
    pub false_signal_window: usize,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            adx_period: default_adx_period(),
            adx_threshold: default_adx_threshold(),
            ema_fast_period: default_ema_fast_period(),
            ema_slow_period: default_ema_slow_period(),
            ma_divergence_threshold: default_ma_divergence_threshold(),
            donchian_period: default_donchian_period(),
            atr_period: default_atr_period(),
            atr_pct_ceiling: default_atr_pct_ceiling(),
            bollinger_period: default_bollinger_period(),
            bollinger_std: default_bollinger_std(),
            bbw_ceiling: default_bbw_ceiling(),
            rsi_period: default_rsi_period(),
            rsi_smoothing: default_rsi_smoothing(),
            noise_band_low: default_noise_band_low(),
            noise_band_high: default_noise_band_high(),
            confirmation_bars: default_confirmation_bars(),
            regime_switch_cooldown: default_regime_switch_cooldown(),
            history_cap: default_signal_history_cap(),
            false_signal_window: default_false_signal_window(),
        }
    }
}

impl RegimeConfig {
    /// Bars a detection call needs before it will classify.
    pub fn min_required_bars(&self) -> usize {
        self.ema_slow_period.max(self.donchian_period) + self.confirmation_bars as usize
    }

    fn validate(&self) -> CoreResult<()> {
        let periods = [
            ("adx_period", self.adx_period),
            ("ema_fast_period", self.ema_fast_period),
            ("ema_slow_period", self.ema_slow_period),
            ("donchian_period", self.donchian_period),
            ("atr_period", self.atr_period),
            ("bollinger_period", self.bollinger_period),
            ("rsi_period", self.rsi_period),
            ("rsi_smoothing", self.rsi_smoothing),
            ("history_cap", self.history_cap),
        ];
        for (name, value) in periods {
            if value == 0 {
                return Err(invalid(format!("regime.{name} must be positive")));
            }
        }
        if self.ema_fast_period >= self.ema_slow_period {
            return Err(invalid("regime.ema_fast_period must be below ema_slow_period"));
        }
        if self.confirmation_bars == 0 {
            return Err(invalid("regime.confirmation_bars must be positive"));
        }
        for (name, value) in [
            ("adx_threshold", self.adx_threshold),
            ("ma_divergence_threshold", self.ma_divergence_threshold),
            ("atr_pct_ceiling", self.atr_pct_ceiling),
            ("bollinger_std", self.bollinger_std),
            ("bbw_ceiling", self.bbw_ceiling),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("regime.{name} must be a positive number")));
            }
        }
        if !(0.0..=100.0).contains(&self.noise_band_low)
            || !(0.0..=100.0).contains(&self.noise_band_high)
            || self.noise_band_low >= self.noise_band_high
        {
            return Err(invalid("regime.noise_band must satisfy 0 <= low < high <= 100"));
        }

        // The minimum window must feed every indicator.
        let needed = [
            2 * self.adx_period,
            self.bollinger_period,
            self.rsi_period + self.rsi_smoothing,
            self.atr_period + 1,
            self.donchian_period + 1,
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        if self.min_required_bars() < needed {
            return Err(invalid(format!(
                "regime window of {} bars is too short, indicators need {needed}",
                self.min_required_bars()
            )));
        }
        Ok(())
    }
}

// =============================================================================
// EvaluatorConfig / TransitionConfig / ExecutorConfig
// =============================================================================

/// Cost model used by the position evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Taker fee as a fraction of notional.
    #[serde(default = "default_fee_rate")]
    pub fee_rate: f64,
    /// Expected slippage as a fraction of notional.
    #[serde(default = "default_slippage_rate")]
    pub slippage_rate: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            fee_rate: default_fee_rate(),
            slippage_rate: default_slippage_rate(),
        }
    }
}

/// Gating limits of the transition manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionConfig {
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Ceiling on a single decision's estimated cost, percent of gross exposure.
    #[serde(default = "default_max_transition_cost_pct")]
    pub max_transition_cost_pct: f64,
    #[serde(default = "default_max_daily_transitions")]
    pub max_daily_transitions: u32,
    /// Ceiling on the day's cumulative estimated cost, percent.
    #[serde(default = "default_max_daily_cost_pct")]
    pub max_daily_cost_pct: f64,
    #[serde(default = "default_transition_cooldown_secs")]
    pub transition_cooldown_secs: u64,
    #[serde(default = "default_transition_history_cap")]
    pub history_cap: usize,
    #[serde(default = "default_active_policy")]
    pub active_policy: PolicyKind,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            min_confidence: default_min_confidence(),
            max_transition_cost_pct: default_max_transition_cost_pct(),
            max_daily_transitions: default_max_daily_transitions(),
            max_daily_cost_pct: default_max_daily_cost_pct(),
            transition_cooldown_secs: default_transition_cooldown_secs(),
            history_cap: default_transition_history_cap(),
            active_policy: default_active_policy(),
        }
    }
}

/// Retry and pacing settings of the transition executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,
    #[serde(default = "default_inter_step_pause_ms")]
    pub inter_step_pause_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            inter_step_pause_ms: default_inter_step_pause_ms(),
        }
    }
}

// =============================================================================
// Policies
// =============================================================================

/// Ordered (from, to) regime pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegimePair {
    pub from: RegimeType,
    pub to: RegimeType,
}

impl RegimePair {
    /// Every pair with `from != to`.
    pub fn all_changes() -> Vec<RegimePair> {
        RegimeType::ALL
            .iter()
            .flat_map(|&from| {
                RegimeType::ALL
                    .iter()
                    .filter(move |&&to| to != from)
                    .map(move |&to| RegimePair { from, to })
            })
            .collect()
    }
}

/// One named policy bundle. Used both for transition gating and, through
/// `preferred_engine_for`, for engine selection; there is no second table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefinition {
    pub kind: PolicyKind,
    pub confidence_floor: f64,
    /// Max estimated cost, percent of gross exposure.
    pub max_cost_pct: f64,
    pub preferred_action: TransitionActionType,
    pub fallback_action: TransitionActionType,
    pub max_daily_applications: u32,
    pub cooldown_secs: u64,
    /// P&L percent below which the policy forces an exit.
    #[serde(default)]
    pub loss_exit_pct: Option<f64>,
    /// Average position age in hours beyond which the policy forces an exit.
    #[serde(default)]
    pub max_position_age_hours: Option<f64>,
    #[serde(default = "RegimePair::all_changes")]
    pub applicable_pairs: Vec<RegimePair>,
    /// Self-adjusting confidence floor.
    #[serde(default)]
    pub adaptive: bool,
}

impl PolicyDefinition {
    pub fn conservative() -> Self {
        Self {
            kind: PolicyKind::Conservative,
            confidence_floor: 0.8,
            max_cost_pct: 0.5,
            preferred_action: TransitionActionType::ProtectiveHold,
            fallback_action: TransitionActionType::Hold,
            max_daily_applications: 5,
            cooldown_secs: 15 * 60,
            loss_exit_pct: None,
            max_position_age_hours: None,
            applicable_pairs: RegimePair::all_changes(),
            adaptive: false,
        }
    }

    pub fn aggressive() -> Self {
        Self {
            kind: PolicyKind::Aggressive,
            confidence_floor: 0.6,
            max_cost_pct: 1.5,
            preferred_action: TransitionActionType::ImmediateExit,
            fallback_action: TransitionActionType::GradualUnwind,
            max_daily_applications: 15,
            cooldown_secs: 5 * 60,
            loss_exit_pct: None,
            max_position_age_hours: None,
            applicable_pairs: RegimePair::all_changes(),
            adaptive: false,
        }
    }

    pub fn adaptive() -> Self {
        Self {
            kind: PolicyKind::Adaptive,
            confidence_floor: 0.7,
            max_cost_pct: 1.0,
            preferred_action: TransitionActionType::GracefulMigration,
            fallback_action: TransitionActionType::ProtectiveHold,
            max_daily_applications: 10,
            cooldown_secs: 7 * 60,
            loss_exit_pct: None,
            max_position_age_hours: None,
            applicable_pairs: RegimePair::all_changes(),
            adaptive: true,
        }
    }

    pub fn applies_to(&self, from: RegimeType, to: RegimeType) -> bool {
        self.applicable_pairs.contains(&RegimePair { from, to })
    }

    fn validate(&self) -> CoreResult<()> {
        if !(0.0..=1.0).contains(&self.confidence_floor) {
            return Err(invalid(format!("policy {}: confidence_floor must be in [0, 1]", self.kind)));
        }
        if !(self.max_cost_pct.is_finite() && self.max_cost_pct >= 0.0) {
            return Err(invalid(format!("policy {}: max_cost_pct must be non-negative", self.kind)));
        }
        if self.max_daily_applications == 0 {
            return Err(invalid(format!("policy {}: max_daily_applications must be positive", self.kind)));
        }
        Ok(())
    }
}

// =============================================================================
// Host sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_save_interval_secs")]
    pub save_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            save_interval_secs: default_save_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// Recent changes kept for the HTTP surface.
    #[serde(default = "default_recent_notifications")]
    pub recent_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            recent_capacity: default_recent_notifications(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Symbol whose bars drive detection.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Bars retained per symbol in the in-memory history.
    #[serde(default = "default_bar_buffer_capacity")]
    pub bar_buffer_capacity: usize,

    #[serde(default)]
    pub regime: RegimeConfig,

    #[serde(default)]
    pub evaluator: EvaluatorConfig,

    #[serde(default)]
    pub transition: TransitionConfig,

    #[serde(default)]
    pub executor: ExecutorConfig,

    #[serde(default = "default_policies")]
    pub policies: Vec<PolicyDefinition>,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            bar_buffer_capacity: default_bar_buffer_capacity(),
            regime: RegimeConfig::default(),
            evaluator: EvaluatorConfig::default(),
            transition: TransitionConfig::default(),
            executor: ExecutorConfig::default(),
            policies: default_policies(),
            persistence: PersistenceConfig::default(),
            notify: NotifyConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("invalid runtime config in {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            active_policy = %config.transition.active_policy,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the configuration to `path` with an atomic write.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialise runtime config to JSON")?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }

    /// Reject inconsistent settings.
    pub fn validate(&self) -> CoreResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(invalid("symbol must not be empty"));
        }
        if self.bar_buffer_capacity < self.regime.min_required_bars() {
            return Err(invalid(format!(
                "bar_buffer_capacity {} is below the detector window of {} bars",
                self.bar_buffer_capacity,
                self.regime.min_required_bars()
            )));
        }
        self.regime.validate()?;

        for (name, value) in [
            ("evaluator.fee_rate", self.evaluator.fee_rate),
            ("evaluator.slippage_rate", self.evaluator.slippage_rate),
        ] {
            if !(0.0..1.0).contains(&value) {
                return Err(invalid(format!("{name} must be in [0, 1)")));
            }
        }

        let t = &self.transition;
        if !(0.0..=1.0).contains(&t.min_confidence) {
            return Err(invalid("transition.min_confidence must be in [0, 1]"));
        }
        if !(t.max_transition_cost_pct.is_finite() && t.max_transition_cost_pct >= 0.0) {
            return Err(invalid("transition.max_transition_cost_pct must be non-negative"));
        }
        if !(t.max_daily_cost_pct.is_finite() && t.max_daily_cost_pct >= 0.0) {
            return Err(invalid("transition.max_daily_cost_pct must be non-negative"));
        }
        if t.history_cap == 0 {
            return Err(invalid("transition.history_cap must be positive"));
        }

        if self.executor.retry_attempts == 0 {
            return Err(invalid("executor.retry_attempts must be at least 1"));
        }
        if self.executor.step_timeout_ms == 0 {
            return Err(invalid("executor.step_timeout_ms must be positive"));
        }

        for (i, p) in self.policies.iter().enumerate() {
            p.validate()?;
            if self.policies[..i].iter().any(|q| q.kind == p.kind) {
                return Err(invalid(format!("policy {} is defined twice", p.kind)));
            }
        }
        if self.policy(t.active_policy).is_none() {
            return Err(invalid(format!("active policy {} has no definition", t.active_policy)));
        }

        if self.notify.subscriber_queue_capacity == 0 {
            return Err(invalid("notify.subscriber_queue_capacity must be positive"));
        }
        Ok(())
    }

    pub fn policy(&self, kind: PolicyKind) -> Option<&PolicyDefinition> {
        self.policies.iter().find(|p| p.kind == kind)
    }

    /// Apply a partial update. The patched configuration is validated as a
    /// whole; on error nothing is changed.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> CoreResult<()> {
        let mut next = self.clone();
        patch.apply_to(&mut next)?;
        next.validate()?;
        *self = next;
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> CoreError {
    CoreError::Configuration(msg.into())
}

// =============================================================================
// Partial updates
// =============================================================================

macro_rules! patch_fields {
    ($target:expr, $patch:expr, $($field:ident),+ $(,)?) => {
        $(
            if let Some(v) = $patch.$field.clone() {
                $target.$field = v;
            }
        )+
    };
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegimePatch {
    pub adx_period: Option<usize>,
    pub adx_threshold: Option<f64>,
    pub ema_fast_period: Option<usize>,
    pub ema_slow_period: Option<usize>,
    pub ma_divergence_threshold: Option<f64>,
    pub donchian_period: Option<usize>,
    pub atr_period: Option<usize>,
    pub atr_pct_ceiling: Option<f64>,
    pub bollinger_period: Option<usize>,
    pub bollinger_std: Option<f64>,
    pub bbw_ceiling: Option<f64>,
    pub rsi_period: Option<usize>,
    pub rsi_smoothing: Option<usize>,
    pub noise_band_low: Option<f64>,
    pub noise_band_high: Option<f64>,
    pub confirmation_bars: Option<u32>,
    pub regime_switch_cooldown: Option<u32>,
    pub history_cap: Option<usize>,
    pub false_signal_window: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvaluatorPatch {
    pub fee_rate: Option<f64>,
    pub slippage_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransitionPatch {
    pub min_confidence: Option<f64>,
    pub max_transition_cost_pct: Option<f64>,
    pub max_daily_transitions: Option<u32>,
    pub max_daily_cost_pct: Option<f64>,
    pub transition_cooldown_secs: Option<u64>,
    pub history_cap: Option<usize>,
    pub active_policy: Option<PolicyKind>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorPatch {
    pub retry_attempts: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub step_timeout_ms: Option<u64>,
    pub inter_step_pause_ms: Option<u64>,
}

/// Update to an existing policy, addressed by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyPatch {
    pub kind: PolicyKind,
    #[serde(default)]
    pub confidence_floor: Option<f64>,
    #[serde(default)]
    pub max_cost_pct: Option<f64>,
    #[serde(default)]
    pub preferred_action: Option<TransitionActionType>,
    #[serde(default)]
    pub fallback_action: Option<TransitionActionType>,
    #[serde(default)]
    pub max_daily_applications: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
    #[serde(default)]
    pub applicable_pairs: Option<Vec<RegimePair>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PersistencePatch {
    pub save_interval_secs: Option<u64>,
}

/// Typed partial update of `RuntimeConfig`. Unknown keys fail to parse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigPatch {
    #[serde(default)]
    pub regime: Option<RegimePatch>,
    #[serde(default)]
    pub evaluator: Option<EvaluatorPatch>,
    #[serde(default)]
    pub transition: Option<TransitionPatch>,
    #[serde(default)]
    pub executor: Option<ExecutorPatch>,
    #[serde(default)]
    pub policies: Option<Vec<PolicyPatch>>,
    #[serde(default)]
    pub persistence: Option<PersistencePatch>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.regime.is_none()
            && self.evaluator.is_none()
            && self.transition.is_none()
            && self.executor.is_none()
            && self.policies.is_none()
            && self.persistence.is_none()
    }

    fn apply_to(&self, cfg: &mut RuntimeConfig) -> CoreResult<()> {
        if let Some(p) = &self.regime {
            patch_fields!(
                cfg.regime,
                p,
                adx_period,
                adx_threshold,
                ema_fast_period,
                ema_slow_period,
                ma_divergence_threshold,
                donchian_period,
                atr_period,
                atr_pct_ceiling,
                bollinger_period,
                bollinger_std,
                bbw_ceiling,
                rsi_period,
                rsi_smoothing,
                noise_band_low,
                noise_band_high,
                confirmation_bars,
                regime_switch_cooldown,
                history_cap,
                false_signal_window,
            );
        }
        if let Some(p) = &self.evaluator {
            patch_fields!(cfg.evaluator, p, fee_rate, slippage_rate);
        }
        if let Some(p) = &self.transition {
            patch_fields!(
                cfg.transition,
                p,
                min_confidence,
                max_transition_cost_pct,
                max_daily_transitions,
                max_daily_cost_pct,
                transition_cooldown_secs,
                history_cap,
                active_policy,
            );
        }
        if let Some(p) = &self.executor {
            patch_fields!(cfg.executor, p, retry_attempts, retry_delay_ms, step_timeout_ms, inter_step_pause_ms);
        }
        if let Some(patches) = &self.policies {
            for p in patches {
                let def = cfg
                    .policies
                    .iter_mut()
                    .find(|d| d.kind == p.kind)
                    .ok_or_else(|| invalid(format!("unknown policy {}", p.kind)))?;
                patch_fields!(
                    def,
                    p,
                    confidence_floor,
                    max_cost_pct,
                    preferred_action,
                    fallback_action,
                    max_daily_applications,
                    cooldown_secs,
                    applicable_pairs,
                );
            }
        }
        if let Some(p) = &self.persistence {
            patch_fields!(cfg.persistence, p, save_interval_secs);
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.regime.confirmation_bars, 3);
        assert_eq!(cfg.regime.regime_switch_cooldown, 5);
        assert_eq!(cfg.regime.min_required_bars(), 53);
        assert_eq!(cfg.transition.max_daily_transitions, 10);
        assert_eq!(cfg.transition.active_policy, PolicyKind::Adaptive);
        assert_eq!(cfg.executor.retry_attempts, 3);
        assert_eq!(cfg.policies.len(), 3);
        assert!((cfg.transition.min_confidence - 0.7).abs() < f64::EPSILON);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn policy_table_matches_named_bundles() {
        let cfg = RuntimeConfig::default();
        let c = cfg.policy(PolicyKind::Conservative).unwrap();
        assert!((c.confidence_floor - 0.8).abs() < f64::EPSILON);
        assert_eq!(c.cooldown_secs, 900);
        let a = cfg.policy(PolicyKind::Aggressive).unwrap();
        assert_eq!(a.preferred_action, TransitionActionType::ImmediateExit);
        assert_eq!(a.max_daily_applications, 15);
        let d = cfg.policy(PolicyKind::Adaptive).unwrap();
        assert!(d.adaptive);
        assert_eq!(d.cooldown_secs, 420);
        assert_eq!(d.applicable_pairs.len(), 12);
        assert!(d.applies_to(RegimeType::Trending, RegimeType::Ranging));
        assert!(!d.applies_to(RegimeType::Trending, RegimeType::Trending));
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "regime": { "adx_threshold": 30.0 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert!((cfg.regime.adx_threshold - 30.0).abs() < f64::EPSILON);
        assert_eq!(cfg.regime.ema_slow_period, 50);
    }

    #[test]
    fn validate_rejects_inverted_emas() {
        let mut cfg = RuntimeConfig::default();
        cfg.regime.ema_fast_period = 60;
        assert!(matches!(cfg.validate(), Err(CoreError::Configuration(_))));
    }

    #[test]
    fn validate_rejects_window_too_short_for_adx() {
        let mut cfg = RuntimeConfig::default();
        cfg.regime.adx_period = 40;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn patch_applies_and_validates() {
        let mut cfg = RuntimeConfig::default();
        let patch: ConfigPatch = serde_json::from_str(
            r#"{ "transition": { "min_confidence": 0.75 },
                 "policies": [ { "kind": "aggressive", "max_daily_applications": 20 } ] }"#,
        )
        .unwrap();
        cfg.apply_patch(&patch).unwrap();
        assert!((cfg.transition.min_confidence - 0.75).abs() < f64::EPSILON);
        assert_eq!(cfg.policy(PolicyKind::Aggressive).unwrap().max_daily_applications, 20);
    }

    #[test]
    fn invalid_patch_leaves_config_untouched() {
        let mut cfg = RuntimeConfig::default();
        let patch: ConfigPatch = serde_json::from_str(r#"{ "transition": { "min_confidence": 1.5 } }"#).unwrap();
        assert!(cfg.apply_patch(&patch).is_err());
        assert_eq!(cfg, RuntimeConfig::default());
    }

    #[test]
    fn patch_rejects_unknown_keys() {
        assert!(serde_json::from_str::<ConfigPatch>(r#"{ "bogus": 1 }"#).is_err());
        assert!(serde_json::from_str::<ConfigPatch>(r#"{ "regime": { "adx_periodd": 3 } }"#).is_err());
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = std::env::temp_dir().join(format!("regime-shift-cfg-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.json");
        let mut cfg = RuntimeConfig::default();
        cfg.symbol = "SOLUSDT".into();
        cfg.save(&path).unwrap();
        let loaded = RuntimeConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
