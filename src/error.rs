// =============================================================================
// Error taxonomy
// =============================================================================
//
// Categories drive retry behaviour in the transition executor:
//   Fatal / Configuration / Credentials  -> stop, never retried
//   Network / Timeout / Temporary        -> retried after the fixed delay
//   RateLimit                            -> retried after the venue's hint
//   Validation / Order                   -> not retried
//   Position / Strategy                  -> retried only when flagged
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Fatal,
    Configuration,
    Credentials,
    Network,
    Timeout,
    Temporary,
    RateLimit,
    Validation,
    Order,
    Position,
    Strategy,
    Data,
    Cancelled,
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("insufficient data: need {required} bars, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("indicator {indicator} failed: {reason}")]
    Indicator {
        indicator: &'static str,
        reason: String,
    },

    #[error("fatal: {0}")]
    Fatal(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("temporary failure: {0}")]
    Temporary(String),

    #[error("rate limited, retry after {retry_after_ms} ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("order rejected: {0}")]
    Order(String),

    #[error("position error: {0}")]
    Position(String),

    #[error("strategy error: {message}")]
    Strategy { message: String, retryable: bool },

    #[error("a transition is already in progress ({0})")]
    TransitionInProgress(String),

    #[error("cancelled")]
    Cancelled,
}

impl CoreError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InsufficientData { .. } | Self::Indicator { .. } => ErrorCategory::Data,
            Self::Fatal(_) => ErrorCategory::Fatal,
            Self::Configuration(_) => ErrorCategory::Configuration,
            Self::Credentials(_) => ErrorCategory::Credentials,
            Self::Network(_) => ErrorCategory::Network,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::Temporary(_) => ErrorCategory::Temporary,
            Self::RateLimited { .. } => ErrorCategory::RateLimit,
            Self::Validation(_) => ErrorCategory::Validation,
            Self::Order(_) => ErrorCategory::Order,
            Self::Position(_) => ErrorCategory::Position,
            Self::Strategy { .. } => ErrorCategory::Strategy,
            Self::TransitionInProgress(_) => ErrorCategory::Conflict,
            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Temporary(_) | Self::RateLimited { .. } => {
                true
            }
            Self::Strategy { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Wait before the next attempt. Rate limits carry their own hint.
    pub fn retry_delay(&self, base: Duration) -> Duration {
        match self {
            Self::RateLimited { retry_after_ms } => Duration::from_millis(*retry_after_ms).max(base),
            _ => base,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
