//! Error types for the rebalancing core.

use rebalancer_chain::ChainError;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Rejected configuration input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("unknown configuration field `{0}`")]
    UnknownField(String),

    #[error("`{field}` expects {expected}, got `{value}`")]
    Parse {
        field: String,
        expected: &'static str,
        value: String,
    },

    #[error("`{field}` must be {bound}")]
    OutOfBounds { field: String, bound: String },
}

impl ValidationError {
    pub(crate) fn bound(field: &str, bound: impl Into<String>) -> Self {
        Self::OutOfBounds {
            field: field.to_string(),
            bound: bound.into(),
        }
    }
}

/// Credit facility math failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FacilityError {
    #[error("target LTV {target}% outside [0, {ceiling}]%")]
    InvalidTarget { target: Decimal, ceiling: Decimal },

    #[error("borrow limit is zero while {borrowed} is borrowed")]
    ZeroBorrowLimit { borrowed: Decimal },
}

/// Synthetic position math failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("position {idx} has no debt")]
    ZeroDebt { idx: String },

    #[error("position {idx}: {what} not refreshed this cycle")]
    Stale { idx: String, what: &'static str },

    #[error("position {idx}: {what} is zero")]
    ZeroPrice { idx: String, what: &'static str },
}

/// Anything that aborts a cycle step.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("{operation} failed: {source}")]
    Chain {
        operation: &'static str,
        #[source]
        source: ChainError,
    },

    #[error(transparent)]
    Facility(#[from] FacilityError),

    #[error(transparent)]
    Position(#[from] PositionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("engine must be paused to run this command")]
    NotPaused,
}

impl EngineError {
    /// Whether the next cycle may succeed without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Chain { .. } | Self::Position(PositionError::Stale { .. })
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
