//! Forecasting Error Taxonomy
//!
//! Typed failures for every command in the forecasting core. Validation and
//! state-conflict variants are returned synchronously to callers; settlement
//! never surfaces external-data failures as errors (they resolve to VOID).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForecastError {
    /// Debit would take a coin balance below zero.
    #[error("insufficient coin balance")]
    InsufficientBalance,

    /// Forecasting was never enabled for this target.
    #[error("forecasting is not configured for this target")]
    NotConfigured,

    /// Stake bounds with min > max or min < 1.
    #[error("invalid stake bounds")]
    InvalidBounds,

    /// Stake outside the target's configured [min, max] range.
    #[error("stake must be between {min} and {max} coins")]
    StakeOutOfRange { min: i64, max: i64 },

    /// Target is inactive or its revenue source is disconnected.
    #[error("forecasting is unavailable for this target")]
    ForecastingUnavailable,

    /// No OPEN period exists for the target.
    #[error("no open forecasting period for this target")]
    NoOpenPeriod,

    /// Bettor already holds a PENDING bet on this (target, period).
    #[error("a pending bet already exists for this target and period")]
    DuplicateBet,

    /// The bet's period is no longer OPEN; cancellation is not possible.
    #[error("the forecasting period is locked")]
    PeriodLocked,

    /// Cancel requested by someone other than the bettor.
    #[error("only the bettor may cancel this bet")]
    NotBettor,

    #[error("bet not found")]
    BetNotFound,

    /// An OPEN or LOCKED period already exists for the target.
    #[error("a forecasting period is already open for this target")]
    AlreadyOpen,

    /// No verified MRR reading yet; a period cannot be opened.
    #[error("no baseline MRR reading for this target")]
    NoBaseline,

    /// Another worker already claimed this period for resolution.
    #[error("period already claimed for resolution")]
    AlreadyClaimed,

    #[error("period not found")]
    PeriodNotFound,

    /// Malformed direction, percentage, or other bad input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

impl ForecastError {
    /// True for legitimate concurrent-state conditions ("try again later" /
    /// "action no longer applicable"), never treated as bugs.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::AlreadyOpen
                | Self::AlreadyClaimed
                | Self::DuplicateBet
                | Self::PeriodLocked
        )
    }

    /// True when the caller can recover by correcting input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidBounds
                | Self::StakeOutOfRange { .. }
                | Self::InvalidInput(_)
                | Self::ForecastingUnavailable
                | Self::NoOpenPeriod
                | Self::NoBaseline
        )
    }
}

pub type ForecastResult<T> = Result<T, ForecastError>;
