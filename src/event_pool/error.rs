//! Event Pool Error Types
//!
//! `PoolError` is returned synchronously to callers (`create`, `get_status`,
//! store primitives). Failures in the asynchronous lifecycle never surface
//! here: they end as a rejected record with a reason code.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    // === Validation Errors ===
    #[error("Amount must be greater than zero")]
    InvalidAmount,

    #[error("Initiator and target account cannot be the same")]
    SameAccount,

    #[error("Time-to-live must be at least one millisecond")]
    InvalidTtl,

    #[error("Field must not be empty: {0}")]
    EmptyField(&'static str),

    // === Lookup Errors ===
    #[error("Transfer not found: {0}")]
    NotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    // === System Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal system error: {0}")]
    System(String),

    #[error("Event channel closed")]
    ChannelClosed,
}

impl PoolError {
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::InvalidAmount => "INVALID_AMOUNT",
            PoolError::SameAccount => "SAME_ACCOUNT",
            PoolError::InvalidTtl => "INVALID_TTL",
            PoolError::EmptyField(_) => "EMPTY_FIELD",
            PoolError::NotFound(_) => "TRANSFER_NOT_FOUND",
            PoolError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            PoolError::Database(_) => "DATABASE_ERROR",
            PoolError::System(_) => "SYSTEM_ERROR",
            PoolError::ChannelClosed => "CHANNEL_CLOSED",
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            PoolError::InvalidAmount
            | PoolError::SameAccount
            | PoolError::InvalidTtl
            | PoolError::EmptyField(_) => 400,
            PoolError::NotFound(_) => 404,
            PoolError::InvalidStateTransition(_) | PoolError::Database(_) | PoolError::System(_) => {
                500
            }
            PoolError::ChannelClosed => 503,
        }
    }

    /// Whether this is a caller mistake surfaced by `create`
    pub fn is_validation(&self) -> bool {
        self.http_status() == 400
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(e: sqlx::Error) -> Self {
        PoolError::Database(e.to_string())
    }
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Failure reported by the `ExecuteTransfer` collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Invalid target account: {0}")]
    InvalidTarget(String),

    /// Ledger unreachable; the only kind a deployment may re-attempt
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),

    #[error("Transfer rejected by ledger: {0}")]
    Rejected(String),
}

impl ExecutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::InsufficientFunds => "insufficient_funds",
            ExecutionError::InvalidTarget(_) => "invalid_target",
            ExecutionError::Unavailable(_) => "unavailable",
            ExecutionError::Rejected(_) => "rejected",
        }
    }

    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Unavailable(_))
    }
}

/// The `CheckRunner` refused to accept an evaluation request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Check submission failed: {0}")]
pub struct CheckError(pub String);
