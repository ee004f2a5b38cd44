use thiserror::Error;

use crate::model::{Amount, BookingState, DateRange, RoomId};
use crate::validation::ValidationErrors;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed or illogical input. Never retried.
    #[error("validation failed: {0}")]
    Validation(ValidationErrors),

    /// The range is taken, or the room lock could not be acquired in time.
    #[error("room {room} is not available for {range}")]
    Conflict { room: RoomId, range: DateRange },

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: &'static str, id: String },

    #[error("cannot {action} booking {id} in state {state}")]
    InvalidState {
        id: ulid::Ulid,
        state: BookingState,
        action: &'static str,
    },

    /// Receipt creation failed inside the payment-binding transaction.
    #[error("payment of {got} does not match total price {expected}")]
    PaymentMismatch { expected: Amount, got: Amount },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("timed out waiting for lock on {0}")]
    LockTimeout(String),

    #[error("journal error: {0}")]
    Journal(String),
}

impl EngineError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: &'static str, id: impl ToString) -> Self {
        EngineError::AlreadyExists {
            kind,
            id: id.to_string(),
        }
    }

    /// Store-level aborts. The engine retries these once before surfacing them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::LockTimeout(_) | EngineError::Journal(_))
    }

    /// Short machine-readable kind for the wire and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::Conflict { .. } => "conflict",
            EngineError::NotFound { .. } => "not_found",
            EngineError::AlreadyExists { .. } => "already_exists",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::PaymentMismatch { .. } => "payment_mismatch",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::LockTimeout(_) => "lock_timeout",
            EngineError::Journal(_) => "transient",
        }
    }
}

impl From<ValidationErrors> for EngineError {
    fn from(e: ValidationErrors) -> Self {
        EngineError::Validation(e)
    }
}
