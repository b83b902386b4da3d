use serde::Serialize;
use ulid::Ulid;

use crate::auth::Permission;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(&'static str),
    #[error("permission denied: requires {0}")]
    PermissionDenied(Permission),
    #[error("not allowed: {0}")]
    Forbidden(&'static str),
    #[error("unknown credential")]
    UnknownCredential,
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("no user registered with email {0}")]
    EmailNotFound(String),
    #[error("{entity} {id} is {actual}, expected {expected}")]
    InvalidState {
        entity: &'static str,
        id: Ulid,
        actual: &'static str,
        expected: &'static str,
    },
    #[error("conflict with booking {0}: slot already booked or pending approval")]
    Conflict(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

/// Failure classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Permission,
    NotFound,
    InvalidState,
    Conflict,
    Transport,
    Internal,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::PermissionDenied(_)
            | EngineError::Forbidden(_)
            | EngineError::UnknownCredential => ErrorKind::Permission,
            EngineError::NotFound(_) | EngineError::EmailNotFound(_) => ErrorKind::NotFound,
            EngineError::InvalidState { .. } => ErrorKind::InvalidState,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Message safe to hand to a caller. Storage details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            EngineError::WalError(_) => "internal storage error".to_string(),
            other => other.to_string(),
        }
    }
}
