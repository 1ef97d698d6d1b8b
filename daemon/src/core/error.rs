use stack_common::{
    amount::AmountError,
    ledger::BalanceCheckError,
};
use thiserror::Error;

use crate::adapters::AdapterError;

/// Central error type for the core. Variants map onto the error taxonomy:
/// callers and sagas act on the class, never on vendor specifics.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("insufficient funds in {account}: need {need}, have {have}")]
    InsufficientFunds {
        account: String,
        need: String,
        have: String,
    },

    #[error("withdrawal limit exceeded: {0}")]
    LimitExceeded(String),

    #[error(transparent)]
    Unbalanced(#[from] BalanceCheckError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    #[error("invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("{service} transient failure: {message}")]
    ExternalTransient { service: String, message: String },

    #[error("{service} rejected the request: {message}")]
    ExternalPermanent { service: String, message: String },

    #[error("circuit open for {0}")]
    CircuitOpen(String),

    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Transient failures are retried with backoff; everything else either
    /// surfaces to the caller or fails the saga step permanently.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ExternalTransient { .. } | CoreError::CircuitOpen(_)
        )
    }

    /// Stable taxonomy code, used on the wire and in audit rows.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Unauthorized => "unauthorized",
            CoreError::Forbidden => "forbidden",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::InsufficientFunds { .. } => "insufficient_funds",
            CoreError::LimitExceeded(_) => "limit_exceeded",
            CoreError::Unbalanced(_) => "validation",
            CoreError::Amount(_) => "validation",
            CoreError::InvalidTransition { .. } => "conflict",
            CoreError::ExternalTransient { .. } => "external_transient",
            CoreError::CircuitOpen(_) => "external_transient",
            CoreError::ExternalPermanent { .. } => "external_permanent",
            CoreError::Storage(_) => "internal",
            CoreError::Serde(_) => "internal",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<AdapterError> for CoreError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Timeout { service, .. } => CoreError::ExternalTransient {
                service,
                message: "call timed out".to_string(),
            },
            AdapterError::Transient { service, message } => {
                CoreError::ExternalTransient { service, message }
            }
            AdapterError::Permanent { service, message } => {
                CoreError::ExternalPermanent { service, message }
            }
            AdapterError::CircuitOpen { service } => CoreError::CircuitOpen(service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let transient = CoreError::ExternalTransient {
            service: "broker".into(),
            message: "503".into(),
        };
        assert!(transient.is_retryable());
        assert!(CoreError::CircuitOpen("custody".into()).is_retryable());
        assert!(!CoreError::Validation("bad amount".into()).is_retryable());
        assert!(!CoreError::ExternalPermanent {
            service: "conversion".into(),
            message: "invalid recipient".into(),
        }
        .is_retryable());
    }

    #[test]
    fn taxonomy_codes() {
        assert_eq!(CoreError::Unauthorized.code(), "unauthorized");
        assert_eq!(
            CoreError::InsufficientFunds {
                account: "fiat_exposure".into(),
                need: "75".into(),
                have: "50".into(),
            }
            .code(),
            "insufficient_funds"
        );
    }
}
