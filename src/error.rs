//! Error types for the HTLC resolver

use thiserror::Error;

/// Failure classes the engine reacts to differently
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Rejected before any I/O, never retried
    Validation,
    /// Not enough wallet funds; order aborted before funding
    Resource,
    /// RPC timeouts, temporary rejections; retried with backoff
    Transient,
    /// Protocol races the chain resolves on its own
    Anomaly,
    /// Correctness-threatening conditions needing an operator
    Fatal,
}

/// Main error type for the resolver
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Chain connection error for {chain}: {message}")]
    ChainConnection { chain: String, message: String },

    #[error("RPC error from {chain}: {message}")]
    Rpc { chain: String, message: String },

    #[error("Broadcast rejected on {chain}: {message}")]
    BroadcastRejected {
        chain: String,
        message: String,
        transient: bool,
    },

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Nonce error for chain {chain_id}: {message}")]
    Nonce { chain_id: u64, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Event parsing error: {0}")]
    EventParsing(String),

    #[error("Signing error ({backend}): {message}")]
    Signing {
        backend: String,
        message: String,
        retryable: bool,
    },

    #[error("Wallet error: {0}")]
    Wallet(String),

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Invalid HTLC parameters: {0}")]
    InvalidHtlcParams(String),

    #[error("Invalid execution params: {0}")]
    InvalidExecutionParams(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Secret does not match hashlock for order {order_hash}")]
    SecretMismatch { order_hash: String },

    #[error("Insufficient funds: available {available} sat, required {required} sat")]
    InsufficientFunds { available: u64, required: u64 },

    #[error("Order {order_hash} passed its deadline before funding")]
    DeadlineExceeded { order_hash: String },

    #[error("Timelock for order {order_hash} has not elapsed")]
    TimelockNotElapsed { order_hash: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Order {order_hash} was modified concurrently (expected status {expected})")]
    ConcurrentModification { order_hash: String, expected: String },

    #[error("Order {order_hash} not found")]
    OrderNotFound { order_hash: String },

    #[error("Reconciliation anomaly for order {order_hash}: {message}")]
    Reconciliation { order_hash: String, message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ResolverError {
    /// Map the error onto the engine's failure taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            ResolverError::InvalidHtlcParams(_)
            | ResolverError::InvalidExecutionParams(_)
            | ResolverError::Script(_)
            | ResolverError::SecretMismatch { .. }
            | ResolverError::DeadlineExceeded { .. }
            | ResolverError::EventParsing(_)
            | ResolverError::Config(_) => ErrorClass::Validation,

            ResolverError::InsufficientFunds { .. } => ErrorClass::Resource,

            ResolverError::ChainConnection { .. }
            | ResolverError::Rpc { .. }
            | ResolverError::Timeout { .. }
            | ResolverError::GasEstimation(_)
            | ResolverError::TimelockNotElapsed { .. } => ErrorClass::Transient,

            ResolverError::BroadcastRejected { transient, .. } => {
                if *transient {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Validation
                }
            }

            ResolverError::Signing { retryable, .. } => {
                if *retryable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }

            ResolverError::Reconciliation { .. } | ResolverError::ConcurrentModification { .. } => {
                ErrorClass::Anomaly
            }

            ResolverError::Database(_)
            | ResolverError::Serialization(_)
            | ResolverError::InvalidStateTransition { .. }
            | ResolverError::OrderNotFound { .. }
            | ResolverError::Transaction(_)
            | ResolverError::Nonce { .. }
            | ResolverError::Wallet(_)
            | ResolverError::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal | ErrorClass::Resource)
    }
}

/// Result type for resolver operations
pub type ResolverResult<T> = Result<T, ResolverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        let err = ResolverError::Timeout {
            operation: "broadcast".to_string(),
        };
        assert!(err.is_retryable());

        let err = ResolverError::BroadcastRejected {
            chain: "bitcoin".to_string(),
            message: "mempool full".to_string(),
            transient: true,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_validation_and_fatal_errors_are_not_retried() {
        assert!(!ResolverError::InvalidHtlcParams("zero timelock".into()).is_retryable());
        assert!(!ResolverError::InsufficientFunds {
            available: 1,
            required: 2
        }
        .is_retryable());

        let fatal = ResolverError::InvalidStateTransition {
            from: "discovered".into(),
            to: "htlc_funded".into(),
        };
        assert_eq!(fatal.class(), ErrorClass::Fatal);
        assert!(fatal.should_alert());
    }
}
