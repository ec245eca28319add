//! Error types for the transaction submitter

use ethers::types::{Address, U256};
use thiserror::Error;

/// Rejection reasons a ledger node reports for a submitted transaction.
///
/// Node messages are mapped onto this enum once, in the ledger adapter, so
/// nothing downstream inspects free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRejection {
    /// The nonce was already used on chain
    NonceTooLow,
    /// The nonce is too far ahead of the account's on-chain nonce
    NonceTooHigh,
    /// The node already holds this exact transaction
    AlreadyKnown,
    /// A transaction with the same nonce is pending at a higher price
    ReplacementUnderpriced,
    /// The offered price is below the node's acceptance floor
    Underpriced,
    /// The sender cannot pay for value plus fees
    InsufficientFunds,
    /// The gas limit is above the block gas limit
    GasLimitExceeded,
    /// Execution reverted during pre-flight checks
    Reverted(String),
    /// Anything not covered above
    Other(String),
}

impl std::fmt::Display for LedgerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerRejection::NonceTooLow => write!(f, "nonce too low"),
            LedgerRejection::NonceTooHigh => write!(f, "nonce too high"),
            LedgerRejection::AlreadyKnown => write!(f, "already known"),
            LedgerRejection::ReplacementUnderpriced => {
                write!(f, "replacement transaction underpriced")
            }
            LedgerRejection::Underpriced => write!(f, "transaction underpriced"),
            LedgerRejection::InsufficientFunds => write!(f, "insufficient funds"),
            LedgerRejection::GasLimitExceeded => write!(f, "exceeds block gas limit"),
            LedgerRejection::Reverted(reason) => write!(f, "execution reverted: {}", reason),
            LedgerRejection::Other(message) => write!(f, "{}", message),
        }
    }
}

/// Error category used by retry and recovery decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Node unreachable, timeouts, dropped connections
    Transient,
    /// Node throttling
    RateLimited,
    /// Stale or already-used nonce
    SequenceConflict,
    /// Price too low for inclusion or replacement
    Underpriced,
    /// Malformed request, fee bound exceeded, unmanaged sender
    Validation,
    /// Everything else
    Fatal,
}

/// Main error type for the submitter
#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Node error during {operation}: {message}")]
    Rpc { operation: String, message: String },

    #[error("Rate limited during {operation}")]
    RateLimited { operation: String },

    #[error("Timeout waiting for {operation}")]
    Timeout { operation: String },

    #[error("Ledger rejected transaction: {0}")]
    Rejected(LedgerRejection),

    #[error("Sequence error for {address:?}: {message}")]
    Sequence { address: Address, message: String },

    #[error("Gas estimation error: {0}")]
    GasEstimation(String),

    #[error("Fee {requested} exceeds configured maximum {max}")]
    FeeBoundExceeded { requested: U256, max: U256 },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Signing error: {0}")]
    Signing(String),

    #[error("Transaction {tx_id} not found")]
    TransactionNotFound { tx_id: String },

    #[error("Attempt {attempt} for {address:?} (nonce {nonce:?}) failed: {source}")]
    Attempt {
        address: Address,
        nonce: Option<u64>,
        attempt: u32,
        #[source]
        source: Box<SubmitterError>,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubmitterError {
    /// Classify the error; context wrappers defer to the wrapped error
    pub fn class(&self) -> ErrorClass {
        match self {
            SubmitterError::Rpc { .. } | SubmitterError::Timeout { .. } => ErrorClass::Transient,
            SubmitterError::RateLimited { .. } => ErrorClass::RateLimited,
            SubmitterError::Rejected(rejection) => match rejection {
                LedgerRejection::NonceTooLow
                | LedgerRejection::NonceTooHigh
                | LedgerRejection::AlreadyKnown => ErrorClass::SequenceConflict,
                LedgerRejection::ReplacementUnderpriced | LedgerRejection::Underpriced => {
                    ErrorClass::Underpriced
                }
                LedgerRejection::InsufficientFunds | LedgerRejection::GasLimitExceeded => {
                    ErrorClass::Validation
                }
                LedgerRejection::Reverted(_) | LedgerRejection::Other(_) => ErrorClass::Fatal,
            },
            SubmitterError::Sequence { .. } => ErrorClass::SequenceConflict,
            SubmitterError::FeeBoundExceeded { .. } | SubmitterError::Validation(_) => {
                ErrorClass::Validation
            }
            SubmitterError::Attempt { source, .. } => source.class(),
            SubmitterError::Config(_)
            | SubmitterError::Database(_)
            | SubmitterError::GasEstimation(_)
            | SubmitterError::Signing(_)
            | SubmitterError::TransactionNotFound { .. }
            | SubmitterError::Internal(_) => ErrorClass::Fatal,
        }
    }

    /// Check if error is retryable under the default policy
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Transient
                | ErrorClass::RateLimited
                | ErrorClass::SequenceConflict
                | ErrorClass::Underpriced
        )
    }

    /// A failed broadcast that does not prove the node turned the transaction
    /// away: the reply may have been lost, or an earlier send already landed
    pub fn may_have_landed(&self) -> bool {
        match self {
            SubmitterError::Rpc { .. }
            | SubmitterError::Timeout { .. }
            | SubmitterError::RateLimited { .. }
            | SubmitterError::Rejected(LedgerRejection::AlreadyKnown)
            | SubmitterError::Rejected(LedgerRejection::NonceTooLow) => true,
            SubmitterError::Attempt { source, .. } => source.may_have_landed(),
            _ => false,
        }
    }

    /// Check if error should trigger an alert
    pub fn should_alert(&self) -> bool {
        match self {
            SubmitterError::Rejected(LedgerRejection::InsufficientFunds)
            | SubmitterError::Signing(_)
            | SubmitterError::Database(_) => true,
            SubmitterError::Attempt { source, .. } => source.should_alert(),
            _ => false,
        }
    }

    /// Wrap with the attempt context used by repair decisions
    pub fn in_attempt(self, address: Address, nonce: Option<u64>, attempt: u32) -> Self {
        SubmitterError::Attempt {
            address,
            nonce,
            attempt,
            source: Box::new(self),
        }
    }
}

/// Result type for submitter operations
pub type SubmitterResult<T> = Result<T, SubmitterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_wrapper_keeps_class() {
        let err = SubmitterError::Rejected(LedgerRejection::NonceTooLow).in_attempt(
            Address::zero(),
            Some(4),
            2,
        );
        assert_eq!(err.class(), ErrorClass::SequenceConflict);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("nonce too low"));
    }

    #[test]
    fn test_validation_is_not_retryable() {
        let err = SubmitterError::FeeBoundExceeded {
            requested: U256::from(10),
            max: U256::from(5),
        };
        assert_eq!(err.class(), ErrorClass::Validation);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_insufficient_funds_alerts() {
        let err = SubmitterError::Rejected(LedgerRejection::InsufficientFunds);
        assert!(err.should_alert());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_lost_replies_may_have_landed() {
        let timeout = SubmitterError::Rpc {
            operation: "broadcast".to_string(),
            message: "operation timed out".to_string(),
        };
        assert!(timeout.may_have_landed());
        assert!(SubmitterError::Rejected(LedgerRejection::AlreadyKnown)
            .in_attempt(Address::zero(), Some(1), 1)
            .may_have_landed());
        assert!(!SubmitterError::Rejected(LedgerRejection::Underpriced).may_have_landed());
        assert!(!SubmitterError::Rejected(LedgerRejection::InsufficientFunds).may_have_landed());
    }
}
