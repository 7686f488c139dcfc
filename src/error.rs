use crate::domain::transaction::{TransactionId, TransactionStatus};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[cfg(feature = "storage-rocksdb")]
    #[error("Storage error: {0}")]
    StorageError(#[from] rocksdb::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("State conflict: {0}")]
    StateConflict(#[from] ConflictReason),
    #[error("Transaction {0} was modified concurrently")]
    ConcurrentModification(TransactionId),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

/// Why an operation is not valid for the current state of a transaction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictReason {
    #[error("transaction already succeeded")]
    AlreadySucceeded,
    #[error("only failed transactions can be retried (status is {0})")]
    NotFailed(TransactionStatus),
    #[error("max retry attempts reached ({attempts}/{max_attempts})")]
    RetriesExhausted { attempts: u32, max_attempts: u32 },
    #[error("transaction has no retry policy")]
    NoRetryPolicy,
    #[error("external reference already assigned")]
    ReferenceAlreadyAssigned,
    #[error("external reference is used by another transaction")]
    DuplicateReference,
    #[error("no attempt in flight (status is {0})")]
    NoAttemptInFlight(TransactionStatus),
    #[error("transaction cannot be initiated (status is {0})")]
    NotPending(TransactionStatus),
}

impl PaymentError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalError(message.into().into())
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_reason_is_specific() {
        let exhausted = PaymentError::from(ConflictReason::RetriesExhausted {
            attempts: 3,
            max_attempts: 3,
        });
        assert_eq!(
            exhausted.to_string(),
            "State conflict: max retry attempts reached (3/3)"
        );

        let wrong_status =
            PaymentError::from(ConflictReason::NotFailed(TransactionStatus::Success));
        assert_eq!(
            wrong_status.to_string(),
            "State conflict: only failed transactions can be retried (status is SUCCESS)"
        );
    }

    #[test]
    fn test_not_found_message() {
        let err = PaymentError::not_found("Transaction", "ref-1");
        assert_eq!(err.to_string(), "Transaction not found: ref-1");
    }

    #[test]
    fn test_internal_error_wraps_message() {
        let err = PaymentError::internal("gateway unreachable");
        assert!(matches!(err, PaymentError::InternalError(_)));
        assert_eq!(err.to_string(), "Internal error: gateway unreachable");
    }
}
