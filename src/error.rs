use crate::domain::transaction::TransactionStatus;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Error, Debug)]
pub enum PaymentError {
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Gateway error [{code}]: {message}")]
    GatewayError { code: String, message: String },
    #[error("Circuit open for gateway {gateway} until {retry_at}")]
    CircuitOpen {
        gateway: String,
        retry_at: DateTime<Utc>,
    },
    #[error("No gateway available for {gateway_type}")]
    NoGatewayAvailable {
        gateway_type: String,
        retry_at: Option<DateTime<Utc>>,
    },
    #[error("Concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },
    #[error("Webhook signature invalid for gateway {0}")]
    SignatureInvalid(String),
    #[error("Retries exhausted for transaction {0}")]
    RetriesExhausted(String),
    #[error("Approval rejected: {0}")]
    ApprovalRejected(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Storage error: {0}")]
    StorageError(String),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
    #[error("Internal error: {0}")]
    InternalError(Box<dyn std::error::Error + Send + Sync>),
}

#[cfg(feature = "storage-rocksdb")]
impl From<rocksdb::Error> for PaymentError {
    fn from(err: rocksdb::Error) -> Self {
        PaymentError::StorageError(err.into_string())
    }
}

impl PaymentError {
    /// Whether the retry scheduler may try the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PaymentError::GatewayError { .. }
                | PaymentError::CircuitOpen { .. }
                | PaymentError::NoGatewayAvailable { .. }
                | PaymentError::ConcurrencyConflict(_)
        )
    }
}
