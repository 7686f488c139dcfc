use super::classifier::is_retry_eligible;
use super::transaction::TransactionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Diagnostic record of one failed attempt. Never mutated after creation.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ErrorEntry {
    pub id: Uuid,
    pub transaction_id: TransactionId,
    pub error_code: String,
    pub error_message: Option<String>,
    pub retry_eligible: bool,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl ErrorEntry {
    pub fn new(
        transaction_id: TransactionId,
        error_code: impl Into<String>,
        error_message: Option<String>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let error_code = error_code.into();
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            retry_eligible: is_retry_eligible(&error_code),
            error_code,
            error_message,
            attempt,
            created_at: now,
        }
    }
}
