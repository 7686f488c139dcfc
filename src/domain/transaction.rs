use crate::error::{ConflictReason, PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

pub type TransactionId = Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Hash, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    RetryScheduled,
    RetryInProgress,
    Success,
    Failed,
}

impl TransactionStatus {
    /// Statuses the scheduler may pick a due retry from.
    pub const SCHEDULABLE: [TransactionStatus; 2] =
        [TransactionStatus::Failed, TransactionStatus::RetryScheduled];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::RetryScheduled => "RETRY_SCHEDULED",
            TransactionStatus::RetryInProgress => "RETRY_IN_PROGRESS",
            TransactionStatus::Success => "SUCCESS",
            TransactionStatus::Failed => "FAILED",
        }
    }

    pub fn is_schedulable(&self) -> bool {
        Self::SCHEDULABLE.contains(self)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A strictly positive payment amount.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// The lifecycle record of one payment.
///
/// `version` is bumped by the store on every committed write and is used to
/// detect concurrent modification of the same row.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub owner: String,
    pub amount: Amount,
    pub currency: String,
    pub gateway: String,
    pub status: TransactionStatus,
    pub external_reference_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl Transaction {
    pub fn new(
        owner: impl Into<String>,
        amount: Amount,
        currency: &str,
        gateway: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Owner reference is required".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            owner,
            amount,
            currency: normalize_currency(currency)?,
            gateway: gateway.into(),
            status: TransactionStatus::Pending,
            external_reference_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            version: 0,
        })
    }

    /// Records the first gateway submission. The reference can never change afterwards.
    pub fn assign_external_reference(
        &mut self,
        reference: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.external_reference_id.is_some() {
            return Err(ConflictReason::ReferenceAlreadyAssigned.into());
        }
        if self.status != TransactionStatus::Pending {
            return Err(ConflictReason::NotPending(self.status).into());
        }
        self.external_reference_id = Some(reference.into());
        self.updated_at = now;
        Ok(())
    }

    /// True while an attempt has been handed to the gateway and no outcome is known yet.
    pub fn has_attempt_in_flight(&self) -> bool {
        match self.status {
            TransactionStatus::Pending => self.external_reference_id.is_some(),
            TransactionStatus::RetryInProgress => true,
            _ => false,
        }
    }

    pub fn mark_retry_in_progress(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::RetryInProgress;
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::RetryScheduled;
        self.updated_at = now;
    }

    pub fn complete(&mut self, completed_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = TransactionStatus::Success;
        self.completed_at = Some(completed_at);
        self.updated_at = now;
    }

    pub fn fail(&mut self, now: DateTime<Utc>) {
        self.status = TransactionStatus::Failed;
        self.updated_at = now;
    }
}

fn normalize_currency(code: &str) -> Result<String> {
    let code = code.trim();
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(PaymentError::ValidationError(format!(
            "Invalid currency code '{}'",
            code
        )))
    }
}
