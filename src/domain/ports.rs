use super::error_entry::ErrorEntry;
use super::retry_policy::RetryPolicy;
use super::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One atomic write against the store.
///
/// The transaction, its policy and an optional error entry are persisted
/// together or not at all. `transaction.version` must equal the stored
/// version; the store bumps it on success.
#[derive(Debug, Clone)]
pub struct StateWrite {
    pub transaction: Transaction,
    pub policy: Option<RetryPolicy>,
    pub error_entry: Option<ErrorEntry>,
}

impl StateWrite {
    pub fn new(transaction: Transaction) -> Self {
        Self {
            transaction,
            policy: None,
            error_entry: None,
        }
    }

    pub fn with_policy(mut self, policy: Option<RetryPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_error_entry(mut self, entry: Option<ErrorEntry>) -> Self {
        self.error_entry = entry;
        self
    }
}

/// Rejects a policy that belongs to a different transaction than `tx`.
pub(crate) fn check_policy_owner(tx: &Transaction, policy: Option<&RetryPolicy>) -> Result<()> {
    match policy {
        Some(p) if p.transaction_id != tx.id => Err(PaymentError::ValidationError(format!(
            "Retry policy for {} cannot be attached to {}",
            p.transaction_id, tx.id
        ))),
        _ => Ok(()),
    }
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Persists a newly created transaction and its optional policy.
    async fn insert(&self, tx: Transaction, policy: Option<RetryPolicy>) -> Result<()>;
    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>>;
    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Transaction>>;
    async fn get_policy(&self, tx_id: TransactionId) -> Result<Option<RetryPolicy>>;
    /// Error entries of a transaction in creation order.
    async fn error_entries(&self, tx_id: TransactionId) -> Result<Vec<ErrorEntry>>;
    /// Policies due at `now` whose budget is not spent and whose transaction is
    /// in one of `statuses`, earliest `next_retry_at` first.
    async fn find_due_policies(
        &self,
        now: DateTime<Utc>,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<RetryPolicy>>;
    async fn find_in_status(&self, statuses: &[TransactionStatus]) -> Result<Vec<Transaction>>;
    async fn all(&self) -> Result<Vec<Transaction>>;
    async fn commit(&self, write: StateWrite) -> Result<()>;
}

/// The external payment gateway.
///
/// `submit_payment` hands the attempt over; the outcome arrives later as a
/// callback correlated by the transaction's external reference. An `Err`
/// means the attempt never reached the gateway.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn submit_payment(&self, tx: &Transaction) -> Result<()>;
}

/// Tells interested parties that a transaction settled into a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionNotification {
    pub transaction_id: TransactionId,
    pub status: TransactionStatus,
}

impl From<&Transaction> for TransactionNotification {
    fn from(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            status: tx.status,
        }
    }
}

/// Outbound notifications, published after an outcome has been committed.
#[async_trait]
pub trait TransactionNotifier: Send + Sync {
    async fn notify(&self, notification: TransactionNotification) -> Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub type TransactionStoreHandle = Arc<dyn TransactionStore>;
pub type PaymentGatewayHandle = Arc<dyn PaymentGateway>;
pub type TransactionNotifierHandle = Arc<dyn TransactionNotifier>;
pub type ClockHandle = Arc<dyn Clock>;
