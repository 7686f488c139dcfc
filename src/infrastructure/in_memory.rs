use crate::domain::error_entry::ErrorEntry;
use crate::domain::ports::{StateWrite, TransactionStore, check_policy_owner};
use crate::domain::retry_policy::RetryPolicy;
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::error::{ConflictReason, PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Default)]
struct State {
    transactions: HashMap<TransactionId, Transaction>,
    external_refs: HashMap<String, TransactionId>,
    policies: HashMap<TransactionId, RetryPolicy>,
    error_entries: HashMap<TransactionId, Vec<ErrorEntry>>,
}

impl State {
    fn claim_reference(&mut self, tx: &Transaction) -> Result<()> {
        let Some(reference) = tx.external_reference_id.as_ref() else {
            return Ok(());
        };
        match self.external_refs.get(reference) {
            Some(owner) if *owner != tx.id => Err(ConflictReason::DuplicateReference.into()),
            Some(_) => Ok(()),
            None => {
                self.external_refs.insert(reference.clone(), tx.id);
                Ok(())
            }
        }
    }
}

/// A thread-safe in-memory store for transactions, retry policies and error entries.
///
/// All maps live behind a single `RwLock`, so every commit is applied
/// atomically with respect to readers and other writers.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: Transaction, policy: Option<RetryPolicy>) -> Result<()> {
        let mut state = self.state.write().await;
        if state.transactions.contains_key(&tx.id) {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} already exists",
                tx.id
            )));
        }
        check_policy_owner(&tx, policy.as_ref())?;
        state.claim_reference(&tx)?;

        if let Some(policy) = policy {
            state.policies.insert(tx.id, policy);
        }
        state.transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state.transactions.get(&tx_id).cloned())
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .external_refs
            .get(external_ref)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn get_policy(&self, tx_id: TransactionId) -> Result<Option<RetryPolicy>> {
        let state = self.state.read().await;
        Ok(state.policies.get(&tx_id).cloned())
    }

    async fn error_entries(&self, tx_id: TransactionId) -> Result<Vec<ErrorEntry>> {
        let state = self.state.read().await;
        Ok(state.error_entries.get(&tx_id).cloned().unwrap_or_default())
    }

    async fn find_due_policies(
        &self,
        now: DateTime<Utc>,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<RetryPolicy>> {
        let state = self.state.read().await;
        let mut due: Vec<RetryPolicy> = state
            .policies
            .values()
            .filter(|p| p.is_due(now))
            .filter(|p| {
                state
                    .transactions
                    .get(&p.transaction_id)
                    .is_some_and(|tx| statuses.contains(&tx.status))
            })
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.next_retry_at, p.transaction_id));
        Ok(due)
    }

    async fn find_in_status(&self, statuses: &[TransactionStatus]) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut found: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| statuses.contains(&tx.status))
            .cloned()
            .collect();
        found.sort_by_key(|tx| (tx.updated_at, tx.id));
        Ok(found)
    }

    async fn all(&self) -> Result<Vec<Transaction>> {
        let state = self.state.read().await;
        let mut all: Vec<Transaction> = state.transactions.values().cloned().collect();
        all.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(all)
    }

    async fn commit(&self, write: StateWrite) -> Result<()> {
        let StateWrite {
            mut transaction,
            policy,
            error_entry,
        } = write;

        let mut state = self.state.write().await;
        let stored = state
            .transactions
            .get(&transaction.id)
            .ok_or_else(|| PaymentError::not_found("Transaction", transaction.id))?;

        if stored.version != transaction.version {
            return Err(PaymentError::ConcurrentModification(transaction.id));
        }
        if stored.external_reference_id.is_some()
            && stored.external_reference_id != transaction.external_reference_id
        {
            return Err(ConflictReason::ReferenceAlreadyAssigned.into());
        }
        check_policy_owner(&transaction, policy.as_ref())?;
        state.claim_reference(&transaction)?;

        transaction.version += 1;
        if let Some(policy) = policy {
            state.policies.insert(transaction.id, policy);
        }
        if let Some(entry) = error_entry {
            state
                .error_entries
                .entry(transaction.id)
                .or_default()
                .push(entry);
        }
        state.transactions.insert(transaction.id, transaction);
        Ok(())
    }
}
