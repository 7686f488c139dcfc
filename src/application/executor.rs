use super::outcome::{publish, resolve_attempt};
use crate::domain::lifecycle::{AttemptOutcome, Resolution};
use crate::domain::ports::{
    ClockHandle, PaymentGatewayHandle, StateWrite, TransactionNotifierHandle,
    TransactionStoreHandle,
};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::error::{ConflictReason, PaymentError, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Hands payment attempts to the gateway without waiting for their outcome.
///
/// Each submission runs on its own task. The outcome arrives later through
/// the callback path; if the submission itself breaks, the transaction is
/// closed as FAILED with an `ASYNC_EXECUTION_ERROR` entry so it cannot stay
/// in flight forever. Clones share the same task set.
#[derive(Clone)]
pub struct PaymentAttemptExecutor {
    store: TransactionStoreHandle,
    gateway: PaymentGatewayHandle,
    notifier: TransactionNotifierHandle,
    clock: ClockHandle,
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl PaymentAttemptExecutor {
    pub fn new(
        store: TransactionStoreHandle,
        gateway: PaymentGatewayHandle,
        notifier: TransactionNotifierHandle,
        clock: ClockHandle,
    ) -> Self {
        Self {
            store,
            gateway,
            notifier,
            clock,
            tasks: Arc::new(Mutex::new(JoinSet::new())),
        }
    }

    /// Starts the first attempt of a PENDING transaction.
    ///
    /// Assigns a fresh external reference, persists it and submits. The
    /// first attempt does not consume retry budget.
    pub async fn initiate(&self, tx_id: TransactionId) -> Result<Transaction> {
        let mut tx = self
            .store
            .get(tx_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("Transaction", tx_id))?;

        tx.assign_external_reference(Uuid::new_v4().to_string(), self.clock.now())?;
        self.store.commit(StateWrite::new(tx.clone())).await?;
        tx.version += 1;

        info!(
            transaction_id = %tx.id,
            external_reference_id = ?tx.external_reference_id,
            "payment initiated"
        );
        self.attempt(tx.clone()).await?;
        Ok(tx)
    }

    /// Submits an attempt that has already been recorded as in flight and
    /// returns without waiting for the gateway.
    pub async fn attempt(&self, tx: Transaction) -> Result<()> {
        if !tx.has_attempt_in_flight() {
            return Err(ConflictReason::NoAttemptInFlight(tx.status).into());
        }

        let executor = self.clone();
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move { executor.submit(tx).await });
        Ok(())
    }

    async fn submit(&self, tx: Transaction) {
        let tx_id = tx.id;
        let gateway = self.gateway.clone();
        // A nested task so a panicking gateway still yields a JoinError we can act on.
        let submission = tokio::spawn(async move { gateway.submit_payment(&tx).await });

        let result = match submission.await {
            Ok(result) => result,
            Err(join_error) => Err(PaymentError::internal(format!(
                "gateway submission aborted: {}",
                join_error
            ))),
        };

        match result {
            Ok(()) => debug!(transaction_id = %tx_id, "attempt handed to gateway"),
            Err(e) => {
                error!(
                    transaction_id = %tx_id,
                    error = %e,
                    "payment attempt failed before reaching gateway"
                );
                if let Err(e) = self.fail_attempt(tx_id, e.to_string()).await {
                    error!(
                        transaction_id = %tx_id,
                        error = %e,
                        "could not record execution failure"
                    );
                }
            }
        }
    }

    /// Closes an attempt that broke outside the normal callback path.
    ///
    /// Returns `None` when the transaction had already succeeded, in which
    /// case nothing is changed.
    pub async fn fail_attempt(
        &self,
        tx_id: TransactionId,
        message: impl Into<String>,
    ) -> Result<Option<Resolution>> {
        let outcome = AttemptOutcome::ExecutionFault {
            message: message.into(),
        };
        match resolve_attempt(self.store.as_ref(), tx_id, outcome, self.clock.now()).await {
            Ok((tx, applied)) => {
                warn!(
                    transaction_id = %tx.id,
                    status = %tx.status,
                    "attempt closed as execution failure"
                );
                publish(self.notifier.as_ref(), &tx).await;
                Ok(Some(applied.resolution))
            }
            Err(PaymentError::StateConflict(ConflictReason::AlreadySucceeded)) => {
                debug!(
                    transaction_id = %tx_id,
                    "execution failure ignored, transaction already succeeded"
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Waits until every submission started so far has finished, including
    /// ones started while waiting.
    pub async fn settle(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.tasks.lock().await);
            if pending.is_empty() {
                return;
            }
            while let Some(joined) = pending.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "attempt task panicked");
                }
            }
        }
    }

    pub(crate) fn notifier(&self) -> &TransactionNotifierHandle {
        &self.notifier
    }

    pub async fn pending_submissions(&self) -> usize {
        self.tasks.lock().await.len()
    }
}
