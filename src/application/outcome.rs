use crate::domain::lifecycle::{Applied, AttemptOutcome, apply_outcome};
use crate::domain::ports::{
    StateWrite, TransactionNotification, TransactionNotifier, TransactionStore,
};
use crate::domain::transaction::{Transaction, TransactionId};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

/// How many times a transition is re-applied after losing a race on the row.
pub(crate) const MAX_COMMIT_ATTEMPTS: usize = 3;

/// Loads the transaction and its policy, applies `outcome` and commits the
/// result as one write. Reloads and re-applies when another writer got there
/// first.
pub(crate) async fn resolve_attempt(
    store: &dyn TransactionStore,
    tx_id: TransactionId,
    outcome: AttemptOutcome,
    now: DateTime<Utc>,
) -> Result<(Transaction, Applied)> {
    let mut attempt = 1;
    loop {
        let mut tx = store
            .get(tx_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("Transaction", tx_id))?;
        let mut policy = store.get_policy(tx_id).await?;

        let applied = apply_outcome(&mut tx, &mut policy, outcome.clone(), now)?;
        let write = StateWrite::new(tx.clone())
            .with_policy(policy)
            .with_error_entry(applied.error_entry.clone());

        match store.commit(write).await {
            Ok(()) => {
                tx.version += 1;
                return Ok((tx, applied));
            }
            Err(PaymentError::ConcurrentModification(_)) if attempt < MAX_COMMIT_ATTEMPTS => {
                debug!(
                    transaction_id = %tx_id,
                    attempt,
                    "transaction changed underneath, re-applying outcome"
                );
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Announces the committed status of `tx`. The outcome is already durable,
/// so a delivery failure is logged and not returned.
pub(crate) async fn publish(notifier: &dyn TransactionNotifier, tx: &Transaction) {
    if let Err(e) = notifier.notify(TransactionNotification::from(tx)).await {
        warn!(transaction_id = %tx.id, error = %e, "transaction notification not delivered");
    }
}
