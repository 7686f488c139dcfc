use crate::domain::transaction::TransactionId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Transaction IDs that currently have a retry dispatch running.
///
/// `try_claim` is an atomic insert-if-absent; `release` is unconditional and
/// idempotent. Clones share the same set.
#[derive(Debug, Default, Clone)]
pub struct InFlightSet {
    ids: Arc<Mutex<HashSet<TransactionId>>>,
}

impl InFlightSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn ids(&self) -> MutexGuard<'_, HashSet<TransactionId>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` when the caller now owns the claim.
    pub fn try_claim(&self, tx_id: TransactionId) -> bool {
        self.ids().insert(tx_id)
    }

    pub fn release(&self, tx_id: TransactionId) {
        self.ids().remove(&tx_id);
    }

    /// Claims `tx_id` and returns a guard that releases it on drop.
    pub fn claim(&self, tx_id: TransactionId) -> Option<Claim> {
        self.try_claim(tx_id).then(|| Claim {
            set: self.clone(),
            tx_id,
        })
    }

    pub fn contains(&self, tx_id: TransactionId) -> bool {
        self.ids().contains(&tx_id)
    }

    pub fn len(&self) -> usize {
        self.ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids().is_empty()
    }
}

/// Ownership of one in-flight slot. Dropping it (including on panic or task
/// abort) releases the transaction.
#[derive(Debug)]
pub struct Claim {
    set: InFlightSet,
    tx_id: TransactionId,
}

impl Claim {
    pub fn tx_id(&self) -> TransactionId {
        self.tx_id
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set.release(self.tx_id);
    }
}
