use super::outcome::{publish, resolve_attempt};
use crate::domain::classifier::UNKNOWN_ERROR;
use crate::domain::lifecycle::{AttemptOutcome, Resolution};
use crate::domain::ports::{ClockHandle, TransactionNotifierHandle, TransactionStoreHandle};
use crate::error::{ConflictReason, PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallbackStatus {
    Success,
    Failed,
}

/// An asynchronous outcome notification from the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayCallback {
    pub external_reference_id: String,
    pub status: CallbackStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub event_time: DateTime<Utc>,
}

impl GatewayCallback {
    pub fn success(external_reference_id: impl Into<String>, event_time: DateTime<Utc>) -> Self {
        Self {
            external_reference_id: external_reference_id.into(),
            status: CallbackStatus::Success,
            error_code: None,
            error_message: None,
            event_time,
        }
    }

    pub fn failure(
        external_reference_id: impl Into<String>,
        error_code: impl Into<String>,
        error_message: Option<String>,
        event_time: DateTime<Utc>,
    ) -> Self {
        Self {
            external_reference_id: external_reference_id.into(),
            status: CallbackStatus::Failed,
            error_code: Some(error_code.into()),
            error_message,
            event_time,
        }
    }

    fn into_outcome(self) -> AttemptOutcome {
        match self.status {
            CallbackStatus::Success => AttemptOutcome::Succeeded {
                completed_at: self.event_time,
            },
            CallbackStatus::Failed => AttemptOutcome::Declined {
                error_code: self
                    .error_code
                    .filter(|code| !code.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
                error_message: self.error_message,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallbackResult {
    /// The callback changed the transaction.
    Applied(Resolution),
    /// The callback was a redelivery or arrived with no attempt to settle.
    Discarded(ConflictReason),
}

/// Correlates gateway callbacks to transactions and applies their outcome.
///
/// Every applied callback is followed by one notification carrying the new
/// status. Discarded callbacks publish nothing.
#[derive(Clone)]
pub struct CallbackProcessor {
    store: TransactionStoreHandle,
    notifier: TransactionNotifierHandle,
    clock: ClockHandle,
}

impl CallbackProcessor {
    pub fn new(
        store: TransactionStoreHandle,
        notifier: TransactionNotifierHandle,
        clock: ClockHandle,
    ) -> Self {
        Self {
            store,
            notifier,
            clock,
        }
    }

    /// Applies one callback.
    ///
    /// Unknown references are an error and change nothing. Callbacks for a
    /// transaction that already succeeded, or a failure for a transaction with
    /// no attempt in flight, are discarded without side effects.
    pub async fn handle_callback(&self, callback: GatewayCallback) -> Result<CallbackResult> {
        let tx = self
            .store
            .find_by_external_ref(&callback.external_reference_id)
            .await?
            .ok_or_else(|| {
                PaymentError::not_found("Transaction", &callback.external_reference_id)
            })?;

        let status = callback.status;
        let outcome = callback.into_outcome();
        match resolve_attempt(self.store.as_ref(), tx.id, outcome, self.clock.now()).await {
            Ok((tx, applied)) => {
                info!(
                    transaction_id = %tx.id,
                    callback = ?status,
                    status = %tx.status,
                    resolution = ?applied.resolution,
                    "callback applied"
                );
                publish(self.notifier.as_ref(), &tx).await;
                Ok(CallbackResult::Applied(applied.resolution))
            }
            Err(PaymentError::StateConflict(
                reason @ (ConflictReason::AlreadySucceeded | ConflictReason::NoAttemptInFlight(_)),
            )) => {
                debug!(transaction_id = %tx.id, reason = %reason, "callback discarded");
                Ok(CallbackResult::Discarded(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Handles every callback already queued on `rx` without waiting for more.
    /// Returns how many were taken off the queue.
    pub async fn drain_pending(&self, rx: &mut mpsc::UnboundedReceiver<GatewayCallback>) -> usize {
        let mut handled = 0;
        while let Ok(callback) = rx.try_recv() {
            self.handle_logged(callback).await;
            handled += 1;
        }
        handled
    }

    /// Consumes callbacks until the channel closes or shutdown is signalled,
    /// then handles whatever is still queued.
    pub async fn run(
        self,
        mut rx: mpsc::UnboundedReceiver<GatewayCallback>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("callback processor started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = rx.recv() => match received {
                    Some(callback) => self.handle_logged(callback).await,
                    None => break,
                },
            }
        }
        let drained = self.drain_pending(&mut rx).await;
        info!(drained, "callback processor stopped");
    }

    async fn handle_logged(&self, callback: GatewayCallback) {
        let reference = callback.external_reference_id.clone();
        if let Err(e) = self.handle_callback(callback).await {
            warn!(external_reference_id = %reference, error = %e, "callback rejected");
        }
    }
}
