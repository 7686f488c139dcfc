use super::executor::PaymentAttemptExecutor;
use super::in_flight::InFlightSet;
use super::outcome::{publish, resolve_attempt};
use crate::domain::classifier::GATEWAY_TIMEOUT;
use crate::domain::lifecycle::AttemptOutcome;
use crate::domain::ports::{ClockHandle, StateWrite, TransactionStoreHandle};
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::error::{ConflictReason, PaymentError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What a single scheduling pass found and did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassReport {
    /// Policies returned by the due query.
    pub due: usize,
    /// Transactions handed to a dispatch task.
    pub dispatched: usize,
    /// Transactions skipped because a dispatch for them was still running.
    pub skipped: usize,
}

/// Counts a running dispatch for as long as it is alive.
struct ActiveDispatch(Arc<AtomicUsize>);

impl ActiveDispatch {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for ActiveDispatch {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Periodically finds due retries and dispatches them concurrently.
///
/// A transaction is dispatched at most once at a time: the pass claims its
/// ID in the in-flight set before spawning and the claim is released when the
/// dispatch task ends, however it ends.
pub struct RetryScheduler {
    store: TransactionStoreHandle,
    executor: PaymentAttemptExecutor,
    clock: ClockHandle,
    in_flight: InFlightSet,
    active: Arc<AtomicUsize>,
    dispatches: Mutex<JoinSet<()>>,
    poll_period: Duration,
    stale_after: Option<Duration>,
}

impl RetryScheduler {
    pub fn new(
        store: TransactionStoreHandle,
        executor: PaymentAttemptExecutor,
        clock: ClockHandle,
        poll_period: Duration,
        stale_after: Option<Duration>,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            in_flight: InFlightSet::new(),
            active: Arc::new(AtomicUsize::new(0)),
            dispatches: Mutex::new(JoinSet::new()),
            poll_period,
            stale_after,
        }
    }

    pub fn active_dispatches(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> &InFlightSet {
        &self.in_flight
    }

    /// Runs one scheduling pass against `now`.
    ///
    /// Every due transaction not already claimed gets its own dispatch task;
    /// the pass does not wait for them.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<PassReport> {
        let due = self
            .store
            .find_due_policies(now, &TransactionStatus::SCHEDULABLE)
            .await?;

        let mut report = PassReport {
            due: due.len(),
            ..PassReport::default()
        };
        if due.is_empty() {
            debug!(%now, "no retries due");
            return Ok(report);
        }
        info!(%now, due = report.due, active = self.active_dispatches(), "retry pass started");

        let mut dispatches = self.dispatches.lock().await;
        while let Some(joined) = dispatches.try_join_next() {
            log_join(joined);
        }

        for policy in due {
            let tx_id = policy.transaction_id;
            let Some(claim) = self.in_flight.claim(tx_id) else {
                debug!(transaction_id = %tx_id, "retry already in flight, skipping");
                report.skipped += 1;
                continue;
            };

            let active = ActiveDispatch::enter(&self.active);
            let dispatcher = Dispatcher {
                store: self.store.clone(),
                executor: self.executor.clone(),
            };
            dispatches.spawn(async move {
                let _claim = claim;
                let _active = active;
                dispatcher.dispatch(tx_id, now).await;
            });
            report.dispatched += 1;
        }

        info!(
            dispatched = report.dispatched,
            skipped = report.skipped,
            "retry pass finished"
        );
        Ok(report)
    }

    /// Waits for every dispatch started so far and for the submissions they
    /// handed to the executor.
    pub async fn drain(&self) {
        loop {
            let mut pending = std::mem::take(&mut *self.dispatches.lock().await);
            if pending.is_empty() {
                break;
            }
            while let Some(joined) = pending.join_next().await {
                log_join(joined);
            }
        }
        self.executor.settle().await;
    }

    /// Closes attempts that have waited longer than the stale window for a
    /// callback, as if the gateway had timed out. Returns how many were closed.
    pub async fn sweep_stale(&self, now: DateTime<Utc>) -> Result<usize> {
        let Some(window) = self.stale_after else {
            return Ok(0);
        };
        let window = TimeDelta::from_std(window).map_err(|e| {
            PaymentError::ValidationError(format!("stale window out of range: {}", e))
        })?;

        let candidates = self
            .store
            .find_in_status(&[TransactionStatus::Pending, TransactionStatus::RetryInProgress])
            .await?;

        let mut closed = 0;
        for tx in candidates.into_iter().filter(|tx| is_stale(tx, now, window)) {
            let Some(_claim) = self.in_flight.claim(tx.id) else {
                continue;
            };
            let outcome = AttemptOutcome::Declined {
                error_code: GATEWAY_TIMEOUT.to_string(),
                error_message: Some(format!(
                    "no gateway callback within {}s",
                    window.num_seconds()
                )),
            };
            match resolve_attempt(self.store.as_ref(), tx.id, outcome, now).await {
                Ok((tx, applied)) => {
                    warn!(
                        transaction_id = %tx.id,
                        resolution = ?applied.resolution,
                        "stale attempt closed as gateway timeout"
                    );
                    publish(self.executor.notifier().as_ref(), &tx).await;
                    closed += 1;
                }
                Err(PaymentError::StateConflict(
                    ConflictReason::AlreadySucceeded | ConflictReason::NoAttemptInFlight(_),
                ))
                | Err(PaymentError::ConcurrentModification(_)) => {
                    debug!(transaction_id = %tx.id, "stale attempt resolved concurrently");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(closed)
    }

    /// Polls until `shutdown` flips to `true`, then drains running work.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(poll_period = ?self.poll_period, "retry scheduler started");
        let mut ticker = tokio::time::interval(self.poll_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = self.clock.now();
                    if let Err(e) = self.sweep_stale(now).await {
                        error!(error = %e, "stale sweep failed");
                    }
                    if let Err(e) = self.run_once(now).await {
                        error!(error = %e, "retry pass failed");
                    }
                }
            }
        }

        info!(active = self.active_dispatches(), "retry scheduler draining");
        self.drain().await;
        info!("retry scheduler stopped");
    }
}

fn is_stale(tx: &Transaction, now: DateTime<Utc>, window: TimeDelta) -> bool {
    tx.has_attempt_in_flight() && tx.updated_at + window <= now
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "retry dispatch task panicked");
    }
}

/// The part of a dispatch that runs on its own task.
struct Dispatcher {
    store: TransactionStoreHandle,
    executor: PaymentAttemptExecutor,
}

impl Dispatcher {
    async fn dispatch(&self, tx_id: TransactionId, now: DateTime<Utc>) {
        match self.begin_retry(tx_id, now).await {
            Ok(Some(tx)) => {
                if let Err(e) = self.executor.attempt(tx).await {
                    error!(transaction_id = %tx_id, error = %e, "retry could not be submitted");
                    self.fail(tx_id, e).await;
                }
            }
            Ok(None) => debug!(transaction_id = %tx_id, "retry no longer due"),
            Err(PaymentError::ConcurrentModification(_)) => {
                debug!(
                    transaction_id = %tx_id,
                    "transaction changed during dispatch, left for a later pass"
                );
            }
            Err(e) => {
                error!(transaction_id = %tx_id, error = %e, "retry dispatch failed");
                self.fail(tx_id, e).await;
            }
        }
    }

    /// Re-checks eligibility against fresh state, then records the attempt
    /// as started and debits the budget in one write.
    async fn begin_retry(
        &self,
        tx_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Option<Transaction>> {
        let Some(mut tx) = self.store.get(tx_id).await? else {
            return Ok(None);
        };
        let Some(mut policy) = self.store.get_policy(tx_id).await? else {
            return Ok(None);
        };
        if !tx.status.is_schedulable() || !policy.is_due(now) {
            return Ok(None);
        }

        tx.mark_retry_in_progress(now);
        let attempt = policy.record_attempt_start(now)?;
        self.store
            .commit(StateWrite::new(tx.clone()).with_policy(Some(policy.clone())))
            .await?;
        tx.version += 1;

        info!(
            transaction_id = %tx_id,
            attempt,
            max_attempts = policy.max_attempts,
            "retry attempt started"
        );
        Ok(Some(tx))
    }

    async fn fail(&self, tx_id: TransactionId, cause: PaymentError) {
        if let Err(e) = self.executor.fail_attempt(tx_id, cause.to_string()).await {
            error!(transaction_id = %tx_id, error = %e, "could not record dispatch failure");
        }
    }
}
