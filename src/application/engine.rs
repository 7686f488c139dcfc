use super::callback::{CallbackProcessor, CallbackResult, GatewayCallback};
use super::executor::PaymentAttemptExecutor;
use super::outcome::MAX_COMMIT_ATTEMPTS;
use super::scheduler::RetryScheduler;
use crate::config::{RetryConfig, RetrySettings};
use crate::domain::error_entry::ErrorEntry;
use crate::domain::ports::{
    ClockHandle, PaymentGatewayHandle, StateWrite, TransactionNotifierHandle,
    TransactionStoreHandle,
};
use crate::domain::retry_policy::RetryPolicy;
use crate::domain::transaction::{Amount, Transaction, TransactionId, TransactionStatus};
use crate::error::{ConflictReason, PaymentError, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub const DEFAULT_GATEWAY: &str = "DEFAULT_GATEWAY";

/// A request to create a payment.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub owner: String,
    pub amount: Amount,
    pub currency: String,
    pub gateway: Option<String>,
    /// `None` means the payment is never retried automatically.
    pub retry: Option<RetrySettings>,
}

/// A transaction together with the figures a report needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionSummary {
    pub transaction: Transaction,
    pub attempts: u32,
    pub errors: usize,
    pub last_error_code: Option<String>,
}

/// The main entry point of the retry core.
///
/// `PaymentRetryEngine` wires the executor, callback processor and scheduler
/// to one store, gateway and clock, and exposes the operations callers use to
/// create payments, feed gateway callbacks and manage retries.
pub struct PaymentRetryEngine {
    store: TransactionStoreHandle,
    clock: ClockHandle,
    config: RetryConfig,
    executor: PaymentAttemptExecutor,
    callbacks: CallbackProcessor,
    scheduler: Arc<RetryScheduler>,
}

impl PaymentRetryEngine {
    pub fn new(
        store: TransactionStoreHandle,
        gateway: PaymentGatewayHandle,
        notifier: TransactionNotifierHandle,
        clock: ClockHandle,
        config: RetryConfig,
    ) -> Result<Self> {
        config.validate()?;
        let executor = PaymentAttemptExecutor::new(
            store.clone(),
            gateway,
            notifier.clone(),
            clock.clone(),
        );
        let callbacks = CallbackProcessor::new(store.clone(), notifier, clock.clone());
        let scheduler = Arc::new(RetryScheduler::new(
            store.clone(),
            executor.clone(),
            clock.clone(),
            config.poll_period,
            config.stale_after,
        ));
        Ok(Self {
            store,
            clock,
            config,
            executor,
            callbacks,
            scheduler,
        })
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn executor(&self) -> &PaymentAttemptExecutor {
        &self.executor
    }

    pub fn callbacks(&self) -> &CallbackProcessor {
        &self.callbacks
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    /// Creates a PENDING transaction and, when retries are allowed, its policy.
    pub async fn create_transaction(&self, request: NewPayment) -> Result<Transaction> {
        let now = self.clock.now();
        let tx = Transaction::new(
            request.owner,
            request.amount,
            &request.currency,
            request.gateway.unwrap_or_else(|| DEFAULT_GATEWAY.to_string()),
            now,
        )?;
        let policy = request
            .retry
            .map(|settings| self.config.build_policy(tx.id, &settings, now))
            .transpose()?;

        info!(
            transaction_id = %tx.id,
            owner = %tx.owner,
            amount = %tx.amount.value(),
            currency = %tx.currency,
            max_attempts = policy.as_ref().map(|p| p.max_attempts),
            "transaction created"
        );
        self.store.insert(tx.clone(), policy).await?;
        Ok(tx)
    }

    /// Creates a transaction and immediately starts its first attempt.
    pub async fn submit(&self, request: NewPayment) -> Result<Transaction> {
        let tx = self.create_transaction(request).await?;
        self.initiate(tx.id).await
    }

    pub async fn initiate(&self, tx_id: TransactionId) -> Result<Transaction> {
        self.executor.initiate(tx_id).await
    }

    pub async fn handle_callback(&self, callback: GatewayCallback) -> Result<CallbackResult> {
        self.callbacks.handle_callback(callback).await
    }

    /// Makes a FAILED transaction due for retry immediately.
    ///
    /// The next scheduler pass picks it up; this call never dispatches on its
    /// own, so a manual retry cannot race a scheduled one.
    pub async fn request_manual_retry(&self, tx_id: TransactionId) -> Result<RetryPolicy> {
        let mut attempt = 1;
        loop {
            let mut tx = self.transaction(tx_id).await?;
            if tx.status != TransactionStatus::Failed {
                return Err(ConflictReason::NotFailed(tx.status).into());
            }
            let mut policy = self
                .store
                .get_policy(tx_id)
                .await?
                .ok_or(ConflictReason::NoRetryPolicy)?;
            if policy.is_exhausted() {
                return Err(ConflictReason::RetriesExhausted {
                    attempts: policy.current_attempts,
                    max_attempts: policy.max_attempts,
                }
                .into());
            }

            let now = self.clock.now();
            policy.arm(now, now);
            tx.schedule_retry(now);
            match self
                .store
                .commit(StateWrite::new(tx).with_policy(Some(policy.clone())))
                .await
            {
                Ok(()) => {
                    info!(
                        transaction_id = %tx_id,
                        remaining = policy.remaining_attempts(),
                        "manual retry scheduled"
                    );
                    return Ok(policy);
                }
                Err(PaymentError::ConcurrentModification(_)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    debug!(transaction_id = %tx_id, attempt, "manual retry raced another update");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Creates or adjusts the retry policy of a transaction.
    ///
    /// Attempts already spent and any armed retry time are kept. The budget
    /// can be raised or lowered, but never below the attempts already used,
    /// and never so low that an already scheduled retry could not run.
    pub async fn update_retry_policy(
        &self,
        tx_id: TransactionId,
        settings: RetrySettings,
    ) -> Result<RetryPolicy> {
        let mut attempt = 1;
        loop {
            let tx = self.transaction(tx_id).await?;
            if tx.status == TransactionStatus::Success {
                return Err(ConflictReason::AlreadySucceeded.into());
            }
            let now = self.clock.now();

            let policy = match self.store.get_policy(tx_id).await? {
                None => self.config.build_policy(tx_id, &settings, now)?,
                Some(mut policy) => {
                    if let Some(max_attempts) = settings.max_attempts {
                        // A scheduled retry still needs room for the attempt it is waiting on.
                        let floor = if tx.status == TransactionStatus::RetryScheduled {
                            policy.current_attempts + 1
                        } else {
                            policy.current_attempts.max(1)
                        };
                        if max_attempts < floor {
                            return Err(PaymentError::ValidationError(format!(
                                "max_attempts {} is below the minimum of {} for this transaction",
                                max_attempts, floor
                            )));
                        }
                        policy.max_attempts = max_attempts;
                    }
                    if let Some(base_interval) = settings.base_interval {
                        self.config.check_base_interval(base_interval)?;
                        policy.base_interval = base_interval;
                    }
                    if let Some(strategy) = settings.strategy {
                        policy.strategy = strategy;
                    }
                    policy.updated_at = now;
                    policy
                }
            };

            match self
                .store
                .commit(StateWrite::new(tx).with_policy(Some(policy.clone())))
                .await
            {
                Ok(()) => {
                    info!(
                        transaction_id = %tx_id,
                        max_attempts = policy.max_attempts,
                        strategy = ?policy.strategy,
                        "retry policy updated"
                    );
                    return Ok(policy);
                }
                Err(PaymentError::ConcurrentModification(_)) if attempt < MAX_COMMIT_ATTEMPTS => {
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn transaction(&self, tx_id: TransactionId) -> Result<Transaction> {
        self.store
            .get(tx_id)
            .await?
            .ok_or_else(|| PaymentError::not_found("Transaction", tx_id))
    }

    pub async fn retry_policy(&self, tx_id: TransactionId) -> Result<Option<RetryPolicy>> {
        self.transaction(tx_id).await?;
        self.store.get_policy(tx_id).await
    }

    /// Error entries of a transaction, oldest first.
    pub async fn error_history(&self, tx_id: TransactionId) -> Result<Vec<ErrorEntry>> {
        self.transaction(tx_id).await?;
        self.store.error_entries(tx_id).await
    }

    pub async fn transactions(&self) -> Result<Vec<Transaction>> {
        self.store.all().await
    }

    /// True while some transaction still awaits a callback or a scheduled retry.
    pub async fn has_open_work(&self) -> Result<bool> {
        let open = self
            .store
            .find_in_status(&[
                TransactionStatus::Pending,
                TransactionStatus::RetryScheduled,
                TransactionStatus::RetryInProgress,
            ])
            .await?;
        Ok(open
            .iter()
            .any(|tx| tx.has_attempt_in_flight() || tx.status == TransactionStatus::RetryScheduled))
    }

    /// Every transaction with its attempt and error counts, in creation order.
    pub async fn summaries(&self) -> Result<Vec<TransactionSummary>> {
        let mut summaries = Vec::new();
        for transaction in self.store.all().await? {
            let attempts = self
                .store
                .get_policy(transaction.id)
                .await?
                .map_or(0, |p| p.current_attempts);
            let errors = self.store.error_entries(transaction.id).await?;
            summaries.push(TransactionSummary {
                attempts,
                errors: errors.len(),
                last_error_code: errors.last().map(|e| e.error_code.clone()),
                transaction,
            });
        }
        Ok(summaries)
    }

    /// Waits for all running dispatches and gateway submissions.
    pub async fn drain(&self) {
        self.scheduler.drain().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::PaymentGateway;
    use crate::domain::retry_policy::RetryStrategy;
    use crate::infrastructure::clock::ManualClock;
    use crate::infrastructure::in_memory::InMemoryTransactionStore;
    use crate::infrastructure::notifier::ChannelNotifier;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    struct SilentGateway;

    #[async_trait]
    impl PaymentGateway for SilentGateway {
        async fn submit_payment(&self, _tx: &Transaction) -> Result<()> {
            Ok(())
        }
    }

    fn engine() -> (PaymentRetryEngine, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let (notifier, _notifications) = ChannelNotifier::channel();
        let engine = PaymentRetryEngine::new(
            Arc::new(InMemoryTransactionStore::new()),
            Arc::new(SilentGateway),
            Arc::new(notifier),
            Arc::new(clock.clone()),
            RetryConfig::default(),
        )
        .unwrap();
        (engine, clock)
    }

    fn request(retry: Option<RetrySettings>) -> NewPayment {
        NewPayment {
            owner: "user-1".to_string(),
            amount: Amount::new(dec!(12.50)).unwrap(),
            currency: "usd".to_string(),
            gateway: None,
            retry,
        }
    }

    async fn failed(engine: &PaymentRetryEngine) -> Transaction {
        let tx = engine.submit(request(Some(RetrySettings::default()))).await.unwrap();
        engine.drain().await;
        engine
            .handle_callback(GatewayCallback::failure(
                tx.external_reference_id.clone().unwrap(),
                "INSUFFICIENT_FUNDS",
                None,
                Utc::now(),
            ))
            .await
            .unwrap();
        engine.transaction(tx.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_transaction_with_default_policy() {
        let (engine, _) = engine();

        let tx = engine.create_transaction(request(Some(RetrySettings::default()))).await.unwrap();

        assert_eq!(tx.status, TransactionStatus::Pending);
        assert_eq!(tx.gateway, DEFAULT_GATEWAY);
        let policy = engine.retry_policy(tx.id).await.unwrap().unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.strategy, RetryStrategy::Exponential);
    }

    #[tokio::test]
    async fn test_create_transaction_without_retries_has_no_policy() {
        let (engine, _) = engine();
        let tx = engine.create_transaction(request(None)).await.unwrap();
        assert!(engine.retry_policy(tx.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let (engine, _) = engine();
        let id = uuid::Uuid::new_v4();

        assert!(matches!(
            engine.request_manual_retry(id).await,
            Err(PaymentError::NotFound { .. })
        ));
        assert!(matches!(
            engine.error_history(id).await,
            Err(PaymentError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_manual_retry_arms_failed_transaction() {
        let (engine, clock) = engine();
        let tx = failed(&engine).await;
        assert_eq!(tx.status, TransactionStatus::Failed);

        let policy = engine.request_manual_retry(tx.id).await.unwrap();

        assert_eq!(policy.next_retry_at, Some(clock.now()));
        assert_eq!(policy.current_attempts, 0);
        assert_eq!(
            engine.transaction(tx.id).await.unwrap().status,
            TransactionStatus::RetryScheduled
        );
    }

    #[tokio::test]
    async fn test_manual_retry_conflicts_are_specific() {
        let (engine, _) = engine();

        let pending = engine
            .create_transaction(request(Some(RetrySettings::default())))
            .await
            .unwrap();
        assert!(matches!(
            engine.request_manual_retry(pending.id).await,
            Err(PaymentError::StateConflict(ConflictReason::NotFailed(TransactionStatus::Pending)))
        ));

        let tx = failed(&engine).await;
        engine
            .update_retry_policy(
                tx.id,
                RetrySettings {
                    max_attempts: Some(1),
                    ..RetrySettings::default()
                },
            )
            .await
            .unwrap();
        engine.request_manual_retry(tx.id).await.unwrap();
        let now = engine.clock.now();
        engine.scheduler().run_once(now).await.unwrap();
        engine.drain().await;
        let reference = tx.external_reference_id.clone().unwrap();
        engine
            .handle_callback(GatewayCallback::failure(reference, "INSUFFICIENT_FUNDS", None, now))
            .await
            .unwrap();

        assert!(matches!(
            engine.request_manual_retry(tx.id).await,
            Err(PaymentError::StateConflict(ConflictReason::RetriesExhausted {
                attempts: 1,
                max_attempts: 1
            }))
        ));
    }

    #[tokio::test]
    async fn test_manual_retry_without_policy() {
        let (engine, _) = engine();
        let tx = engine.submit(request(None)).await.unwrap();
        engine.drain().await;
        engine
            .handle_callback(GatewayCallback::failure(
                tx.external_reference_id.clone().unwrap(),
                "NETWORK_ERROR",
                None,
                Utc::now(),
            ))
            .await
            .unwrap();

        assert!(matches!(
            engine.request_manual_retry(tx.id).await,
            Err(PaymentError::StateConflict(ConflictReason::NoRetryPolicy))
        ));
    }

    #[tokio::test]
    async fn test_update_retry_policy_keeps_progress() {
        let (engine, _) = engine();
        let tx = engine.create_transaction(request(None)).await.unwrap();

        let created = engine
            .update_retry_policy(
                tx.id,
                RetrySettings {
                    max_attempts: Some(2),
                    ..RetrySettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(created.max_attempts, 2);

        let updated = engine
            .update_retry_policy(
                tx.id,
                RetrySettings {
                    base_interval: Some(Duration::from_secs(120)),
                    strategy: Some(RetryStrategy::Fixed),
                    ..RetrySettings::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.max_attempts, 2);
        assert_eq!(updated.base_interval, Duration::from_secs(120));
        assert_eq!(updated.strategy, RetryStrategy::Fixed);

        let err = engine
            .update_retry_policy(
                tx.id,
                RetrySettings {
                    base_interval: Some(Duration::from_secs(1)),
                    ..RetrySettings::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_summaries_count_attempts_and_errors() {
        let (engine, _) = engine();
        let tx = failed(&engine).await;

        let summaries = engine.summaries().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].transaction.id, tx.id);
        assert_eq!(summaries[0].attempts, 0);
        assert_eq!(summaries[0].errors, 1);
        assert_eq!(summaries[0].last_error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
        assert!(!engine.has_open_work().await.unwrap());
    }
}
