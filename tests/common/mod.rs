#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use payretry::application::callback::{CallbackResult, GatewayCallback};
use payretry::application::engine::{NewPayment, PaymentRetryEngine};
use payretry::application::scheduler::PassReport;
use payretry::config::{RetryConfig, RetrySettings};
use payretry::domain::error_entry::ErrorEntry;
use payretry::domain::ports::{
    PaymentGateway, StateWrite, TransactionNotification, TransactionStore,
};
use payretry::domain::retry_policy::RetryPolicy;
use payretry::domain::transaction::{Amount, Transaction, TransactionId, TransactionStatus};
use payretry::error::{PaymentError, Result};
use payretry::infrastructure::clock::ManualClock;
use payretry::infrastructure::in_memory::InMemoryTransactionStore;
use payretry::infrastructure::notifier::ChannelNotifier;
use rust_decimal_macros::dec;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Semaphore, mpsc};

/// A gateway whose behaviour each test scripts directly. Outcomes are fed
/// back by the test through `Harness::succeed` / `Harness::decline`.
#[derive(Default)]
pub struct ScriptedGateway {
    submissions: Mutex<Vec<TransactionId>>,
    refuse: AtomicBool,
    /// When set, every submission waits for one permit before returning.
    gate: Mutex<Option<Arc<Semaphore>>>,
    concurrent: AtomicUsize,
    max_concurrent_per_tx: Mutex<std::collections::HashMap<TransactionId, usize>>,
    running: Mutex<std::collections::HashMap<TransactionId, usize>>,
}

impl ScriptedGateway {
    pub fn submissions(&self) -> Vec<TransactionId> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submissions_for(&self, tx_id: TransactionId) -> usize {
        self.submissions().iter().filter(|id| **id == tx_id).count()
    }

    /// Makes every following submission fail before reaching the gateway.
    pub fn refuse_submissions(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn hold_submissions(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn release_submissions(&self) {
        if let Some(gate) = self.gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    /// Highest number of simultaneous submissions observed for one transaction.
    pub fn peak_overlap(&self, tx_id: TransactionId) -> usize {
        self.max_concurrent_per_tx
            .lock()
            .unwrap()
            .get(&tx_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn in_progress(&self) -> usize {
        self.concurrent.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn submit_payment(&self, tx: &Transaction) -> Result<()> {
        self.submissions.lock().unwrap().push(tx.id);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PaymentError::internal("gateway connection refused"));
        }

        {
            let mut running = self.running.lock().unwrap();
            let now_running = running.entry(tx.id).or_default();
            *now_running += 1;
            let mut peaks = self.max_concurrent_per_tx.lock().unwrap();
            let peak = peaks.entry(tx.id).or_default();
            *peak = (*peak).max(*now_running);
        }
        self.concurrent.fetch_add(1, Ordering::SeqCst);

        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }

        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        if let Some(count) = self.running.lock().unwrap().get_mut(&tx.id) {
            *count -= 1;
        }
        Ok(())
    }
}

/// The in-memory store, except that the next N commits can be made to lose
/// a version race as if another writer had committed first.
pub struct ConflictingStore {
    inner: InMemoryTransactionStore,
    pending_conflicts: AtomicUsize,
    refused: AtomicUsize,
}

impl ConflictingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryTransactionStore::new(),
            pending_conflicts: AtomicUsize::new(0),
            refused: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// Commits refused so far with a conflict.
    pub fn refused_commits(&self) -> usize {
        self.refused.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionStore for ConflictingStore {
    async fn insert(&self, tx: Transaction, policy: Option<RetryPolicy>) -> Result<()> {
        self.inner.insert(tx, policy).await
    }

    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        self.inner.get(tx_id).await
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Transaction>> {
        self.inner.find_by_external_ref(external_ref).await
    }

    async fn get_policy(&self, tx_id: TransactionId) -> Result<Option<RetryPolicy>> {
        self.inner.get_policy(tx_id).await
    }

    async fn error_entries(&self, tx_id: TransactionId) -> Result<Vec<ErrorEntry>> {
        self.inner.error_entries(tx_id).await
    }

    async fn find_due_policies(
        &self,
        now: DateTime<Utc>,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<RetryPolicy>> {
        self.inner.find_due_policies(now, statuses).await
    }

    async fn find_in_status(&self, statuses: &[TransactionStatus]) -> Result<Vec<Transaction>> {
        self.inner.find_in_status(statuses).await
    }

    async fn all(&self) -> Result<Vec<Transaction>> {
        self.inner.all().await
    }

    async fn commit(&self, write: StateWrite) -> Result<()> {
        let conflicted = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            self.refused.fetch_add(1, Ordering::SeqCst);
            return Err(PaymentError::ConcurrentModification(write.transaction.id));
        }
        self.inner.commit(write).await
    }
}

pub struct Harness {
    pub engine: PaymentRetryEngine,
    pub store: Arc<ConflictingStore>,
    pub gateway: Arc<ScriptedGateway>,
    pub clock: ManualClock,
    notifications: Mutex<mpsc::UnboundedReceiver<TransactionNotification>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RetryConfig::default())
    }

    pub fn with_config(config: RetryConfig) -> Self {
        let store = Arc::new(ConflictingStore::new());
        let gateway = Arc::new(ScriptedGateway::default());
        let clock = ManualClock::new(Utc::now());
        let (notifier, notifications) = ChannelNotifier::channel();
        let engine = PaymentRetryEngine::new(
            store.clone(),
            gateway.clone(),
            Arc::new(notifier),
            Arc::new(clock.clone()),
            config,
        )
        .unwrap();
        Self {
            engine,
            store,
            gateway,
            clock,
            notifications: Mutex::new(notifications),
        }
    }

    /// Notifications published since the last call, oldest first.
    pub fn notifications(&self) -> Vec<TransactionNotification> {
        let mut receiver = self.notifications.lock().unwrap();
        std::iter::from_fn(|| receiver.try_recv().ok()).collect()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn request(settings: Option<RetrySettings>) -> NewPayment {
        NewPayment {
            owner: "user-1".to_string(),
            amount: Amount::new(dec!(49.99)).unwrap(),
            currency: "USD".to_string(),
            gateway: None,
            retry: settings,
        }
    }

    /// Creates and initiates a payment, waiting until it reached the gateway.
    pub async fn submit(&self, settings: Option<RetrySettings>) -> Transaction {
        let tx = self.engine.submit(Self::request(settings)).await.unwrap();
        self.engine.drain().await;
        tx
    }

    pub async fn reload(&self, tx_id: TransactionId) -> Transaction {
        self.engine.transaction(tx_id).await.unwrap()
    }

    pub async fn policy(&self, tx_id: TransactionId) -> RetryPolicy {
        self.engine.retry_policy(tx_id).await.unwrap().unwrap()
    }

    pub async fn succeed(&self, tx: &Transaction) -> Result<CallbackResult> {
        let reference = tx.external_reference_id.clone().unwrap();
        self.engine
            .handle_callback(GatewayCallback::success(reference, self.now()))
            .await
    }

    pub async fn decline(&self, tx: &Transaction, code: &str) -> Result<CallbackResult> {
        let reference = tx.external_reference_id.clone().unwrap();
        self.engine
            .handle_callback(GatewayCallback::failure(
                reference,
                code,
                Some(format!("scripted {}", code)),
                self.now(),
            ))
            .await
    }

    /// Moves the clock forward and runs one scheduling pass to completion.
    pub async fn advance_and_run(&self, seconds: i64) -> PassReport {
        let now = self.clock.advance(TimeDelta::seconds(seconds));
        let report = self.engine.scheduler().run_once(now).await.unwrap();
        self.engine.drain().await;
        report
    }
}
