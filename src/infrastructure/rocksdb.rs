use crate::domain::error_entry::ErrorEntry;
use crate::domain::ports::{StateWrite, TransactionStore, check_policy_owner};
use crate::domain::retry_policy::RetryPolicy;
use crate::domain::transaction::{Transaction, TransactionId, TransactionStatus};
use crate::error::{ConflictReason, PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use uuid::Uuid;

/// Column Family for transaction rows, keyed by transaction ID.
pub const CF_TRANSACTIONS: &str = "transactions";
/// Column Family for retry policies, keyed by transaction ID.
pub const CF_POLICIES: &str = "policies";
/// Column Family for error entries, keyed by transaction ID followed by a
/// big-endian sequence number so a prefix scan yields creation order.
pub const CF_ERROR_ENTRIES: &str = "error_entries";
/// Column Family mapping external reference IDs to transaction IDs.
pub const CF_EXTERNAL_REFS: &str = "external_refs";

/// A persistent store implementation using RocksDB.
///
/// Every `commit` is a single `WriteBatch`, so a transaction, its policy and
/// its error entry land together or not at all. Commits are serialized by a
/// process-local lock so the version check and the write cannot interleave.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    commit_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path` with all column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let families = [CF_TRANSACTIONS, CF_POLICIES, CF_ERROR_ENTRIES, CF_EXTERNAL_REFS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = DB::open_cf_descriptors(&opts, path, families)?;

        Ok(Self {
            db: Arc::new(db),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &'static str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::internal(format!("{} column family not found", name)))
    }

    fn read<T: DeserializeOwned>(
        &self,
        cf: &'static str,
        key: impl AsRef<[u8]>,
    ) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf: &'static str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn entries_with_prefix(&self, tx_id: TransactionId) -> Result<Vec<ErrorEntry>> {
        let prefix = tx_id.as_bytes();
        let mode = IteratorMode::From(prefix, Direction::Forward);
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_ERROR_ENTRIES)?, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push(decode(&value)?);
        }
        Ok(entries)
    }

    fn reference_owner(&self, reference: &str) -> Result<Option<TransactionId>> {
        match self.db.get_cf(self.cf(CF_EXTERNAL_REFS)?, reference.as_bytes())? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PaymentError::internal(format!("Corrupt reference index: {}", e))),
            None => Ok(None),
        }
    }

    /// Stages the reference index entry for `tx`, rejecting references owned
    /// by another transaction.
    fn stage_reference(&self, batch: &mut WriteBatch, tx: &Transaction) -> Result<()> {
        let Some(reference) = tx.external_reference_id.as_ref() else {
            return Ok(());
        };
        match self.reference_owner(reference)? {
            Some(owner) if owner != tx.id => Err(ConflictReason::DuplicateReference.into()),
            Some(_) => Ok(()),
            None => {
                batch.put_cf(self.cf(CF_EXTERNAL_REFS)?, reference.as_bytes(), tx.id.as_bytes());
                Ok(())
            }
        }
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| PaymentError::internal(format!("Serialization error: {}", e)))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes)
        .map_err(|e| PaymentError::internal(format!("Deserialization error: {}", e)))
}

fn entry_key(tx_id: TransactionId, sequence: u32) -> Vec<u8> {
    let mut key = tx_id.as_bytes().to_vec();
    key.extend_from_slice(&sequence.to_be_bytes());
    key
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn insert(&self, tx: Transaction, policy: Option<RetryPolicy>) -> Result<()> {
        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.db.get_pinned_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes())?.is_some() {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} already exists",
                tx.id
            )));
        }
        check_policy_owner(&tx, policy.as_ref())?;

        let mut batch = WriteBatch::default();
        self.stage_reference(&mut batch, &tx)?;
        if let Some(policy) = policy {
            batch.put_cf(self.cf(CF_POLICIES)?, tx.id.as_bytes(), encode(&policy)?);
        }
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes(), encode(&tx)?);
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        self.read(CF_TRANSACTIONS, tx_id.as_bytes())
    }

    async fn find_by_external_ref(&self, external_ref: &str) -> Result<Option<Transaction>> {
        match self.reference_owner(external_ref)? {
            Some(tx_id) => self.read(CF_TRANSACTIONS, tx_id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn get_policy(&self, tx_id: TransactionId) -> Result<Option<RetryPolicy>> {
        self.read(CF_POLICIES, tx_id.as_bytes())
    }

    async fn error_entries(&self, tx_id: TransactionId) -> Result<Vec<ErrorEntry>> {
        self.entries_with_prefix(tx_id)
    }

    async fn find_due_policies(
        &self,
        now: DateTime<Utc>,
        statuses: &[TransactionStatus],
    ) -> Result<Vec<RetryPolicy>> {
        let mut due = Vec::new();
        for policy in self.scan::<RetryPolicy>(CF_POLICIES)? {
            if !policy.is_due(now) {
                continue;
            }
            let tx: Option<Transaction> =
                self.read(CF_TRANSACTIONS, policy.transaction_id.as_bytes())?;
            if tx.is_some_and(|tx| statuses.contains(&tx.status)) {
                due.push(policy);
            }
        }
        due.sort_by_key(|p| (p.next_retry_at, p.transaction_id));
        Ok(due)
    }

    async fn find_in_status(&self, statuses: &[TransactionStatus]) -> Result<Vec<Transaction>> {
        let mut found: Vec<Transaction> = self
            .scan::<Transaction>(CF_TRANSACTIONS)?
            .into_iter()
            .filter(|tx| statuses.contains(&tx.status))
            .collect();
        found.sort_by_key(|tx| (tx.updated_at, tx.id));
        Ok(found)
    }

    async fn all(&self) -> Result<Vec<Transaction>> {
        let mut all = self.scan::<Transaction>(CF_TRANSACTIONS)?;
        all.sort_by_key(|tx| (tx.created_at, tx.id));
        Ok(all)
    }

    async fn commit(&self, write: StateWrite) -> Result<()> {
        let StateWrite {
            mut transaction,
            policy,
            error_entry,
        } = write;

        let _guard = self.commit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let stored: Transaction = self
            .read(CF_TRANSACTIONS, transaction.id.as_bytes())?
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

        let mut batch = WriteBatch::default();
        self.stage_reference(&mut batch, &transaction)?;

        transaction.version += 1;
        if let Some(policy) = policy {
            batch.put_cf(self.cf(CF_POLICIES)?, transaction.id.as_bytes(), encode(&policy)?);
        }
        if let Some(entry) = error_entry {
            let sequence = u32::try_from(self.entries_with_prefix(transaction.id)?.len())
                .map_err(|_| PaymentError::internal("Too many error entries"))?;
            batch.put_cf(
                self.cf(CF_ERROR_ENTRIES)?,
                entry_key(transaction.id, sequence),
                encode(&entry)?,
            );
        }
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, transaction.id.as_bytes(), encode(&transaction)?);

        self.db.write(batch)?;
        Ok(())
    }
}
