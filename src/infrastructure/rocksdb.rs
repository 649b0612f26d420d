use crate::domain::approval::ApprovalRequest;
use crate::domain::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use crate::domain::ports::{ApprovalStore, DeadLetterStore, TransactionStore, WebhookLogStore};
use crate::domain::transaction::{PaymentTransaction, PaymentTransactionLog, RetryAttempt};
use crate::domain::webhook::{WebhookLogEntry, WebhookOutcome};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CF_TRANSACTIONS: &str = "transactions";
pub const CF_TRANSACTION_LOGS: &str = "transaction_logs";
pub const CF_RETRY_ATTEMPTS: &str = "retry_attempts";
pub const CF_DEAD_LETTERS: &str = "dead_letters";
pub const CF_APPROVALS: &str = "approvals";
pub const CF_WEBHOOK_LOGS: &str = "webhook_logs";
/// Secondary keys: `ref:`, `pid:` and `applied:` prefixes.
pub const CF_INDEXES: &str = "indexes";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_TRANSACTIONS,
    CF_TRANSACTION_LOGS,
    CF_RETRY_ATTEMPTS,
    CF_DEAD_LETTERS,
    CF_APPROVALS,
    CF_WEBHOOK_LOGS,
    CF_INDEXES,
];

fn reference_key(reference: &str) -> Vec<u8> {
    format!("ref:{}", reference).into_bytes()
}

fn provider_key(provider_transaction_id: &str) -> Vec<u8> {
    format!("pid:{}", provider_transaction_id).into_bytes()
}

fn applied_key(gateway_id: &str, dedup_key: &str) -> Vec<u8> {
    format!("applied:{}:{}", gateway_id, dedup_key).into_bytes()
}

/// `<parent id><big-endian sequence>` so rows of one parent sort in insertion order.
fn child_key(parent: Uuid, seq: u64) -> Vec<u8> {
    let mut key = parent.as_bytes().to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn time_key(at: DateTime<Utc>, id: Uuid) -> Vec<u8> {
    let mut key = at.timestamp_micros().to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// A persistent store implementing every storage port on one RocksDB
/// instance, one column family per table.
///
/// Writes that must check a version or keep an index consistent are
/// serialized by `write_lock` and applied as a single `WriteBatch`.
/// `Clone` shares the underlying `Arc<DB>`.
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a database at `path`, creating missing column families.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| PaymentError::StorageError(format!("Column family {} not found", name)))
    }

    fn read<T: DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn read_index(&self, key: &[u8]) -> Result<Option<Uuid>> {
        match self.db.get_cf(self.cf(CF_INDEXES)?, key)? {
            Some(bytes) => Uuid::from_slice(&bytes)
                .map(Some)
                .map_err(|e| PaymentError::StorageError(format!("Corrupt index entry: {}", e))),
            None => Ok(None),
        }
    }

    /// Every value in a column family, in key order.
    fn scan<T: DeserializeOwned>(&self, cf: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for item in self.db.iterator_cf(self.cf(cf)?, IteratorMode::Start) {
            let (_key, value) = item?;
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    /// Every value whose key starts with `prefix`, in key order.
    fn scan_prefix<T: DeserializeOwned>(&self, cf: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn count_prefix(&self, cf: &str, prefix: &[u8]) -> Result<u64> {
        let mut count = 0;
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    fn put_log(&self, batch: &mut WriteBatch, log: &PaymentTransactionLog) -> Result<()> {
        let seq = self.count_prefix(CF_TRANSACTION_LOGS, log.transaction_id.as_bytes())?;
        batch.put_cf(
            self.cf(CF_TRANSACTION_LOGS)?,
            child_key(log.transaction_id, seq),
            encode(log)?,
        );
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for RocksDBStore {
    async fn insert(&self, tx: PaymentTransaction, log: PaymentTransactionLog) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let exists = self.db.get_pinned_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes())?;
        if exists.is_some() || self.read_index(&reference_key(&tx.reference))?.is_some() {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} already exists",
                tx.reference
            )));
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes(), encode(&tx)?);
        batch.put_cf(self.cf(CF_INDEXES)?, reference_key(&tx.reference), tx.id.as_bytes());
        if let Some(provider_id) = &tx.provider_transaction_id {
            batch.put_cf(self.cf(CF_INDEXES)?, provider_key(provider_id), tx.id.as_bytes());
        }
        self.put_log(&mut batch, &log)?;
        self.db.write(batch)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        self.read(CF_TRANSACTIONS, id.as_bytes())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentTransaction>> {
        match self.read_index(&reference_key(reference))? {
            Some(id) => self.read(CF_TRANSACTIONS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        match self.read_index(&provider_key(provider_transaction_id))? {
            Some(id) => self.read(CF_TRANSACTIONS, id.as_bytes()),
            None => Ok(None),
        }
    }

    async fn commit(
        &self,
        mut tx: PaymentTransaction,
        expected_version: u64,
        log: Option<PaymentTransactionLog>,
    ) -> Result<PaymentTransaction> {
        let _guard = self.write_lock.lock().await;
        let stored: PaymentTransaction = self
            .read(CF_TRANSACTIONS, tx.id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFound(format!("Transaction {}", tx.id)))?;
        if stored.version != expected_version {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "Transaction {} is at version {}, expected {}",
                tx.reference, stored.version, expected_version
            )));
        }

        tx.version = expected_version + 1;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_TRANSACTIONS)?, tx.id.as_bytes(), encode(&tx)?);
        if let Some(provider_id) = &tx.provider_transaction_id {
            batch.put_cf(self.cf(CF_INDEXES)?, provider_key(provider_id), tx.id.as_bytes());
        }
        if let Some(log) = &log {
            self.put_log(&mut batch, log)?;
        }
        self.db.write(batch)?;
        Ok(tx)
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<PaymentTransactionLog>> {
        self.scan_prefix(CF_TRANSACTION_LOGS, id.as_bytes())
    }

    async fn record_retry_attempt(&self, attempt: RetryAttempt) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let seq = self.count_prefix(CF_RETRY_ATTEMPTS, attempt.transaction_id.as_bytes())?;
        self.db.put_cf(
            self.cf(CF_RETRY_ATTEMPTS)?,
            child_key(attempt.transaction_id, seq),
            encode(&attempt)?,
        )?;
        Ok(())
    }

    async fn retry_attempts(&self, id: Uuid) -> Result<Vec<RetryAttempt>> {
        self.scan_prefix(CF_RETRY_ATTEMPTS, id.as_bytes())
    }

    async fn for_client(&self, client_id: &str) -> Result<Vec<PaymentTransaction>> {
        let all: Vec<PaymentTransaction> = self.scan(CF_TRANSACTIONS)?;
        Ok(all.into_iter().filter(|tx| tx.client_id == client_id).collect())
    }

    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<PaymentTransaction>> {
        let all: Vec<PaymentTransaction> = self.scan(CF_TRANSACTIONS)?;
        let mut due: Vec<PaymentTransaction> =
            all.into_iter().filter(|tx| tx.is_retry_due(now)).collect();
        due.sort_by_key(|tx| tx.next_retry_at);
        Ok(due)
    }

    async fn get_all(&self) -> Result<Vec<PaymentTransaction>> {
        let mut all: Vec<PaymentTransaction> = self.scan(CF_TRANSACTIONS)?;
        all.sort_by(|a, b| {
            a.initiated_at
                .cmp(&b.initiated_at)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        Ok(all)
    }
}

#[async_trait]
impl DeadLetterStore for RocksDBStore {
    async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        let _guard = self.write_lock.lock().await;
        if let Some(pending) = self
            .scan::<DeadLetterEntry>(CF_DEAD_LETTERS)?
            .into_iter()
            .find(|e| e.transaction_id == entry.transaction_id && e.status == DeadLetterStatus::Pending)
        {
            return Ok(pending);
        }
        self.db
            .put_cf(self.cf(CF_DEAD_LETTERS)?, entry.id.as_bytes(), encode(&entry)?)?;
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        self.read(CF_DEAD_LETTERS, id.as_bytes())
    }

    async fn update(&self, entry: DeadLetterEntry) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let exists = self.db.get_pinned_cf(self.cf(CF_DEAD_LETTERS)?, entry.id.as_bytes())?;
        if exists.is_none() {
            return Err(PaymentError::NotFound(format!("Dead-letter entry {}", entry.id)));
        }
        self.db
            .put_cf(self.cf(CF_DEAD_LETTERS)?, entry.id.as_bytes(), encode(&entry)?)?;
        Ok(())
    }

    async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<DeadLetterEntry>> {
        let mut found: Vec<DeadLetterEntry> = self
            .scan::<DeadLetterEntry>(CF_DEAD_LETTERS)?
            .into_iter()
            .filter(|e| e.transaction_id == transaction_id)
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }

    async fn list(&self, status: Option<DeadLetterStatus>) -> Result<Vec<DeadLetterEntry>> {
        let mut found: Vec<DeadLetterEntry> = self
            .scan::<DeadLetterEntry>(CF_DEAD_LETTERS)?
            .into_iter()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }
}

#[async_trait]
impl ApprovalStore for RocksDBStore {
    async fn insert(&self, request: ApprovalRequest) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_APPROVALS)?, request.id.as_bytes(), encode(&request)?)?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        self.read(CF_APPROVALS, id.as_bytes())
    }

    async fn update(
        &self,
        mut request: ApprovalRequest,
        expected_version: u64,
    ) -> Result<ApprovalRequest> {
        let _guard = self.write_lock.lock().await;
        let stored: ApprovalRequest = self
            .read(CF_APPROVALS, request.id.as_bytes())?
            .ok_or_else(|| PaymentError::NotFound(format!("Approval request {}", request.id)))?;
        if stored.version != expected_version {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "Approval request {} changed concurrently",
                request.id
            )));
        }
        request.version = expected_version + 1;
        self.db
            .put_cf(self.cf(CF_APPROVALS)?, request.id.as_bytes(), encode(&request)?)?;
        Ok(request)
    }

    async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<ApprovalRequest>> {
        let mut found: Vec<ApprovalRequest> = self
            .scan::<ApprovalRequest>(CF_APPROVALS)?
            .into_iter()
            .filter(|r| r.transaction_id == transaction_id)
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}

#[async_trait]
impl WebhookLogStore for RocksDBStore {
    async fn append(&self, entry: WebhookLogEntry) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_WEBHOOK_LOGS)?,
            time_key(entry.received_at, entry.id),
            encode(&entry)?,
        );
        if entry.outcome == WebhookOutcome::Applied
            && let Some(dedup_key) = &entry.dedup_key
        {
            batch.put_cf(
                self.cf(CF_INDEXES)?,
                applied_key(&entry.gateway_id, dedup_key),
                entry.id.as_bytes(),
            );
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn has_applied(&self, gateway_id: &str, dedup_key: &str) -> Result<bool> {
        Ok(self
            .db
            .get_pinned_cf(self.cf(CF_INDEXES)?, applied_key(gateway_id, dedup_key))?
            .is_some())
    }

    async fn for_reference(&self, reference: &str) -> Result<Vec<WebhookLogEntry>> {
        Ok(self
            .scan::<WebhookLogEntry>(CF_WEBHOOK_LOGS)?
            .into_iter()
            .filter(|e| e.transaction_reference.as_deref() == Some(reference))
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<WebhookLogEntry>> {
        self.scan(CF_WEBHOOK_LOGS)
    }
}
