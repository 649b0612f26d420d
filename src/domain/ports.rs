use super::approval::ApprovalRequest;
use super::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use super::transaction::{PaymentTransaction, PaymentTransactionLog, RetryAttempt};
use super::webhook::WebhookLogEntry;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Persistence for payment transactions and their append-only history.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Stores a new transaction together with its creation log row.
    /// Fails if the id or reference already exists.
    async fn insert(&self, tx: PaymentTransaction, log: PaymentTransactionLog) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>>;

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentTransaction>>;

    async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>>;

    /// Replaces the stored transaction if its version still equals
    /// `expected_version`, and appends `log` in the same atomic step.
    ///
    /// Returns the stored copy (with its new version) or
    /// `PaymentError::ConcurrencyConflict` when someone else wrote first.
    async fn commit(
        &self,
        tx: PaymentTransaction,
        expected_version: u64,
        log: Option<PaymentTransactionLog>,
    ) -> Result<PaymentTransaction>;

    async fn logs(&self, id: Uuid) -> Result<Vec<PaymentTransactionLog>>;

    async fn record_retry_attempt(&self, attempt: RetryAttempt) -> Result<()>;

    async fn retry_attempts(&self, id: Uuid) -> Result<Vec<RetryAttempt>>;

    async fn for_client(&self, client_id: &str) -> Result<Vec<PaymentTransaction>>;

    /// `Failed` transactions whose `next_retry_at` has elapsed.
    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<PaymentTransaction>>;

    async fn get_all(&self) -> Result<Vec<PaymentTransaction>>;
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Queues `entry` unless its transaction already has a pending entry,
    /// in which case the existing one is returned instead.
    async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry>;
    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>>;
    async fn update(&self, entry: DeadLetterEntry) -> Result<()>;
    async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<DeadLetterEntry>>;
    async fn list(&self, status: Option<DeadLetterStatus>) -> Result<Vec<DeadLetterEntry>>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn insert(&self, request: ApprovalRequest) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>>;
    /// Version-checked replace, same contract as `TransactionStore::commit`.
    async fn update(&self, request: ApprovalRequest, expected_version: u64) -> Result<ApprovalRequest>;
    async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<ApprovalRequest>>;
}

#[async_trait]
pub trait WebhookLogStore: Send + Sync {
    async fn append(&self, entry: WebhookLogEntry) -> Result<()>;
    /// Whether an event with this key was already applied for the gateway.
    async fn has_applied(&self, gateway_id: &str, dedup_key: &str) -> Result<bool>;
    async fn for_reference(&self, reference: &str) -> Result<Vec<WebhookLogEntry>>;
    async fn get_all(&self) -> Result<Vec<WebhookLogEntry>>;
}

pub type TransactionStoreRef = Arc<dyn TransactionStore>;
pub type DeadLetterStoreRef = Arc<dyn DeadLetterStore>;
pub type ApprovalStoreRef = Arc<dyn ApprovalStore>;
pub type WebhookLogStoreRef = Arc<dyn WebhookLogStore>;

/// The set of stores the services share.
#[derive(Clone)]
pub struct Stores {
    pub transactions: TransactionStoreRef,
    pub dead_letters: DeadLetterStoreRef,
    pub approvals: ApprovalStoreRef,
    pub webhooks: WebhookLogStoreRef,
}

impl Stores {
    /// Uses one backend for every port (e.g. a single RocksDB instance).
    pub fn from_backend<S>(backend: S) -> Self
    where
        S: TransactionStore + DeadLetterStore + ApprovalStore + WebhookLogStore + Clone + 'static,
    {
        Self {
            transactions: Arc::new(backend.clone()),
            dead_letters: Arc::new(backend.clone()),
            approvals: Arc::new(backend.clone()),
            webhooks: Arc::new(backend),
        }
    }
}
