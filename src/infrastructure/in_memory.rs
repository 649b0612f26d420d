use crate::domain::approval::ApprovalRequest;
use crate::domain::dead_letter::{DeadLetterEntry, DeadLetterStatus};
use crate::domain::ports::{
    ApprovalStore, DeadLetterStore, Stores, TransactionStore, WebhookLogStore,
};
use crate::domain::transaction::{PaymentTransaction, PaymentTransactionLog, RetryAttempt};
use crate::domain::webhook::{WebhookLogEntry, WebhookOutcome};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct TransactionTables {
    transactions: HashMap<Uuid, PaymentTransaction>,
    by_reference: HashMap<String, Uuid>,
    by_provider_id: HashMap<String, Uuid>,
    logs: HashMap<Uuid, Vec<PaymentTransactionLog>>,
    retries: HashMap<Uuid, Vec<RetryAttempt>>,
}

/// A thread-safe in-memory store for payment transactions.
///
/// All tables live behind one `RwLock` so a version check, the row write and
/// the audit append happen atomically.
#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    tables: Arc<RwLock<TransactionTables>>,
}

impl InMemoryTransactionStore {
    /// Creates a new, empty in-memory transaction store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: PaymentTransaction, log: PaymentTransactionLog) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.transactions.contains_key(&tx.id) || tables.by_reference.contains_key(&tx.reference)
        {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} already exists",
                tx.reference
            )));
        }
        tables.by_reference.insert(tx.reference.clone(), tx.id);
        if let Some(provider_id) = &tx.provider_transaction_id {
            tables.by_provider_id.insert(provider_id.clone(), tx.id);
        }
        tables.logs.entry(tx.id).or_default().push(log);
        tables.transactions.insert(tx.id, tx);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables.transactions.get(&id).cloned())
    }

    async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_reference
            .get(reference)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn find_by_provider_id(
        &self,
        provider_transaction_id: &str,
    ) -> Result<Option<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .by_provider_id
            .get(provider_transaction_id)
            .and_then(|id| tables.transactions.get(id))
            .cloned())
    }

    async fn commit(
        &self,
        mut tx: PaymentTransaction,
        expected_version: u64,
        log: Option<PaymentTransactionLog>,
    ) -> Result<PaymentTransaction> {
        let mut tables = self.tables.write().await;
        let current_version = tables
            .transactions
            .get(&tx.id)
            .map(|stored| stored.version)
            .ok_or_else(|| PaymentError::NotFound(format!("Transaction {}", tx.id)))?;
        if current_version != expected_version {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "Transaction {} is at version {}, expected {}",
                tx.reference, current_version, expected_version
            )));
        }

        tx.version = expected_version + 1;
        if let Some(provider_id) = &tx.provider_transaction_id {
            tables.by_provider_id.insert(provider_id.clone(), tx.id);
        }
        if let Some(log) = log {
            tables.logs.entry(tx.id).or_default().push(log);
        }
        tables.transactions.insert(tx.id, tx.clone());
        Ok(tx)
    }

    async fn logs(&self, id: Uuid) -> Result<Vec<PaymentTransactionLog>> {
        let tables = self.tables.read().await;
        Ok(tables.logs.get(&id).cloned().unwrap_or_default())
    }

    async fn record_retry_attempt(&self, attempt: RetryAttempt) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .retries
            .entry(attempt.transaction_id)
            .or_default()
            .push(attempt);
        Ok(())
    }

    async fn retry_attempts(&self, id: Uuid) -> Result<Vec<RetryAttempt>> {
        let tables = self.tables.read().await;
        Ok(tables.retries.get(&id).cloned().unwrap_or_default())
    }

    async fn for_client(&self, client_id: &str) -> Result<Vec<PaymentTransaction>> {
        let tables = self.tables.read().await;
        Ok(tables
            .transactions
            .values()
            .filter(|tx| tx.client_id == client_id)
            .cloned()
            .collect())
    }

    async fn due_for_retry(&self, now: DateTime<Utc>) -> Result<Vec<PaymentTransaction>> {
        let tables = self.tables.read().await;
        let mut due: Vec<PaymentTransaction> = tables
            .transactions
            .values()
            .filter(|tx| tx.is_retry_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|tx| tx.next_retry_at);
        Ok(due)
    }

    async fn get_all(&self) -> Result<Vec<PaymentTransaction>> {
        let tables = self.tables.read().await;
        let mut all: Vec<PaymentTransaction> = tables.transactions.values().cloned().collect();
        all.sort_by(|a, b| {
            a.initiated_at
                .cmp(&b.initiated_at)
                .then_with(|| a.reference.cmp(&b.reference))
        });
        Ok(all)
    }
}

/// A thread-safe in-memory dead-letter queue.
#[derive(Default, Clone)]
pub struct InMemoryDeadLetterStore {
    entries: Arc<RwLock<HashMap<Uuid, DeadLetterEntry>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn insert(&self, entry: DeadLetterEntry) -> Result<DeadLetterEntry> {
        let mut entries = self.entries.write().await;
        if let Some(pending) = entries.values().find(|e| {
            e.transaction_id == entry.transaction_id && e.status == DeadLetterStatus::Pending
        }) {
            return Ok(pending.clone());
        }
        entries.insert(entry.id, entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&id).cloned())
    }

    async fn update(&self, entry: DeadLetterEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if !entries.contains_key(&entry.id) {
            return Err(PaymentError::NotFound(format!("Dead-letter entry {}", entry.id)));
        }
        entries.insert(entry.id, entry);
        Ok(())
    }

    async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        let mut found: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }

    async fn list(&self, status: Option<DeadLetterStatus>) -> Result<Vec<DeadLetterEntry>> {
        let entries = self.entries.read().await;
        let mut found: Vec<DeadLetterEntry> = entries
            .values()
            .filter(|e| status.is_none_or(|s| e.status == s))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.created_at);
        Ok(found)
    }
}

/// A thread-safe in-memory store for approval requests.
#[derive(Default, Clone)]
pub struct InMemoryApprovalStore {
    requests: Arc<RwLock<HashMap<Uuid, ApprovalRequest>>>,
}

impl InMemoryApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn insert(&self, request: ApprovalRequest) -> Result<()> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id, request);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ApprovalRequest>> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id).cloned())
    }

    async fn update(
        &self,
        mut request: ApprovalRequest,
        expected_version: u64,
    ) -> Result<ApprovalRequest> {
        let mut requests = self.requests.write().await;
        let current = requests
            .get(&request.id)
            .map(|r| r.version)
            .ok_or_else(|| PaymentError::NotFound(format!("Approval request {}", request.id)))?;
        if current != expected_version {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "Approval request {} changed concurrently",
                request.id
            )));
        }
        request.version = expected_version + 1;
        requests.insert(request.id, request.clone());
        Ok(request)
    }

    async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<ApprovalRequest>> {
        let requests = self.requests.read().await;
        let mut found: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| r.transaction_id == transaction_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }
}

/// Append-only in-memory webhook log.
#[derive(Default, Clone)]
pub struct InMemoryWebhookLogStore {
    entries: Arc<RwLock<Vec<WebhookLogEntry>>>,
}

impl InMemoryWebhookLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WebhookLogStore for InMemoryWebhookLogStore {
    async fn append(&self, entry: WebhookLogEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }

    async fn has_applied(&self, gateway_id: &str, dedup_key: &str) -> Result<bool> {
        let entries = self.entries.read().await;
        Ok(entries.iter().any(|e| {
            e.gateway_id == gateway_id
                && e.outcome == WebhookOutcome::Applied
                && e.dedup_key.as_deref() == Some(dedup_key)
        }))
    }

    async fn for_reference(&self, reference: &str) -> Result<Vec<WebhookLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.transaction_reference.as_deref() == Some(reference))
            .cloned()
            .collect())
    }

    async fn get_all(&self) -> Result<Vec<WebhookLogEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.clone())
    }
}

impl Stores {
    /// Fresh in-memory stores, for tests and runs without `--db-path`.
    pub fn in_memory() -> Self {
        Self {
            transactions: Arc::new(InMemoryTransactionStore::new()),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            approvals: Arc::new(InMemoryApprovalStore::new()),
            webhooks: Arc::new(InMemoryWebhookLogStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway::GatewayType;
    use crate::domain::money::{Amount, Currency, FeeBreakdown};
    use crate::domain::transaction::TransactionStatus;
    use rust_decimal_macros::dec;

    fn new_tx() -> (PaymentTransaction, PaymentTransactionLog) {
        let now = Utc::now();
        let tx = PaymentTransaction::new(
            "TIN-1",
            GatewayType::Card,
            FeeBreakdown::new(Amount::new(dec!(100)).unwrap(), dec!(1.5)).unwrap(),
            Currency::new("SLE").unwrap(),
            now,
            now + chrono::Duration::hours(1),
        );
        let log = PaymentTransactionLog {
            id: Uuid::new_v4(),
            transaction_id: tx.id,
            previous_status: None,
            new_status: TransactionStatus::Initiated,
            action: "created".to_string(),
            details: None,
            error_code: None,
            error_message: None,
            actor: "test".to_string(),
            created_at: now,
        };
        (tx, log)
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = InMemoryTransactionStore::new();
        let (tx, log) = new_tx();
        store.insert(tx.clone(), log).await.unwrap();

        assert_eq!(store.get(tx.id).await.unwrap().unwrap(), tx);
        assert_eq!(
            store.find_by_reference(&tx.reference).await.unwrap().unwrap().id,
            tx.id
        );
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
        assert_eq!(store.logs(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let store = InMemoryTransactionStore::new();
        let (tx, log) = new_tx();
        store.insert(tx.clone(), log.clone()).await.unwrap();
        assert!(store.insert(tx, log).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_checks_version() {
        let store = InMemoryTransactionStore::new();
        let (tx, log) = new_tx();
        store.insert(tx.clone(), log).await.unwrap();

        let mut updated = tx.clone();
        updated.provider_transaction_id = Some("PRV-1".to_string());
        let stored = store.commit(updated, 0, None).await.unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(
            store.find_by_provider_id("PRV-1").await.unwrap().unwrap().id,
            tx.id
        );

        // A writer still holding version 0 loses.
        let stale = store.commit(tx.clone(), 0, None).await;
        assert!(matches!(stale, Err(PaymentError::ConcurrencyConflict(_))));
    }

    #[tokio::test]
    async fn test_webhook_dedup_only_counts_applied() {
        let store = InMemoryWebhookLogStore::new();
        let mut entry = WebhookLogEntry {
            id: Uuid::new_v4(),
            gateway_id: "orange-money".to_string(),
            event_type: None,
            body: "{}".to_string(),
            headers: Default::default(),
            signature_valid: true,
            outcome: WebhookOutcome::Rejected,
            transaction_reference: None,
            provider_transaction_id: None,
            reported_status: None,
            dedup_key: Some("P-1:Payment:succeeded".to_string()),
            detail: None,
            received_at: Utc::now(),
        };
        store.append(entry.clone()).await.unwrap();
        assert!(!store.has_applied("orange-money", "P-1:Payment:succeeded").await.unwrap());

        entry.id = Uuid::new_v4();
        entry.outcome = WebhookOutcome::Applied;
        store.append(entry).await.unwrap();
        assert!(store.has_applied("orange-money", "P-1:Payment:succeeded").await.unwrap());
        assert!(!store.has_applied("afrimoney", "P-1:Payment:succeeded").await.unwrap());
    }
}
