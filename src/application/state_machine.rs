//! The single entry point for every transaction status change.
//!
//! Synchronous dispatch, webhooks, the retry driver and admin actions all go
//! through [`TransactionStateMachine`], so source-state validation, the
//! audit row and the optimistic version check are applied uniformly.

use crate::domain::ports::TransactionStoreRef;
use crate::domain::transaction::{PaymentTransaction, PaymentTransactionLog, TransactionStatus};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

/// How many times a write is re-evaluated after losing a version race.
const MAX_RELOADS: u32 = 5;

const EVENT_CAPACITY: usize = 1024;

/// Published once for every applied transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub transaction_id: Uuid,
    pub reference: String,
    pub previous_status: TransactionStatus,
    pub new_status: TransactionStatus,
    pub action: String,
    pub at: DateTime<Utc>,
}

/// A requested status change plus the fields written alongside it.
#[derive(Debug, Clone)]
pub struct Transition {
    to: TransactionStatus,
    action: String,
    actor: String,
    at: DateTime<Utc>,
    details: Option<String>,
    gateway_id: Option<String>,
    provider_transaction_id: Option<String>,
    error: Option<(String, String)>,
    next_retry_at: Option<Option<DateTime<Utc>>>,
    retry_count: Option<u32>,
    reconciled: bool,
    releases_dead_letter: bool,
}

impl Transition {
    pub fn to(to: TransactionStatus, action: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            to,
            action: action.into(),
            actor: "system".to_string(),
            at,
            details: None,
            gateway_id: None,
            provider_transaction_id: None,
            error: None,
            next_retry_at: None,
            retry_count: None,
            reconciled: false,
            releases_dead_letter: false,
        }
    }

    pub fn by(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn gateway(mut self, gateway_id: impl Into<String>) -> Self {
        self.gateway_id = Some(gateway_id.into());
        self
    }

    pub fn provider_transaction_id(mut self, id: Option<String>) -> Self {
        self.provider_transaction_id = id;
        self
    }

    pub fn error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some((code.into(), message.into()));
        self
    }

    pub fn next_retry_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.next_retry_at = Some(at);
        self
    }

    pub fn retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn reconciled(mut self) -> Self {
        self.reconciled = true;
        self
    }

    /// Marks the transition as an operator's dead-letter decision, the only
    /// way out of `DeadLettered`.
    pub fn releasing_dead_letter(mut self) -> Self {
        self.releases_dead_letter = true;
        self
    }

    pub fn target(&self) -> TransactionStatus {
        self.to
    }

    fn patch(&self, tx: &mut PaymentTransaction) {
        let previous = tx.status;
        tx.status = self.to;
        match self.to {
            TransactionStatus::Processing => {
                tx.processed_at = Some(self.at);
                if previous == TransactionStatus::Failed || previous == TransactionStatus::DeadLettered {
                    tx.last_retry_at = Some(self.at);
                }
                tx.next_retry_at = None;
            }
            TransactionStatus::Completed => {
                if tx.completed_at.is_none() {
                    tx.completed_at = Some(self.at);
                }
                tx.next_retry_at = None;
            }
            TransactionStatus::Failed => tx.failed_at = Some(self.at),
            TransactionStatus::DeadLettered
            | TransactionStatus::Cancelled
            | TransactionStatus::Expired => tx.next_retry_at = None,
            _ => {}
        }

        if let Some(gateway_id) = &self.gateway_id {
            tx.gateway_id = Some(gateway_id.clone());
        }
        if let Some(id) = &self.provider_transaction_id {
            tx.provider_transaction_id = Some(id.clone());
        }
        if let Some((code, message)) = &self.error {
            tx.last_error_code = Some(code.clone());
            tx.last_error_message = Some(message.clone());
        }
        if let Some(at) = self.next_retry_at {
            tx.next_retry_at = at;
        }
        if let Some(count) = self.retry_count {
            tx.retry_count = count;
        }
        if self.reconciled {
            tx.is_reconciled = true;
        }
    }

    fn log_row(&self, tx: &PaymentTransaction, previous: TransactionStatus) -> PaymentTransactionLog {
        PaymentTransactionLog {
            id: Uuid::new_v4(),
            transaction_id: tx.id,
            previous_status: Some(previous),
            new_status: self.to,
            action: self.action.clone(),
            details: self.details.clone(),
            error_code: self.error.as_ref().map(|(code, _)| code.clone()),
            error_message: self.error.as_ref().map(|(_, message)| message.clone()),
            actor: self.actor.clone(),
            created_at: self.at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(PaymentTransaction),
    /// The transaction already had the target status; nothing was written.
    Unchanged(PaymentTransaction),
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn transaction(&self) -> &PaymentTransaction {
        match self {
            TransitionOutcome::Applied(tx) | TransitionOutcome::Unchanged(tx) => tx,
        }
    }

    pub fn into_transaction(self) -> PaymentTransaction {
        match self {
            TransitionOutcome::Applied(tx) | TransitionOutcome::Unchanged(tx) => tx,
        }
    }
}

#[derive(Clone)]
pub struct TransactionStateMachine {
    store: TransactionStoreRef,
    events: broadcast::Sender<TransactionEvent>,
}

impl TransactionStateMachine {
    pub fn new(store: TransactionStoreRef) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { store, events }
    }

    pub fn store(&self) -> &TransactionStoreRef {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.events.subscribe()
    }

    pub async fn load(&self, id: Uuid) -> Result<PaymentTransaction> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Transaction {}", id)))
    }

    /// Applies `transition` to the snapshot `current`.
    ///
    /// Fails with `ConcurrencyConflict` if the stored version moved on since
    /// the snapshot was read, or if a second dispatcher tries to enter
    /// `Processing`.
    pub async fn apply(
        &self,
        current: &PaymentTransaction,
        transition: Transition,
    ) -> Result<TransitionOutcome> {
        let from = current.status;
        if from == transition.to {
            if from == TransactionStatus::Processing {
                return Err(PaymentError::ConcurrencyConflict(format!(
                    "Transaction {} is already being processed",
                    current.reference
                )));
            }
            debug!(reference = %current.reference, status = %from, "Transition is a no-op");
            return Ok(TransitionOutcome::Unchanged(current.clone()));
        }
        if !from.can_transition_to(transition.to)
            || (from == TransactionStatus::DeadLettered && !transition.releases_dead_letter)
        {
            return Err(PaymentError::InvalidTransition {
                from,
                to: transition.to,
            });
        }

        let mut updated = current.clone();
        transition.patch(&mut updated);
        let log = transition.log_row(&updated, from);
        let stored = self
            .store
            .commit(updated, current.version, Some(log))
            .await?;

        info!(
            reference = %stored.reference,
            from = %from,
            to = %stored.status,
            action = %transition.action,
            "Transaction status changed"
        );
        // No receivers is fine.
        let _ = self.events.send(TransactionEvent {
            transaction_id: stored.id,
            reference: stored.reference.clone(),
            previous_status: from,
            new_status: stored.status,
            action: transition.action,
            at: transition.at,
        });
        Ok(TransitionOutcome::Applied(stored))
    }

    /// Loads the latest copy and applies `transition`, re-reading and
    /// re-validating after lost version races.
    pub async fn apply_with_reload(&self, id: Uuid, transition: Transition) -> Result<TransitionOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(id).await?;
            let second_dispatcher = current.status == TransactionStatus::Processing
                && transition.to == TransactionStatus::Processing;
            match self.apply(&current, transition.clone()).await {
                Err(PaymentError::ConcurrencyConflict(reason))
                    if !second_dispatcher && attempt < MAX_RELOADS =>
                {
                    debug!(reference = %current.reference, attempt, %reason, "Reloading after version conflict");
                }
                other => return other,
            }
        }
    }

    /// Writes field changes that keep the current status, with an audit row.
    ///
    /// `edit` runs against a fresh copy on every attempt and may refuse the
    /// change by returning an error.
    pub async fn amend<F>(
        &self,
        id: Uuid,
        action: &str,
        actor: &str,
        at: DateTime<Utc>,
        edit: F,
    ) -> Result<PaymentTransaction>
    where
        F: Fn(&mut PaymentTransaction) -> Result<Option<String>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.load(id).await?;
            let mut updated = current.clone();
            let details = edit(&mut updated)?;
            let log = PaymentTransactionLog {
                id: Uuid::new_v4(),
                transaction_id: current.id,
                previous_status: Some(current.status),
                new_status: current.status,
                action: action.to_string(),
                details,
                error_code: None,
                error_message: None,
                actor: actor.to_string(),
                created_at: at,
            };
            match self.store.commit(updated, current.version, Some(log)).await {
                Err(PaymentError::ConcurrencyConflict(_)) if attempt < MAX_RELOADS => continue,
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::gateway::GatewayType;
    use crate::domain::money::{Amount, Currency, FeeBreakdown};
    use crate::domain::ports::TransactionStore;
    use crate::infrastructure::in_memory::InMemoryTransactionStore;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    async fn setup() -> (TransactionStateMachine, PaymentTransaction) {
        let store = Arc::new(InMemoryTransactionStore::new());
        let machine = TransactionStateMachine::new(store.clone());
        let now = Utc::now();
        let tx = PaymentTransaction::new(
            "TIN-7",
            GatewayType::MobileMoney,
            FeeBreakdown::new(Amount::new(dec!(100)).unwrap(), dec!(1.5)).unwrap(),
            Currency::new("SLE").unwrap(),
            now,
            now + chrono::Duration::hours(24),
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
        store.insert(tx.clone(), log).await.unwrap();
        (machine, tx)
    }

    #[tokio::test]
    async fn test_applied_transition_writes_one_log_row_and_event() {
        let (machine, tx) = setup().await;
        let mut events = machine.subscribe();
        let now = Utc::now();

        let outcome = machine
            .apply_with_reload(
                tx.id,
                Transition::to(TransactionStatus::Processing, "dispatch", now).gateway("orange-money"),
            )
            .await
            .unwrap();
        assert!(outcome.is_applied());
        let stored = outcome.into_transaction();
        assert_eq!(stored.status, TransactionStatus::Processing);
        assert_eq!(stored.gateway_id.as_deref(), Some("orange-money"));
        assert_eq!(stored.version, 1);

        let logs = machine.store().logs(tx.id).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1].previous_status, Some(TransactionStatus::Initiated));
        assert_eq!(logs[1].new_status, TransactionStatus::Processing);

        let event = events.try_recv().unwrap();
        assert_eq!(event.new_status, TransactionStatus::Processing);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_lettered_only_leaves_through_operator_release() {
        let (machine, tx) = setup().await;
        let now = Utc::now();
        for (to, action) in [
            (TransactionStatus::Processing, "dispatch"),
            (TransactionStatus::Failed, "retries_exhausted"),
            (TransactionStatus::DeadLettered, "dead_lettered"),
        ] {
            machine
                .apply_with_reload(tx.id, Transition::to(to, action, now))
                .await
                .unwrap();
        }

        let late = machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Completed, "webhook_confirmed", now))
            .await;
        assert!(matches!(
            late,
            Err(PaymentError::InvalidTransition {
                from: TransactionStatus::DeadLettered,
                to: TransactionStatus::Completed
            })
        ));

        let resolved = machine
            .apply_with_reload(
                tx.id,
                Transition::to(TransactionStatus::Completed, "dead_letter_resolved", now)
                    .by("ops-1")
                    .releasing_dead_letter(),
            )
            .await
            .unwrap();
        assert_eq!(resolved.transaction().status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_invalid_source_state_is_rejected() {
        let (machine, tx) = setup().await;
        let result = machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Completed, "confirm", Utc::now()))
            .await;
        assert!(matches!(
            result,
            Err(PaymentError::InvalidTransition {
                from: TransactionStatus::Initiated,
                to: TransactionStatus::Completed
            })
        ));
        assert_eq!(machine.store().logs(tx.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_status_is_noop_except_processing() {
        let (machine, tx) = setup().await;
        let now = Utc::now();
        let unchanged = machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Initiated, "noop", now))
            .await
            .unwrap();
        assert!(!unchanged.is_applied());

        machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Processing, "dispatch", now))
            .await
            .unwrap();
        let second = machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Processing, "dispatch", now))
            .await;
        assert!(matches!(second, Err(PaymentError::ConcurrencyConflict(_))));
    }

    #[tokio::test]
    async fn test_stale_snapshot_conflicts_but_reload_succeeds() {
        let (machine, tx) = setup().await;
        let now = Utc::now();
        machine
            .apply(&tx, Transition::to(TransactionStatus::Processing, "dispatch", now))
            .await
            .unwrap();

        // `tx` is still version 0.
        let stale = machine
            .apply(&tx, Transition::to(TransactionStatus::Cancelled, "cancel", now))
            .await;
        assert!(matches!(stale, Err(PaymentError::ConcurrencyConflict(_))));

        let reloaded = machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Cancelled, "cancel", now))
            .await
            .unwrap();
        assert_eq!(reloaded.transaction().status, TransactionStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_concurrent_completions_apply_once() {
        let (machine, tx) = setup().await;
        let now = Utc::now();
        machine
            .apply_with_reload(tx.id, Transition::to(TransactionStatus::Processing, "dispatch", now))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let machine = machine.clone();
            handles.push(tokio::spawn(async move {
                machine
                    .apply_with_reload(
                        tx.id,
                        Transition::to(TransactionStatus::Completed, format!("confirm-{}", i), now),
                    )
                    .await
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_applied() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);

        let completions = machine
            .store()
            .logs(tx.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|log| log.new_status == TransactionStatus::Completed)
            .count();
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_amend_keeps_status_and_logs() {
        let (machine, tx) = setup().await;
        let updated = machine
            .amend(tx.id, "flagged_for_review", "ops-1", Utc::now(), |tx| {
                tx.requires_manual_review = true;
                Ok(Some("velocity".to_string()))
            })
            .await
            .unwrap();
        assert!(updated.requires_manual_review);
        assert_eq!(updated.status, TransactionStatus::Initiated);
        let logs = machine.store().logs(tx.id).await.unwrap();
        assert_eq!(logs.last().unwrap().action, "flagged_for_review");
    }
}
