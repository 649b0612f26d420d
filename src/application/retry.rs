//! Failure handling: backoff scheduling, dead-lettering and operator
//! resolution of dead-lettered payments.

use super::state_machine::{TransactionStateMachine, Transition, TransitionOutcome};
use crate::config::{GatewayConfig, ProcessorConfig};
use crate::domain::dead_letter::{DeadLetterAction, DeadLetterEntry, DeadLetterStatus};
use crate::domain::ports::DeadLetterStoreRef;
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const MAX_RELOADS: u32 = 5;

pub const ERR_CIRCUIT_OPEN: &str = "CIRCUIT_OPEN";

/// Why an attempt did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum Failure {
    /// No call was made; the gateway will accept one again at `retry_at`.
    CircuitOpen { retry_at: DateTime<Utc> },
    /// The gateway was called and failed, timed out or was unreachable.
    Gateway {
        gateway_id: Option<String>,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Scheduled { next_retry_at: DateTime<Utc> },
    DeadLettered { entry_id: Uuid },
    Cancelled,
    /// The transaction had already left `Processing`.
    Skipped,
}

/// Result of an operator action on a dead-letter entry.
#[derive(Debug, Clone)]
pub struct DeadLetterResolution {
    pub entry: DeadLetterEntry,
    pub transaction: PaymentTransaction,
    /// The transaction was moved back to `Processing` and must be dispatched.
    pub redispatch: bool,
}

#[derive(Clone)]
pub struct RetryScheduler {
    machine: TransactionStateMachine,
    dead_letters: DeadLetterStoreRef,
    config: Arc<ProcessorConfig>,
}

impl RetryScheduler {
    pub fn new(
        machine: TransactionStateMachine,
        dead_letters: DeadLetterStoreRef,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self {
            machine,
            dead_letters,
            config,
        }
    }

    fn gateway_config(
        &self,
        tx: &PaymentTransaction,
        gateway_id: Option<&str>,
    ) -> Result<&GatewayConfig> {
        gateway_id
            .or(tx.gateway_id.as_deref())
            .and_then(|id| self.config.gateway(id))
            .or_else(|| self.config.primary_gateway(tx.gateway_type))
            .or_else(|| {
                self.config
                    .gateways
                    .iter()
                    .find(|g| g.gateway_type == tx.gateway_type)
            })
            .ok_or_else(|| {
                PaymentError::ConfigError(format!(
                    "No gateway configured for {} ({})",
                    tx.reference, tx.gateway_type
                ))
            })
    }

    /// Records a failed attempt for a transaction in `Processing`.
    pub async fn handle_failure(
        &self,
        transaction_id: Uuid,
        failure: Failure,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let tx = self.machine.load(transaction_id).await?;
            match self.decide(&tx, &failure, now).await {
                Err(PaymentError::ConcurrencyConflict(_)) if attempt < MAX_RELOADS => continue,
                other => return other,
            }
        }
    }

    async fn decide(
        &self,
        tx: &PaymentTransaction,
        failure: &Failure,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        if tx.status != TransactionStatus::Processing {
            return Ok(RetryDecision::Skipped);
        }

        let (code, message) = match failure {
            Failure::CircuitOpen { retry_at } => (
                ERR_CIRCUIT_OPEN.to_string(),
                format!("Gateway circuit open until {}", retry_at),
            ),
            Failure::Gateway { code, message, .. } => (code.clone(), message.clone()),
        };

        if tx.cancel_requested {
            self.machine
                .apply(
                    tx,
                    Transition::to(TransactionStatus::Cancelled, "cancelled_after_failure", now)
                        .error(code, message),
                )
                .await?;
            info!(reference = %tx.reference, "Deferred cancellation applied");
            return Ok(RetryDecision::Cancelled);
        }

        match failure {
            Failure::CircuitOpen { retry_at } => {
                self.machine
                    .apply(
                        tx,
                        Transition::to(TransactionStatus::Failed, "circuit_open", now)
                            .error(code, message)
                            .next_retry_at(Some(*retry_at)),
                    )
                    .await?;
                info!(reference = %tx.reference, %retry_at, "Deferred until circuit re-opens");
                Ok(RetryDecision::Scheduled {
                    next_retry_at: *retry_at,
                })
            }
            Failure::Gateway { gateway_id, .. } => {
                let gateway = self.gateway_config(tx, gateway_id.as_deref())?;
                let gateway_id = gateway.id.clone();
                let attempts = tx.retry_count.saturating_add(1);
                if attempts < gateway.retry_attempts {
                    let next_retry_at = now + gateway.retry_delay(attempts);
                    self.machine
                        .apply(
                            tx,
                            Transition::to(TransactionStatus::Failed, "attempt_failed", now)
                                .gateway(gateway_id)
                                .error(code, message)
                                .retry_count(attempts)
                                .next_retry_at(Some(next_retry_at)),
                        )
                        .await?;
                    info!(
                        reference = %tx.reference,
                        attempts,
                        %next_retry_at,
                        "Retry scheduled"
                    );
                    Ok(RetryDecision::Scheduled { next_retry_at })
                } else {
                    let exhausted = self
                        .machine
                        .apply(
                            tx,
                            Transition::to(TransactionStatus::Failed, "retries_exhausted", now)
                                .gateway(gateway_id)
                                .error(code, message)
                                .retry_count(attempts)
                                .next_retry_at(None),
                        )
                        .await?
                        .into_transaction();
                    self.dead_letter(&exhausted, now).await
                }
            }
        }
    }

    /// A `Failed` transaction that used up its attempts but has not reached
    /// `DeadLettered` yet.
    pub fn is_exhausted(&self, tx: &PaymentTransaction) -> bool {
        tx.status == TransactionStatus::Failed
            && tx.next_retry_at.is_none()
            && !tx.is_approval_rejected()
            && self
                .gateway_config(tx, None)
                .is_ok_and(|gateway| tx.retry_count >= gateway.retry_attempts)
    }

    /// Finishes dead-lettering a transaction stranded between its last failed
    /// attempt and its dead-letter entry.
    pub async fn dead_letter_exhausted(
        &self,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<RetryDecision> {
        let tx = self.machine.load(transaction_id).await?;
        if !self.is_exhausted(&tx) {
            return Ok(RetryDecision::Skipped);
        }
        self.dead_letter(&tx, now).await
    }

    /// Queues the dead-letter entry, then moves the transaction to
    /// `DeadLettered`.
    ///
    /// The entry is written first and the store keeps at most one pending
    /// entry per transaction, so a failure at either step is repaired by
    /// running this again.
    async fn dead_letter(&self, tx: &PaymentTransaction, now: DateTime<Utc>) -> Result<RetryDecision> {
        let reason = format!(
            "{}: {}",
            tx.last_error_code.as_deref().unwrap_or("UNKNOWN"),
            tx.last_error_message.as_deref().unwrap_or("no detail")
        );
        let entry = self
            .dead_letters
            .insert(DeadLetterEntry::new(
                tx.id,
                tx.reference.clone(),
                reason,
                tx.retry_count,
                now,
            ))
            .await?;

        let outcome = self
            .machine
            .apply_with_reload(
                tx.id,
                Transition::to(TransactionStatus::DeadLettered, "dead_lettered", now)
                    .details(format!("{} attempts exhausted", tx.retry_count)),
            )
            .await;
        match outcome {
            Ok(TransitionOutcome::Applied(_)) => {
                warn!(reference = %tx.reference, attempts = tx.retry_count, entry_id = %entry.id, "Transaction dead-lettered");
                Ok(RetryDecision::DeadLettered { entry_id: entry.id })
            }
            Ok(TransitionOutcome::Unchanged(_)) => Ok(RetryDecision::DeadLettered { entry_id: entry.id }),
            // A late confirmation won the race.
            Err(PaymentError::InvalidTransition {
                from: TransactionStatus::Completed,
                ..
            }) => {
                self.settle_dead_letters(tx.id, "system", now).await?;
                Ok(RetryDecision::Skipped)
            }
            Err(PaymentError::InvalidTransition { from, .. }) => {
                warn!(reference = %tx.reference, %from, entry_id = %entry.id, "Dead-letter entry queued for a transaction that moved on");
                Ok(RetryDecision::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Attaches a provider report to the transaction's pending entry so the
    /// operator sees it when deciding. Returns whether anything was recorded.
    pub async fn record_provider_report(&self, transaction_id: Uuid, report: String) -> Result<bool> {
        let mut recorded = false;
        for mut entry in self.dead_letters.for_transaction(transaction_id).await? {
            if entry.add_provider_report(report.clone()) {
                self.dead_letters.update(entry).await?;
                recorded = true;
            }
        }
        Ok(recorded)
    }

    /// Closes pending entries of a transaction the provider confirmed before
    /// it reached `DeadLettered`.
    pub async fn settle_dead_letters(
        &self,
        transaction_id: Uuid,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        for mut entry in self.dead_letters.for_transaction(transaction_id).await? {
            if entry.status == DeadLetterStatus::Pending {
                entry.close(
                    DeadLetterAction::Resolve,
                    actor,
                    Some("Confirmed by provider".to_string()),
                    now,
                )?;
                self.dead_letters.update(entry).await?;
            }
        }
        Ok(())
    }

    /// Lets an operator pull a transaction back out of `Failed` early, or push
    /// it out to a later time. Approval rejections are never retried.
    pub async fn schedule_manual_retry(
        &self,
        transaction_id: Uuid,
        at: DateTime<Utc>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        self.machine
            .amend(transaction_id, "manual_retry_scheduled", actor, now, |tx| {
                if tx.status != TransactionStatus::Failed {
                    return Err(PaymentError::ValidationError(format!(
                        "Transaction {} is {}, only failed transactions can be retried",
                        tx.reference, tx.status
                    )));
                }
                if tx.is_approval_rejected() {
                    return Err(PaymentError::ApprovalRejected(format!(
                        "Transaction {} was rejected by an approver",
                        tx.reference
                    )));
                }
                if self.is_exhausted(tx) {
                    return Err(PaymentError::RetriesExhausted(tx.reference.clone()));
                }
                tx.next_retry_at = Some(at);
                Ok(Some(format!("next attempt at {}", at)))
            })
            .await
    }

    pub async fn process_dead_letter(
        &self,
        entry_id: Uuid,
        action: DeadLetterAction,
        reviewer: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterResolution> {
        let mut entry = self
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Dead-letter entry {}", entry_id)))?;
        if entry.status != DeadLetterStatus::Pending {
            return Err(PaymentError::ValidationError(format!(
                "Dead-letter entry {} is already {:?}",
                entry.id, entry.status
            )));
        }

        let transition = match action {
            DeadLetterAction::Retry => {
                Transition::to(TransactionStatus::Processing, "dead_letter_retry", now).retry_count(0)
            }
            DeadLetterAction::Resolve => {
                Transition::to(TransactionStatus::Completed, "dead_letter_resolved", now).reconciled()
            }
            DeadLetterAction::Discard => {
                Transition::to(TransactionStatus::Cancelled, "dead_letter_discarded", now)
            }
        };
        let mut transition = transition.by(reviewer).releasing_dead_letter();
        if let Some(notes) = &notes {
            transition = transition.details(notes.clone());
        }

        let current = self.machine.load(entry.transaction_id).await?;
        if current.status != TransactionStatus::DeadLettered {
            return Err(PaymentError::InvalidTransition {
                from: current.status,
                to: transition.target(),
            });
        }
        let transaction = self
            .machine
            .apply(&current, transition)
            .await?
            .into_transaction();

        entry.close(action, reviewer, notes, now)?;
        self.dead_letters.update(entry.clone()).await?;
        info!(reference = %transaction.reference, ?action, reviewer, "Dead-letter entry processed");

        Ok(DeadLetterResolution {
            entry,
            transaction,
            redispatch: action == DeadLetterAction::Retry,
        })
    }
}
