use super::state_machine::{TransactionStateMachine, Transition};
use crate::config::ProcessorConfig;
use crate::domain::approval::{ApprovalRequest, ApprovalStatus, Approver};
use crate::domain::ports::ApprovalStoreRef;
use crate::domain::transaction::{APPROVAL_REJECTED, PaymentTransaction, TransactionStatus};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

const MAX_RELOADS: u32 = 5;

/// Where an approval request stands after a decision.
#[derive(Debug, Clone)]
pub enum ApprovalProgress {
    /// More levels remain.
    Advanced(ApprovalRequest),
    /// Every level signed; the transaction is now `Approved`.
    Approved {
        request: ApprovalRequest,
        transaction: PaymentTransaction,
    },
}

#[derive(Clone)]
pub struct ApprovalWorkflow {
    machine: TransactionStateMachine,
    approvals: ApprovalStoreRef,
    config: Arc<ProcessorConfig>,
}

impl ApprovalWorkflow {
    pub fn new(
        machine: TransactionStateMachine,
        approvals: ApprovalStoreRef,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self {
            machine,
            approvals,
            config,
        }
    }

    /// Opens a request whose chain is fixed from the configured bands.
    pub async fn request_approval(
        &self,
        tx: &PaymentTransaction,
        requester: &str,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        let roles = self.config.approval_chain(tx.amount);
        let request = ApprovalRequest::new(tx.id, tx.amount, requester, roles, now)?;
        self.approvals.insert(request.clone()).await?;
        info!(
            reference = %tx.reference,
            levels = request.chain.len(),
            "Approval requested"
        );
        Ok(request)
    }

    pub async fn get(&self, request_id: Uuid) -> Result<ApprovalRequest> {
        self.approvals
            .get(request_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Approval request {}", request_id)))
    }

    pub async fn for_transaction(&self, transaction_id: Uuid) -> Result<Vec<ApprovalRequest>> {
        self.approvals.for_transaction(transaction_id).await
    }

    /// Loads the request, lets `decide` mutate it and stores it with a
    /// version check, retrying on conflicts.
    async fn update<F>(&self, request_id: Uuid, decide: F) -> Result<ApprovalRequest>
    where
        F: Fn(&mut ApprovalRequest) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(request_id).await?;
            let mut updated = current.clone();
            decide(&mut updated)?;
            match self.approvals.update(updated, current.version).await {
                Err(PaymentError::ConcurrencyConflict(_)) if attempt < MAX_RELOADS => continue,
                other => return other,
            }
        }
    }

    async fn ensure_awaiting_approval(&self, request_id: Uuid) -> Result<()> {
        let request = self.get(request_id).await?;
        match request.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Rejected => {
                return Err(PaymentError::ApprovalRejected(format!(
                    "Approval request {} was rejected",
                    request.id
                )));
            }
            other => {
                return Err(PaymentError::ValidationError(format!(
                    "Approval request {} is already {:?}",
                    request.id, other
                )));
            }
        }
        let tx = self.machine.load(request.transaction_id).await?;
        if tx.status != TransactionStatus::PendingApproval {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} is {}, not awaiting approval",
                tx.reference, tx.status
            )));
        }
        Ok(())
    }

    pub async fn approve(
        &self,
        request_id: Uuid,
        approver: &Approver,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalProgress> {
        self.ensure_awaiting_approval(request_id).await?;
        let request = self
            .update(request_id, |request| {
                request.approve(approver, comments.clone(), now).map(|_| ())
            })
            .await?;

        if request.status != ApprovalStatus::Approved {
            info!(
                request = %request.id,
                approver = %approver.id,
                next_level = request.current_level,
                "Approval level signed"
            );
            return Ok(ApprovalProgress::Advanced(request));
        }

        let transaction = self
            .machine
            .apply_with_reload(
                request.transaction_id,
                Transition::to(TransactionStatus::Approved, "approved", now)
                    .by(approver.id.clone())
                    .details(format!("{} approval levels signed", request.chain.len())),
            )
            .await?
            .into_transaction();
        Ok(ApprovalProgress::Approved {
            request,
            transaction,
        })
    }

    /// Ends the request and fails the transaction for good.
    pub async fn reject(
        &self,
        request_id: Uuid,
        approver: &Approver,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<(ApprovalRequest, PaymentTransaction)> {
        self.ensure_awaiting_approval(request_id).await?;
        let request = self
            .update(request_id, |request| {
                request.reject(approver, reason.to_string(), now)
            })
            .await?;

        let transaction = self
            .machine
            .apply_with_reload(
                request.transaction_id,
                Transition::to(TransactionStatus::Failed, "approval_rejected", now)
                    .by(approver.id.clone())
                    .error(APPROVAL_REJECTED, reason)
                    .next_retry_at(None),
            )
            .await?
            .into_transaction();
        info!(reference = %transaction.reference, approver = %approver.id, "Approval rejected");
        Ok((request, transaction))
    }

    pub async fn delegate(
        &self,
        request_id: Uuid,
        from: &Approver,
        to_user: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        self.ensure_awaiting_approval(request_id).await?;
        let request = self
            .update(request_id, |request| {
                request.delegate(from, to_user, reason.clone(), now)
            })
            .await?;
        info!(
            request = %request.id,
            from = %from.id,
            to = to_user,
            level = request.current_level,
            "Approval level delegated"
        );
        Ok(request)
    }

    /// Withdraws every pending request of a cancelled or expired transaction.
    pub async fn cancel_for_transaction(&self, transaction_id: Uuid, now: DateTime<Utc>) -> Result<()> {
        for request in self.approvals.for_transaction(transaction_id).await? {
            if request.status == ApprovalStatus::Pending {
                self.update(request.id, |request| {
                    request.cancel(now);
                    Ok(())
                })
                .await?;
            }
        }
        Ok(())
    }
}
