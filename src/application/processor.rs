use super::approval::{ApprovalProgress, ApprovalWorkflow};
use super::circuit_breaker::CircuitBreakerRegistry;
use super::registry::GatewayRegistry;
use super::retry::{DeadLetterResolution, Failure, RetryDecision, RetryScheduler};
use super::state_machine::{TransactionEvent, TransactionStateMachine, Transition, TransitionOutcome};
use super::webhook::WebhookProcessor;
use crate::config::{GatewayConfig, ProcessorConfig};
use crate::domain::approval::{ApprovalRequest, Approver};
use crate::domain::dead_letter::{DeadLetterAction, DeadLetterEntry, DeadLetterStatus};
use crate::domain::gateway::{
    ERR_BAD_RESPONSE, ERR_NETWORK, GatewayAdapterRef, GatewayResponse, GatewayStatus, GatewayType,
};
use crate::domain::money::{Amount, Currency, FeeBreakdown};
use crate::domain::ports::Stores;
use crate::domain::transaction::{
    PaymentTransaction, PaymentTransactionLog, RetryAttempt, RetryAttemptStatus, RiskLevel,
    TransactionStatus,
};
use crate::domain::webhook::WebhookAck;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Datelike, Utc};
use dashmap::DashSet;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transactions a client may start within an hour before they are flagged.
const VELOCITY_LIMIT: usize = 5;

pub const ERR_NO_GATEWAY: &str = "NO_GATEWAY";

/// A payment as submitted by a cashier or a client channel.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub client_id: String,
    pub gateway_type: GatewayType,
    pub amount: Decimal,
    /// Falls back to the configured default currency.
    pub currency: Option<String>,
    pub payer_phone: Option<String>,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    pub description: Option<String>,
    pub requested_by: String,
}

impl NewPayment {
    pub fn new(client_id: impl Into<String>, gateway_type: GatewayType, amount: Decimal) -> Self {
        let client_id = client_id.into();
        Self {
            requested_by: client_id.clone(),
            client_id,
            gateway_type,
            amount,
            currency: None,
            payer_phone: None,
            payer_name: None,
            payer_email: None,
            description: None,
        }
    }

    pub fn payer_phone(mut self, phone: impl Into<String>) -> Self {
        self.payer_phone = Some(phone.into());
        self
    }

    pub fn requested_by(mut self, user: impl Into<String>) -> Self {
        self.requested_by = user.into();
        self
    }
}

/// Marks a transaction as having an attempt in flight until dropped.
struct InFlight {
    set: Arc<DashSet<Uuid>>,
    id: Uuid,
}

impl InFlight {
    fn claim(set: &Arc<DashSet<Uuid>>, id: Uuid) -> Result<Self> {
        if !set.insert(id) {
            return Err(PaymentError::ConcurrencyConflict(format!(
                "Transaction {} already has an attempt in flight",
                id
            )));
        }
        Ok(Self {
            set: Arc::clone(set),
            id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set.remove(&self.id);
    }
}

/// Whether a failed response says something about the gateway's health
/// rather than about the payer.
fn is_gateway_fault(response: &GatewayResponse) -> bool {
    if response.is_success {
        return false;
    }
    if response.timed_out {
        return true;
    }
    match response.error_code.as_deref() {
        Some(ERR_NETWORK) | Some(ERR_BAD_RESPONSE) => true,
        Some(code) => code.starts_with("HTTP_5"),
        None => true,
    }
}

fn validate_phone(phone: &str) -> Result<()> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit()) {
        Ok(())
    } else {
        Err(PaymentError::ValidationError(format!(
            "Invalid payer phone number '{}'",
            phone
        )))
    }
}

/// The payment processing core.
///
/// Owns the state machine, gateway registry, circuit breakers, retry
/// scheduler, approval workflow and webhook processor, and orchestrates them
/// for every admin and channel operation. Cloning is cheap; clones share all
/// state.
#[derive(Clone)]
pub struct PaymentProcessor {
    config: Arc<ProcessorConfig>,
    stores: Stores,
    machine: TransactionStateMachine,
    gateways: Arc<GatewayRegistry>,
    breakers: CircuitBreakerRegistry,
    retries: RetryScheduler,
    approvals: ApprovalWorkflow,
    webhooks: WebhookProcessor,
    in_flight: Arc<DashSet<Uuid>>,
}

impl PaymentProcessor {
    /// Builds a processor with one adapter per configured gateway.
    pub fn new(config: ProcessorConfig, stores: Stores) -> Result<Self> {
        let gateways = GatewayRegistry::from_config(&config.gateways)?;
        Self::with_gateways(config, stores, gateways)
    }

    /// Builds a processor around pre-built adapters.
    pub fn with_gateways(
        config: ProcessorConfig,
        stores: Stores,
        gateways: GatewayRegistry,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let gateways = Arc::new(gateways);
        let machine = TransactionStateMachine::new(stores.transactions.clone());
        let breakers = CircuitBreakerRegistry::from_config(&config.gateways);
        let retries = RetryScheduler::new(
            machine.clone(),
            stores.dead_letters.clone(),
            Arc::clone(&config),
        );
        let approvals =
            ApprovalWorkflow::new(machine.clone(), stores.approvals.clone(), Arc::clone(&config));
        let webhooks = WebhookProcessor::new(
            Arc::clone(&gateways),
            machine.clone(),
            retries.clone(),
            stores.webhooks.clone(),
        );
        Ok(Self {
            config,
            stores,
            machine,
            gateways,
            breakers,
            retries,
            approvals,
            webhooks,
            in_flight: Arc::new(DashSet::new()),
        })
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    pub fn gateways(&self) -> &GatewayRegistry {
        &self.gateways
    }

    /// Applied transitions, once each.
    pub fn subscribe(&self) -> broadcast::Receiver<TransactionEvent> {
        self.machine.subscribe()
    }

    pub async fn get(&self, id: Uuid) -> Result<PaymentTransaction> {
        self.machine.load(id).await
    }

    pub async fn find_by_reference(&self, reference: &str) -> Result<Option<PaymentTransaction>> {
        self.stores.transactions.find_by_reference(reference).await
    }

    pub async fn transactions(&self) -> Result<Vec<PaymentTransaction>> {
        self.stores.transactions.get_all().await
    }

    pub async fn history(&self, id: Uuid) -> Result<Vec<PaymentTransactionLog>> {
        self.stores.transactions.logs(id).await
    }

    pub async fn dead_letters(&self, status: Option<DeadLetterStatus>) -> Result<Vec<DeadLetterEntry>> {
        self.stores.dead_letters.list(status).await
    }

    pub async fn approval_requests(&self, transaction_id: Uuid) -> Result<Vec<ApprovalRequest>> {
        self.approvals.for_transaction(transaction_id).await
    }

    fn primary_gateway(&self, gateway_type: GatewayType) -> Result<&GatewayConfig> {
        self.config.primary_gateway(gateway_type).ok_or_else(|| {
            PaymentError::ValidationError(format!("No active gateway for {}", gateway_type))
        })
    }

    async fn check_limits(
        &self,
        client_id: &str,
        gateway: &GatewayConfig,
        amount: Decimal,
        now: DateTime<Utc>,
    ) -> Result<Vec<PaymentTransaction>> {
        let history = self.stores.transactions.for_client(client_id).await?;
        if gateway.daily_limit.is_none() && gateway.monthly_limit.is_none() {
            return Ok(history);
        }

        let counted = history
            .iter()
            .filter(|tx| tx.gateway_type == gateway.gateway_type && tx.counts_towards_limits());
        let (mut daily, mut monthly) = (Decimal::ZERO, Decimal::ZERO);
        for tx in counted {
            if tx.initiated_at.year() == now.year() && tx.initiated_at.month() == now.month() {
                monthly += tx.amount;
                if tx.initiated_at.day() == now.day() {
                    daily += tx.amount;
                }
            }
        }

        if let Some(limit) = gateway.daily_limit
            && daily + amount > limit
        {
            return Err(PaymentError::ValidationError(format!(
                "Daily limit {} for {} exceeded by client {}",
                limit, gateway.gateway_type, client_id
            )));
        }
        if let Some(limit) = gateway.monthly_limit
            && monthly + amount > limit
        {
            return Err(PaymentError::ValidationError(format!(
                "Monthly limit {} for {} exceeded by client {}",
                limit, gateway.gateway_type, client_id
            )));
        }
        Ok(history)
    }

    fn assess_risk(
        &self,
        tx: &mut PaymentTransaction,
        history: &[PaymentTransaction],
        now: DateTime<Utc>,
    ) {
        if let Some(threshold) = self.config.high_risk_amount
            && tx.amount >= threshold
        {
            tx.risk_factors.push("high_amount".to_string());
            tx.risk_level = RiskLevel::High;
            tx.requires_manual_review = true;
        }

        let recent = history
            .iter()
            .filter(|other| now - other.initiated_at <= chrono::Duration::hours(1))
            .count();
        if recent >= VELOCITY_LIMIT {
            tx.risk_factors.push("velocity".to_string());
            if tx.risk_level == RiskLevel::Low {
                tx.risk_level = RiskLevel::Medium;
            }
        }

        if tx.gateway_type == GatewayType::Card && tx.payer_email.is_none() {
            tx.risk_factors.push("card_without_email".to_string());
            if tx.risk_level == RiskLevel::Low {
                tx.risk_level = RiskLevel::Medium;
            }
        }
    }

    /// Validates, prices and stores a new payment, then routes it to approval
    /// or dispatches it straight away.
    ///
    /// Gateway failures are not errors here: the returned transaction shows
    /// where the first attempt left it.
    pub async fn create_transaction(
        &self,
        payment: NewPayment,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let amount = Amount::new(payment.amount)?;
        let currency = Currency::new(
            payment
                .currency
                .as_deref()
                .unwrap_or(&self.config.default_currency),
        )?;
        if payment.client_id.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "Client id is required".to_string(),
            ));
        }
        if payment.gateway_type == GatewayType::MobileMoney {
            let phone = payment.payer_phone.as_deref().ok_or_else(|| {
                PaymentError::ValidationError(
                    "Mobile money payments need a payer phone number".to_string(),
                )
            })?;
            validate_phone(phone)?;
        }

        let gateway = self.primary_gateway(payment.gateway_type)?;
        gateway.check_amount(amount.value())?;
        let history = self
            .check_limits(&payment.client_id, gateway, amount.value(), now)
            .await?;
        let breakdown = FeeBreakdown::new(amount, gateway.calculate_fee(amount.value()))?;

        let mut tx = PaymentTransaction::new(
            payment.client_id.clone(),
            payment.gateway_type,
            breakdown,
            currency,
            now,
            now + chrono::Duration::minutes(self.config.transaction_ttl_minutes),
        );
        tx.payer_phone = payment.payer_phone;
        tx.payer_name = payment.payer_name;
        tx.payer_email = payment.payer_email;
        tx.description = payment.description.unwrap_or_default();
        self.assess_risk(&mut tx, &history, now);

        let log = PaymentTransactionLog {
            id: Uuid::new_v4(),
            transaction_id: tx.id,
            previous_status: None,
            new_status: TransactionStatus::Initiated,
            action: "created".to_string(),
            details: (!tx.risk_factors.is_empty())
                .then(|| format!("risk factors: {}", tx.risk_factors.join(", "))),
            error_code: None,
            error_message: None,
            actor: payment.requested_by.clone(),
            created_at: now,
        };
        self.stores.transactions.insert(tx.clone(), log).await?;
        info!(
            reference = %tx.reference,
            client = %tx.client_id,
            gateway = %tx.gateway_type,
            amount = %tx.amount,
            fee = %tx.fee,
            "Transaction created"
        );

        if self.config.requires_approval(tx.amount) {
            let tx = self
                .machine
                .apply(
                    &tx,
                    Transition::to(TransactionStatus::PendingApproval, "approval_required", now)
                        .by(payment.requested_by.clone()),
                )
                .await?
                .into_transaction();
            self.approvals
                .request_approval(&tx, &payment.requested_by, now)
                .await?;
            return Ok(tx);
        }

        if tx.requires_manual_review {
            warn!(reference = %tx.reference, "Transaction held for manual review");
            return Ok(tx);
        }
        self.dispatch(tx.id, now).await
    }

    /// Starts one gateway attempt for a transaction that is ready to go.
    pub async fn dispatch(&self, id: Uuid, now: DateTime<Utc>) -> Result<PaymentTransaction> {
        let _guard = InFlight::claim(&self.in_flight, id)?;
        let tx = self.machine.load(id).await?;

        if tx.requires_manual_review {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} is awaiting manual review",
                tx.reference
            )));
        }
        if tx.is_expired(now) && tx.status.is_pre_completion() {
            return self.expire(&tx, now).await;
        }
        let action = match tx.status {
            TransactionStatus::Initiated if self.config.requires_approval(tx.amount) => {
                return Err(PaymentError::ValidationError(format!(
                    "Transaction {} needs approval before dispatch",
                    tx.reference
                )));
            }
            TransactionStatus::Initiated | TransactionStatus::Approved => "dispatch",
            TransactionStatus::Failed if tx.is_approval_rejected() => {
                return Err(PaymentError::ApprovalRejected(format!(
                    "Transaction {} was rejected by an approver",
                    tx.reference
                )));
            }
            TransactionStatus::Failed if self.retries.is_exhausted(&tx) => {
                return Err(PaymentError::RetriesExhausted(tx.reference.clone()));
            }
            TransactionStatus::Failed => "retry",
            TransactionStatus::Processing => {
                return Err(PaymentError::ConcurrencyConflict(format!(
                    "Transaction {} is already being processed",
                    tx.reference
                )));
            }
            other => {
                return Err(PaymentError::InvalidTransition {
                    from: other,
                    to: TransactionStatus::Processing,
                });
            }
        };

        let processing = self
            .machine
            .apply(&tx, Transition::to(TransactionStatus::Processing, action, now))
            .await?
            .into_transaction();
        self.attempt(processing, now).await
    }

    /// Runs the gateway call for a transaction already in `Processing`.
    async fn attempt(&self, tx: PaymentTransaction, now: DateTime<Utc>) -> Result<PaymentTransaction> {
        let (adapter, _permit) = match self.gateways.select(tx.gateway_type, &self.breakers, now) {
            Ok(selected) => selected,
            Err(PaymentError::NoGatewayAvailable {
                retry_at: Some(retry_at),
                ..
            }) => {
                self.retries
                    .handle_failure(tx.id, Failure::CircuitOpen { retry_at }, now)
                    .await?;
                return self.machine.load(tx.id).await;
            }
            Err(PaymentError::NoGatewayAvailable { gateway_type, .. }) => {
                let failure = Failure::Gateway {
                    gateway_id: None,
                    code: ERR_NO_GATEWAY.to_string(),
                    message: format!("No active gateway for {}", gateway_type),
                };
                self.retries.handle_failure(tx.id, failure, now).await?;
                return self.machine.load(tx.id).await;
            }
            Err(e) => return Err(e),
        };

        let request = tx.gateway_request();
        let started = Instant::now();
        let response = self
            .observed(&adapter, adapter.authorize(&request), now)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        self.stores
            .transactions
            .record_retry_attempt(RetryAttempt {
                id: Uuid::new_v4(),
                transaction_id: tx.id,
                attempt_number: tx.retry_count + 1,
                attempted_at: now,
                status: if response.is_success {
                    RetryAttemptStatus::Succeeded
                } else {
                    RetryAttemptStatus::Failed
                },
                error_message: response.error_message.clone(),
                duration_ms,
                next_retry_at: None,
            })
            .await?;

        debug!(
            reference = %tx.reference,
            gateway = adapter.id(),
            status = %response.status,
            duration_ms,
            "Gateway responded"
        );

        match response.status {
            GatewayStatus::Succeeded if response.is_success => {
                let outcome = self
                    .machine
                    .apply_with_reload(
                        tx.id,
                        Transition::to(TransactionStatus::Completed, "gateway_confirmed", now)
                            .gateway(adapter.id())
                            .provider_transaction_id(response.provider_transaction_id.clone()),
                    )
                    .await;
                match outcome {
                    Ok(outcome) => Ok(outcome.into_transaction()),
                    Err(PaymentError::InvalidTransition { from, .. }) => {
                        warn!(reference = %tx.reference, %from, "Confirmation arrived after the transaction moved on");
                        self.machine.load(tx.id).await
                    }
                    Err(e) => Err(e),
                }
            }
            GatewayStatus::Pending if response.is_success => {
                let provider_id = response.provider_transaction_id.clone();
                let gateway_id = adapter.id().to_string();
                let updated = self
                    .machine
                    .amend(tx.id, "provider_accepted", "system", now, |current| {
                        current.gateway_id = Some(gateway_id.clone());
                        if current.provider_transaction_id.is_none() {
                            current.provider_transaction_id = provider_id.clone();
                        }
                        Ok(Some("awaiting provider confirmation".to_string()))
                    })
                    .await?;
                if updated.cancel_requested
                    && updated.status == TransactionStatus::Processing
                    && adapter.supports_cancellation()
                {
                    return self.cancel_at_provider(&adapter, updated, "system", now).await;
                }
                Ok(updated)
            }
            _ => {
                let failure = Failure::Gateway {
                    gateway_id: Some(adapter.id().to_string()),
                    code: response.error_code_or_default(),
                    message: response.error_message_or_default(),
                };
                self.retries.handle_failure(tx.id, failure, now).await?;
                self.machine.load(tx.id).await
            }
        }
    }

    /// Bounds an adapter call by the gateway timeout.
    async fn bounded<F>(&self, adapter: &GatewayAdapterRef, call: F) -> GatewayResponse
    where
        F: Future<Output = GatewayResponse>,
    {
        let timeout = adapter.config().timeout();
        match tokio::time::timeout(timeout, call).await {
            Ok(response) => response,
            Err(_) => {
                warn!(gateway = adapter.id(), ?timeout, "Gateway call timed out");
                GatewayResponse::timeout(adapter.config().timeout_seconds)
            }
        }
    }

    /// Runs an adapter call under its timeout and feeds the outcome to the
    /// gateway's breaker. The caller must already hold a permit.
    async fn observed<F>(&self, adapter: &GatewayAdapterRef, call: F, now: DateTime<Utc>) -> GatewayResponse
    where
        F: Future<Output = GatewayResponse>,
    {
        let response = self.bounded(adapter, call).await;
        if is_gateway_fault(&response) {
            self.breakers.record_failure(adapter.id(), now);
        } else {
            self.breakers.record_success(adapter.id());
        }
        response
    }

    /// Like `observed`, but acquires the permit first. An open circuit fails
    /// with `CircuitOpen` and the adapter is not called.
    async fn guarded<F>(
        &self,
        adapter: &GatewayAdapterRef,
        call: F,
        now: DateTime<Utc>,
    ) -> Result<GatewayResponse>
    where
        F: Future<Output = GatewayResponse>,
    {
        self.breakers.try_acquire(adapter.id(), now)?;
        Ok(self.observed(adapter, call, now).await)
    }

    async fn expire(&self, tx: &PaymentTransaction, now: DateTime<Utc>) -> Result<PaymentTransaction> {
        let expired = self
            .machine
            .apply(
                tx,
                Transition::to(TransactionStatus::Expired, "expired", now)
                    .details(format!("expired at {}", tx.expires_at)),
            )
            .await?
            .into_transaction();
        if tx.status == TransactionStatus::PendingApproval {
            self.approvals.cancel_for_transaction(tx.id, now).await?;
        }
        Ok(expired)
    }

    pub async fn approve(
        &self,
        request_id: Uuid,
        approver: &Approver,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalProgress> {
        match self.approvals.approve(request_id, approver, comments, now).await? {
            ApprovalProgress::Approved {
                request,
                transaction,
            } => {
                if transaction.requires_manual_review {
                    info!(reference = %transaction.reference, "Approved, waiting for risk review");
                    return Ok(ApprovalProgress::Approved {
                        request,
                        transaction,
                    });
                }
                let transaction = match self.dispatch(transaction.id, now).await {
                    Ok(dispatched) => dispatched,
                    Err(e) => {
                        // The approval stands; dispatch can be called again.
                        warn!(reference = %transaction.reference, error = %e, "Dispatch after approval failed");
                        self.machine.load(transaction.id).await?
                    }
                };
                Ok(ApprovalProgress::Approved {
                    request,
                    transaction,
                })
            }
            advanced => Ok(advanced),
        }
    }

    pub async fn reject(
        &self,
        request_id: Uuid,
        approver: &Approver,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let (_, transaction) = self.approvals.reject(request_id, approver, reason, now).await?;
        Ok(transaction)
    }

    pub async fn delegate(
        &self,
        request_id: Uuid,
        from: &Approver,
        to_user: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRequest> {
        self.approvals
            .delegate(request_id, from, to_user, reason, now)
            .await
    }

    /// Cancels a payment that has not been collected.
    ///
    /// While a gateway call is in flight the cancellation is deferred unless
    /// the provider can void the collection.
    pub async fn cancel(
        &self,
        id: Uuid,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let tx = self.machine.load(id).await?;
        match tx.status {
            TransactionStatus::Processing => {
                if let (Some(adapter), Some(_)) = (
                    tx.gateway_id.as_deref().and_then(|g| self.gateways.lookup(g)),
                    tx.provider_transaction_id.as_deref(),
                ) && adapter.supports_cancellation()
                {
                    return self.cancel_at_provider(&adapter, tx, actor, now).await;
                }
                let reason = reason.to_string();
                let updated = self
                    .machine
                    .amend(id, "cancel_requested", actor, now, |current| {
                        if current.status != TransactionStatus::Processing {
                            return Err(PaymentError::ConcurrencyConflict(format!(
                                "Transaction {} left processing",
                                current.reference
                            )));
                        }
                        current.cancel_requested = true;
                        Ok(Some(reason.clone()))
                    })
                    .await?;
                info!(reference = %updated.reference, "Cancellation deferred until the gateway answers");
                Ok(updated)
            }
            TransactionStatus::DeadLettered => Err(PaymentError::ValidationError(format!(
                "Transaction {} is dead-lettered; discard its dead-letter entry instead",
                tx.reference
            ))),
            status if status.is_pre_completion() => {
                let cancelled = self
                    .machine
                    .apply(
                        &tx,
                        Transition::to(TransactionStatus::Cancelled, "cancelled", now)
                            .by(actor)
                            .details(reason),
                    )
                    .await?
                    .into_transaction();
                if status == TransactionStatus::PendingApproval {
                    self.approvals.cancel_for_transaction(id, now).await?;
                }
                info!(reference = %cancelled.reference, actor, "Transaction cancelled");
                Ok(cancelled)
            }
            other => Err(PaymentError::InvalidTransition {
                from: other,
                to: TransactionStatus::Cancelled,
            }),
        }
    }

    async fn cancel_at_provider(
        &self,
        adapter: &GatewayAdapterRef,
        tx: PaymentTransaction,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let Some(provider_id) = tx.provider_transaction_id.clone() else {
            return Ok(tx);
        };
        let refusal = match self.guarded(adapter, adapter.cancel(&provider_id), now).await {
            Ok(response) if response.is_success => None,
            Ok(response) => {
                warn!(
                    reference = %tx.reference,
                    code = %response.error_code_or_default(),
                    "Provider refused cancellation"
                );
                Some(response.error_message_or_default())
            }
            Err(e @ PaymentError::CircuitOpen { .. }) => {
                warn!(reference = %tx.reference, error = %e, "Cancellation deferred, gateway circuit open");
                Some(e.to_string())
            }
            Err(e) => return Err(e),
        };
        if let Some(detail) = refusal {
            return self
                .machine
                .amend(tx.id, "cancel_requested", actor, now, |current| {
                    current.cancel_requested = true;
                    Ok(Some(detail.clone()))
                })
                .await;
        }
        let outcome = self
            .machine
            .apply_with_reload(
                tx.id,
                Transition::to(TransactionStatus::Cancelled, "cancelled_at_provider", now).by(actor),
            )
            .await;
        match outcome {
            Ok(outcome) => Ok(outcome.into_transaction()),
            Err(PaymentError::InvalidTransition { .. }) => self.machine.load(tx.id).await,
            Err(e) => Err(e),
        }
    }

    /// Refunds a completed payment through its gateway.
    pub async fn refund(&self, id: Uuid, actor: &str, now: DateTime<Utc>) -> Result<PaymentTransaction> {
        let tx = self.machine.load(id).await?;
        if tx.status != TransactionStatus::Completed {
            return Err(PaymentError::InvalidTransition {
                from: tx.status,
                to: TransactionStatus::RefundRequested,
            });
        }
        let (Some(gateway_id), Some(provider_id)) =
            (tx.gateway_id.clone(), tx.provider_transaction_id.clone())
        else {
            return Err(PaymentError::ValidationError(format!(
                "Transaction {} was settled outside a gateway and cannot be refunded",
                tx.reference
            )));
        };
        let adapter = self
            .gateways
            .lookup(&gateway_id)
            .ok_or_else(|| PaymentError::NotFound(format!("Gateway {}", gateway_id)))?;
        self.breakers.try_acquire(adapter.id(), now)?;

        let requested = self
            .machine
            .apply(
                &tx,
                Transition::to(TransactionStatus::RefundRequested, "refund_requested", now).by(actor),
            )
            .await?
            .into_transaction();

        let response = self
            .observed(&adapter, adapter.refund(&provider_id, requested.amount), now)
            .await;
        let transition = match (response.is_success, response.status) {
            (true, GatewayStatus::Pending) => {
                info!(reference = %requested.reference, "Refund pending at provider");
                return Ok(requested);
            }
            (true, _) => Transition::to(TransactionStatus::Refunded, "refunded", now).by(actor),
            (false, _) => Transition::to(TransactionStatus::Completed, "refund_declined", now)
                .by(actor)
                .error(
                    response.error_code_or_default(),
                    response.error_message_or_default(),
                ),
        };
        let outcome = self.machine.apply_with_reload(id, transition).await?;
        Ok(outcome.into_transaction())
    }

    pub async fn schedule_manual_retry(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        self.retries.schedule_manual_retry(id, at, actor, now).await
    }

    pub async fn process_dead_letter(
        &self,
        entry_id: Uuid,
        action: DeadLetterAction,
        reviewer: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<DeadLetterResolution> {
        let entry = self
            .stores
            .dead_letters
            .get(entry_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("Dead-letter entry {}", entry_id)))?;
        let _guard = InFlight::claim(&self.in_flight, entry.transaction_id)?;

        let mut resolution = self
            .retries
            .process_dead_letter(entry_id, action, reviewer, notes, now)
            .await?;
        if resolution.redispatch {
            resolution.transaction = self.attempt(resolution.transaction, now).await?;
        }
        Ok(resolution)
    }

    /// Asks the provider for the authoritative status and applies it.
    ///
    /// Fails with `CircuitOpen` without calling the provider while its
    /// circuit is open, and with `GatewayError` when the inquiry itself
    /// times out or errors.
    pub async fn reconcile(&self, id: Uuid, now: DateTime<Utc>) -> Result<PaymentTransaction> {
        let tx = self.machine.load(id).await?;
        let adapter = tx.gateway_id.as_deref().and_then(|g| self.gateways.lookup(g));
        let (Some(adapter), Some(provider_id)) = (adapter, tx.provider_transaction_id.clone())
        else {
            if tx.status == TransactionStatus::Completed && !tx.is_reconciled {
                return self.mark_reconciled(id, "no provider record", now).await;
            }
            return Ok(tx);
        };

        match tx.status {
            TransactionStatus::Completed
            | TransactionStatus::Processing
            | TransactionStatus::Failed => {}
            _ => return Ok(tx),
        }

        let response = self
            .guarded(&adapter, adapter.inquire(&provider_id), now)
            .await?;
        if is_gateway_fault(&response) {
            return Err(PaymentError::GatewayError {
                code: response.error_code_or_default(),
                message: response.error_message_or_default(),
            });
        }
        match (tx.status, response.is_success, response.status) {
            (TransactionStatus::Completed, true, GatewayStatus::Succeeded) => {
                self.mark_reconciled(id, "confirmed by provider", now).await
            }
            (TransactionStatus::Completed, _, reported) => {
                let detail = format!("provider reports {}", reported);
                error!(reference = %tx.reference, %reported, "Completed transaction disputed by provider");
                self.flag_for_review(id, "reconciliation", &detail, now).await
            }
            (_, true, GatewayStatus::Succeeded) => {
                let outcome = self
                    .machine
                    .apply_with_reload(
                        id,
                        Transition::to(TransactionStatus::Completed, "reconciled", now)
                            .reconciled()
                            .details("confirmed by provider inquiry"),
                    )
                    .await?;
                if let TransitionOutcome::Applied(tx) = &outcome {
                    self.retries.settle_dead_letters(tx.id, "reconciliation", now).await?;
                }
                Ok(outcome.into_transaction())
            }
            (TransactionStatus::Processing, false, GatewayStatus::Failed) => {
                let failure = Failure::Gateway {
                    gateway_id: Some(adapter.id().to_string()),
                    code: response.error_code_or_default(),
                    message: response.error_message_or_default(),
                };
                self.retries.handle_failure(id, failure, now).await?;
                self.machine.load(id).await
            }
            _ => Ok(tx),
        }
    }

    async fn mark_reconciled(&self, id: Uuid, detail: &str, now: DateTime<Utc>) -> Result<PaymentTransaction> {
        let detail = detail.to_string();
        self.machine
            .amend(id, "reconciled", "reconciliation", now, |tx| {
                tx.is_reconciled = true;
                Ok(Some(detail.clone()))
            })
            .await
    }

    /// Expires every non-final, uncollected transaction past its deadline.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<PaymentTransaction>> {
        let mut expired = Vec::new();
        for tx in self.stores.transactions.get_all().await? {
            if !tx.status.is_pre_completion() || !tx.is_expired(now) || self.in_flight.contains(&tx.id) {
                continue;
            }
            match self.expire(&tx, now).await {
                Ok(tx) => expired.push(tx),
                Err(PaymentError::ConcurrencyConflict(_)) => {
                    debug!(reference = %tx.reference, "Skipping expiry of a transaction that changed");
                }
                Err(e) => return Err(e),
            }
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale transactions");
        }
        Ok(expired)
    }

    pub async fn flag_for_review(
        &self,
        id: Uuid,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let reason = reason.to_string();
        let flagged = self
            .machine
            .amend(id, "flagged_for_review", actor, now, |tx| {
                tx.requires_manual_review = true;
                tx.risk_factors.push(reason.clone());
                Ok(Some(reason.clone()))
            })
            .await?;
        warn!(reference = %flagged.reference, actor, "Transaction flagged for review");
        Ok(flagged)
    }

    /// Clears a review hold. An approved transaction that was waiting on the
    /// review is dispatched; a rejected one is blocked.
    pub async fn review(
        &self,
        id: Uuid,
        reviewer: &str,
        approved: bool,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        if !approved {
            return self.block(id, reviewer, "rejected in risk review", now).await;
        }
        let reviewer_id = reviewer.to_string();
        let reviewed = self
            .machine
            .amend(id, "review_approved", reviewer, now, |tx| {
                if !tx.requires_manual_review {
                    return Err(PaymentError::ValidationError(format!(
                        "Transaction {} is not awaiting review",
                        tx.reference
                    )));
                }
                tx.requires_manual_review = false;
                tx.reviewed_by = Some(reviewer_id.clone());
                tx.reviewed_at = Some(now);
                Ok(None)
            })
            .await?;
        match reviewed.status {
            TransactionStatus::Initiated | TransactionStatus::Approved => self.dispatch(id, now).await,
            _ => Ok(reviewed),
        }
    }

    /// Marks the payment high risk and cancels it.
    pub async fn block(
        &self,
        id: Uuid,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<PaymentTransaction> {
        let actor_id = actor.to_string();
        let reason_text = reason.to_string();
        self.machine
            .amend(id, "blocked", actor, now, |tx| {
                tx.risk_level = RiskLevel::High;
                tx.risk_factors.push(format!("blocked: {}", reason_text));
                tx.requires_manual_review = false;
                tx.reviewed_by = Some(actor_id.clone());
                tx.reviewed_at = Some(now);
                Ok(Some(reason_text.clone()))
            })
            .await?;
        self.cancel(id, actor, reason, now).await
    }

    pub async fn handle_webhook(
        &self,
        gateway_id: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<WebhookAck> {
        self.webhooks.handle(gateway_id, headers, body, now).await
    }

    /// Completes dead-lettering for transactions whose last attempt failed
    /// but whose entry or final transition was never written.
    pub async fn repair_exhausted(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut repaired = 0;
        for tx in self.stores.transactions.get_all().await? {
            if !self.retries.is_exhausted(&tx) {
                continue;
            }
            let Ok(_guard) = InFlight::claim(&self.in_flight, tx.id) else {
                continue;
            };
            match self.retries.dead_letter_exhausted(tx.id, now).await {
                Ok(RetryDecision::DeadLettered { entry_id }) => {
                    info!(reference = %tx.reference, %entry_id, "Repaired stranded dead letter");
                    repaired += 1;
                }
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!(reference = %tx.reference, error = %e, "Dead-letter repair deferred");
                }
                Err(e) => error!(reference = %tx.reference, error = %e, "Dead-letter repair failed"),
            }
        }
        Ok(repaired)
    }

    /// Dispatches every failed transaction whose retry time has come, each in
    /// its own task. Returns how many attempts were started.
    ///
    /// Stranded dead letters are repaired first.
    pub async fn run_due_retries(&self, now: DateTime<Utc>) -> Result<usize> {
        self.repair_exhausted(now).await?;
        let due = self.stores.transactions.due_for_retry(now).await?;
        let mut tasks = JoinSet::new();
        for tx in due {
            let processor = self.clone();
            tasks.spawn(async move { (tx.reference.clone(), processor.dispatch(tx.id, now).await) });
        }

        let mut started = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(_))) => started += 1,
                Ok((reference, Err(PaymentError::ConcurrencyConflict(reason)))) => {
                    debug!(%reference, %reason, "Retry already running elsewhere");
                }
                Ok((reference, Err(e))) => {
                    error!(%reference, error = %e, "Retry dispatch failed");
                }
                Err(e) => error!(error = %e, "Retry task panicked"),
            }
        }
        Ok(started)
    }

    /// Background driver: runs due retries and expiry on a fixed interval.
    pub fn spawn_retry_poller(&self, every: Duration) -> JoinHandle<()> {
        let processor = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                if let Err(e) = processor.run_due_retries(now).await {
                    error!(error = %e, "Retry sweep failed");
                }
                if let Err(e) = processor.expire_stale(now).await {
                    error!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::gateways::SandboxAdapter;
    use rust_decimal_macros::dec;

    struct Harness {
        processor: PaymentProcessor,
        orange: Arc<SandboxAdapter>,
        card: Arc<SandboxAdapter>,
    }

    fn harness() -> Harness {
        let config = ProcessorConfig::sandbox();
        let orange = Arc::new(SandboxAdapter::new(
            config.gateway("orange-money").unwrap().clone(),
        ));
        let card = Arc::new(SandboxAdapter::new(config.gateway("visa-card").unwrap().clone()));
        let mut gateways = GatewayRegistry::new();
        gateways.register(orange.clone());
        gateways.register(card.clone());
        let processor =
            PaymentProcessor::with_gateways(config, Stores::in_memory(), gateways).unwrap();
        Harness {
            processor,
            orange,
            card,
        }
    }

    fn momo(amount: Decimal) -> NewPayment {
        NewPayment::new("TIN-001", GatewayType::MobileMoney, amount).payer_phone("+23276123456")
    }

    #[tokio::test]
    async fn test_small_payment_completes_immediately() {
        let h = harness();
        let now = Utc::now();
        let tx = h.processor.create_transaction(momo(dec!(1000)), now).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(tx.fee, dec!(15));
        assert_eq!(tx.net_amount, dec!(985));
        assert_eq!(tx.gateway_id.as_deref(), Some("orange-money"));
        assert!(tx.provider_transaction_id.is_some());

        let statuses: Vec<_> = h
            .processor
            .history(tx.id)
            .await
            .unwrap()
            .into_iter()
            .map(|log| log.new_status)
            .collect();
        assert_eq!(
            statuses,
            vec![
                TransactionStatus::Initiated,
                TransactionStatus::Processing,
                TransactionStatus::Completed
            ]
        );
    }

    #[tokio::test]
    async fn test_validation_errors() {
        let h = harness();
        let now = Utc::now();
        let zero = h.processor.create_transaction(momo(dec!(0)), now).await;
        assert!(matches!(zero, Err(PaymentError::ValidationError(_))));

        let no_phone = NewPayment::new("TIN-001", GatewayType::MobileMoney, dec!(10));
        assert!(h.processor.create_transaction(no_phone, now).await.is_err());

        let mut bad_currency = momo(dec!(10));
        bad_currency.currency = Some("LEONES".to_string());
        assert!(h.processor.create_transaction(bad_currency, now).await.is_err());

        let too_small = momo(dec!(0.5));
        assert!(h.processor.create_transaction(too_small, now).await.is_err());
        assert!(h.processor.transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_daily_limit() {
        let mut config = ProcessorConfig::sandbox();
        for gateway in config.gateways.iter_mut() {
            gateway.daily_limit = Some(dec!(1500));
        }
        let processor = PaymentProcessor::new(config, Stores::in_memory()).unwrap();
        let now = Utc::now();
        processor.create_transaction(momo(dec!(1000)), now).await.unwrap();
        let over = processor.create_transaction(momo(dec!(600)), now).await;
        assert!(matches!(over, Err(PaymentError::ValidationError(_))));
        processor.create_transaction(momo(dec!(500)), now).await.unwrap();
    }

    #[tokio::test]
    async fn test_large_payment_waits_for_approval() {
        let h = harness();
        let now = Utc::now();
        let tx = h
            .processor
            .create_transaction(momo(dec!(600000)).requested_by("cashier-1"), now)
            .await
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::PendingApproval);
        assert_eq!(h.orange.authorize_calls(), 0);

        let requests = h.processor.approval_requests(tx.id).await.unwrap();
        assert_eq!(requests.len(), 1);
        let progress = h
            .processor
            .approve(requests[0].id, &Approver::new("sup-1", &["supervisor"]), None, now)
            .await
            .unwrap();
        let ApprovalProgress::Approved { transaction, .. } = progress else {
            panic!("expected approval");
        };
        assert_eq!(transaction.status, TransactionStatus::Completed);
        assert_eq!(h.orange.authorize_calls(), 1);
    }

    #[tokio::test]
    async fn test_high_risk_payment_is_held_for_review() {
        let h = harness();
        let now = Utc::now();
        let tx = h
            .processor
            .create_transaction(momo(dec!(2500000)).requested_by("cashier-1"), now)
            .await
            .unwrap();
        assert!(tx.requires_manual_review);
        assert_eq!(tx.risk_level, RiskLevel::High);

        let request = h.processor.approval_requests(tx.id).await.unwrap().remove(0);
        h.processor
            .approve(request.id, &Approver::new("sup-1", &["supervisor"]), None, now)
            .await
            .unwrap();
        let progress = h
            .processor
            .approve(request.id, &Approver::new("fm-1", &["finance_manager"]), None, now)
            .await
            .unwrap();
        let ApprovalProgress::Approved { transaction, .. } = progress else {
            panic!("expected approval");
        };
        assert_eq!(transaction.status, TransactionStatus::Approved);
        assert_eq!(h.orange.authorize_calls(), 0);

        let reviewed = h.processor.review(tx.id, "risk-1", true, now).await.unwrap();
        assert_eq!(reviewed.status, TransactionStatus::Completed);
        assert_eq!(reviewed.reviewed_by.as_deref(), Some("risk-1"));
    }

    #[tokio::test]
    async fn test_pending_then_deferred_cancel() {
        let h = harness();
        let now = Utc::now();
        h.orange.push_response(GatewayResponse::pending("OM-77"));
        let tx = h.processor.create_transaction(momo(dec!(100)), now).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Processing);
        assert_eq!(tx.provider_transaction_id.as_deref(), Some("OM-77"));

        // Sandbox gateway cannot void, so the cancel waits for the outcome.
        let deferred = h.processor.cancel(tx.id, "cashier-1", "payer left", now).await.unwrap();
        assert_eq!(deferred.status, TransactionStatus::Processing);
        assert!(deferred.cancel_requested);
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch() {
        let h = harness();
        let now = Utc::now();
        let tx = h
            .processor
            .create_transaction(momo(dec!(700000)), now)
            .await
            .unwrap();
        let cancelled = h.processor.cancel(tx.id, "cashier-1", "duplicate", now).await.unwrap();
        assert_eq!(cancelled.status, TransactionStatus::Cancelled);
        let request = h.processor.approval_requests(tx.id).await.unwrap().remove(0);
        assert_eq!(request.status, crate::domain::approval::ApprovalStatus::Cancelled);

        assert!(matches!(
            h.processor.cancel(tx.id, "cashier-1", "again", now).await,
            Err(PaymentError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_refund_round_trip() {
        let h = harness();
        let now = Utc::now();
        let payment = NewPayment {
            payer_email: Some("payer@example.com".to_string()),
            ..NewPayment::new("TIN-002", GatewayType::Card, dec!(5000))
        };
        let tx = h.processor.create_transaction(payment, now).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(h.card.authorize_calls(), 1);

        let refunded = h.processor.refund(tx.id, "ops-1", now).await.unwrap();
        assert_eq!(refunded.status, TransactionStatus::Refunded);
        assert!(h.processor.refund(tx.id, "ops-1", now).await.is_err());
    }

    #[tokio::test]
    async fn test_expire_stale() {
        let h = harness();
        let now = Utc::now();
        let tx = h
            .processor
            .create_transaction(momo(dec!(800000)), now)
            .await
            .unwrap();
        let later = now + chrono::Duration::minutes(h.processor.config().transaction_ttl_minutes + 1);
        assert!(h.processor.expire_stale(now).await.unwrap().is_empty());
        let expired = h.processor.expire_stale(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(h.processor.get(tx.id).await.unwrap().status, TransactionStatus::Expired);
    }

    #[tokio::test]
    async fn test_block_cancels_and_marks_high_risk() {
        let h = harness();
        let now = Utc::now();
        let tx = h
            .processor
            .create_transaction(momo(dec!(550000)), now)
            .await
            .unwrap();
        let blocked = h.processor.block(tx.id, "risk-1", "stolen wallet", now).await.unwrap();
        assert_eq!(blocked.status, TransactionStatus::Cancelled);
        assert_eq!(blocked.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_reconcile_completes_processing_transaction() {
        let h = harness();
        let now = Utc::now();
        h.orange.push_response(GatewayResponse::pending("OM-9"));
        let tx = h.processor.create_transaction(momo(dec!(100)), now).await.unwrap();
        assert_eq!(tx.status, TransactionStatus::Processing);

        h.orange.push_inquiry(GatewayResponse::succeeded("OM-9"));
        let reconciled = h.processor.reconcile(tx.id, now).await.unwrap();
        assert_eq!(reconciled.status, TransactionStatus::Completed);
        assert!(reconciled.is_reconciled);
    }

    fn trip(processor: &PaymentProcessor, gateway_id: &str, now: DateTime<Utc>) {
        for _ in 0..5 {
            processor.breakers().record_failure(gateway_id, now);
        }
        assert_eq!(
            processor.breakers().state(gateway_id),
            crate::domain::circuit::CircuitState::Open
        );
    }

    #[tokio::test]
    async fn test_open_circuit_blocks_reconcile_and_refund() {
        let h = harness();
        let now = Utc::now();
        h.orange.push_response(GatewayResponse::pending("OM-12"));
        let pending = h.processor.create_transaction(momo(dec!(100)), now).await.unwrap();
        let payment = NewPayment {
            payer_email: Some("payer@example.com".to_string()),
            ..NewPayment::new("TIN-002", GatewayType::Card, dec!(5000))
        };
        let paid = h.processor.create_transaction(payment, now).await.unwrap();
        assert_eq!(paid.status, TransactionStatus::Completed);

        trip(&h.processor, "orange-money", now);
        trip(&h.processor, "visa-card", now);

        assert!(matches!(
            h.processor.reconcile(pending.id, now).await,
            Err(PaymentError::CircuitOpen { .. })
        ));
        assert_eq!(h.orange.inquiry_calls(), 0);
        assert_eq!(h.processor.get(pending.id).await.unwrap().status, TransactionStatus::Processing);

        assert!(matches!(
            h.processor.refund(paid.id, "ops-1", now).await,
            Err(PaymentError::CircuitOpen { .. })
        ));
        assert_eq!(h.card.refund_calls(), 0);
        assert_eq!(h.processor.get(paid.id).await.unwrap().status, TransactionStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_is_deferred_while_circuit_open() {
        let config = ProcessorConfig::sandbox();
        let orange = Arc::new(
            SandboxAdapter::new(config.gateway("orange-money").unwrap().clone()).with_cancellation(),
        );
        let mut gateways = GatewayRegistry::new();
        gateways.register(orange.clone());
        let processor =
            PaymentProcessor::with_gateways(config, Stores::in_memory(), gateways).unwrap();
        let now = Utc::now();
        orange.push_response(GatewayResponse::pending("OM-14"));
        let tx = processor.create_transaction(momo(dec!(100)), now).await.unwrap();

        trip(&processor, "orange-money", now);
        let deferred = processor.cancel(tx.id, "cashier-1", "payer left", now).await.unwrap();
        assert_eq!(deferred.status, TransactionStatus::Processing);
        assert!(deferred.cancel_requested);
    }

    #[tokio::test]
    async fn test_inquiry_timeouts_trip_the_breaker() {
        let h = harness();
        let now = Utc::now();
        h.orange.push_response(GatewayResponse::pending("OM-13"));
        let tx = h.processor.create_transaction(momo(dec!(100)), now).await.unwrap();

        for _ in 0..5 {
            h.orange.push_inquiry(GatewayResponse::timeout(30));
            assert!(matches!(
                h.processor.reconcile(tx.id, now).await,
                Err(PaymentError::GatewayError { .. })
            ));
        }
        assert_eq!(h.orange.inquiry_calls(), 5);
        assert_eq!(
            h.processor.breakers().state("orange-money"),
            crate::domain::circuit::CircuitState::Open
        );
        assert_eq!(h.processor.get(tx.id).await.unwrap().status, TransactionStatus::Processing);
    }

    #[tokio::test]
    async fn test_approval_survives_failed_dispatch() {
        let h = harness();
        let now = Utc::now();
        let tx = h
            .processor
            .create_transaction(momo(dec!(600000)).requested_by("cashier-1"), now)
            .await
            .unwrap();
        let request = h.processor.approval_requests(tx.id).await.unwrap().remove(0);

        // Someone else holds the transaction when the last approval lands.
        h.processor.in_flight.insert(tx.id);
        let progress = h
            .processor
            .approve(request.id, &Approver::new("sup-1", &["supervisor"]), None, now)
            .await
            .unwrap();
        let ApprovalProgress::Approved { transaction, .. } = progress else {
            panic!("expected approval");
        };
        assert_eq!(transaction.status, TransactionStatus::Approved);
        assert_eq!(h.orange.authorize_calls(), 0);

        h.processor.in_flight.remove(&tx.id);
        let dispatched = h.processor.dispatch(tx.id, now).await.unwrap();
        assert_eq!(dispatched.status, TransactionStatus::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_retries_due_and_expires_stale() {
        let h = harness();
        let now = Utc::now();
        h.orange.push_response(GatewayResponse::failed("DECLINED", "try later"));
        let failed = h.processor.create_transaction(momo(dec!(100)), now).await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        h.processor
            .schedule_manual_retry(failed.id, now - chrono::Duration::seconds(1), "ops-1", now)
            .await
            .unwrap();

        let created = now - chrono::Duration::minutes(h.processor.config().transaction_ttl_minutes + 5);
        let stale = h
            .processor
            .create_transaction(momo(dec!(600000)), created)
            .await
            .unwrap();
        assert_eq!(stale.status, TransactionStatus::PendingApproval);

        let poller = h.processor.spawn_retry_poller(Duration::from_secs(5));
        for _ in 0..10 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let retried = h.processor.get(failed.id).await.unwrap();
            let expired = h.processor.get(stale.id).await.unwrap();
            if retried.status == TransactionStatus::Completed
                && expired.status == TransactionStatus::Expired
            {
                break;
            }
        }
        poller.abort();

        assert_eq!(h.processor.get(failed.id).await.unwrap().status, TransactionStatus::Completed);
        assert_eq!(h.orange.authorize_calls(), 2);
        assert_eq!(h.processor.get(stale.id).await.unwrap().status, TransactionStatus::Expired);
        let request = h.processor.approval_requests(stale.id).await.unwrap().remove(0);
        assert_eq!(request.status, crate::domain::approval::ApprovalStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_sweep_repairs_stranded_exhausted_transaction() {
        let h = harness();
        let now = Utc::now();
        h.orange.push_response(GatewayResponse::failed("DECLINED", "try later"));
        let failed = h.processor.create_transaction(momo(dec!(200)), now).await.unwrap();
        assert_eq!(failed.status, TransactionStatus::Failed);
        // Exhausted but never dead-lettered, as after a crash between writes.
        h.processor
            .machine
            .amend(failed.id, "retries_exhausted", "system", now, |tx| {
                tx.retry_count = 3;
                tx.next_retry_at = None;
                Ok(None)
            })
            .await
            .unwrap();
        assert!(matches!(
            h.processor.dispatch(failed.id, now).await,
            Err(PaymentError::RetriesExhausted(_))
        ));

        h.processor.run_due_retries(now).await.unwrap();
        assert_eq!(
            h.processor.get(failed.id).await.unwrap().status,
            TransactionStatus::DeadLettered
        );
        let entries = h.processor.dead_letters(Some(DeadLetterStatus::Pending)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].transaction_id, failed.id);
        assert_eq!(entries[0].retry_attempts, 3);
    }

    #[test]
    fn test_gateway_fault_classification() {
        assert!(is_gateway_fault(&GatewayResponse::timeout(30)));
        assert!(is_gateway_fault(&GatewayResponse::failed(ERR_NETWORK, "reset")));
        assert!(is_gateway_fault(&GatewayResponse::failed("HTTP_502", "bad gateway")));
        assert!(!is_gateway_fault(&GatewayResponse::failed("DECLINED", "no funds")));
        assert!(!is_gateway_fault(&GatewayResponse::succeeded("X")));
    }
}
