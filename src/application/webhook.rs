//! Inbound provider callbacks.

use super::registry::GatewayRegistry;
use super::retry::{Failure, RetryDecision, RetryScheduler};
use super::state_machine::{TransactionStateMachine, Transition, TransitionOutcome};
use crate::domain::gateway::{GatewayAdapterRef, GatewayNotification, GatewayStatus, NotificationKind};
use crate::domain::ports::WebhookLogStoreRef;
use crate::domain::transaction::{PaymentTransaction, TransactionStatus};
use crate::domain::webhook::{WebhookAck, WebhookLogEntry, WebhookOutcome};
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Hex HMAC-SHA256 of `body`, as providers put it in the signature header.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| PaymentError::InternalError("HMAC key rejected".into()))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time check of a provided signature; a `sha256=` prefix is allowed.
pub fn verify_signature(secret: &str, body: &[u8], provided: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Ok(expected) = sign(secret, body) else {
        return false;
    };
    let provided = provided.trim();
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    expected
        .as_bytes()
        .ct_eq(provided.to_ascii_lowercase().as_bytes())
        .into()
}

/// What was learned about a callback while handling it.
#[derive(Default)]
struct Trace {
    event_type: Option<String>,
    transaction_reference: Option<String>,
    provider_transaction_id: Option<String>,
    reported_status: Option<GatewayStatus>,
    dedup_key: Option<String>,
    signature_valid: bool,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    gateways: Arc<GatewayRegistry>,
    machine: TransactionStateMachine,
    retries: RetryScheduler,
    log: WebhookLogStoreRef,
}

impl WebhookProcessor {
    pub fn new(
        gateways: Arc<GatewayRegistry>,
        machine: TransactionStateMachine,
        retries: RetryScheduler,
        log: WebhookLogStoreRef,
    ) -> Self {
        Self {
            gateways,
            machine,
            retries,
            log,
        }
    }

    /// Verifies, deduplicates and applies one provider callback.
    ///
    /// Exactly one `WebhookLogEntry` is written per call. Storage failures
    /// are returned as errors so the provider redelivers.
    pub async fn handle(
        &self,
        gateway_id: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<WebhookAck> {
        let mut trace = Trace::default();
        let result = self.process(gateway_id, headers, body, now, &mut trace).await;
        let (outcome, detail) = match &result {
            Ok((outcome, detail)) => (*outcome, detail.clone()),
            Err(e) => (WebhookOutcome::Rejected, Some(e.to_string())),
        };

        let entry = WebhookLogEntry {
            id: Uuid::new_v4(),
            gateway_id: gateway_id.to_string(),
            event_type: trace.event_type,
            body: String::from_utf8_lossy(body).into_owned(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect(),
            signature_valid: trace.signature_valid,
            outcome,
            transaction_reference: trace.transaction_reference,
            provider_transaction_id: trace.provider_transaction_id,
            reported_status: trace.reported_status,
            dedup_key: trace.dedup_key,
            detail,
            received_at: now,
        };
        let log_id = entry.id;
        self.log.append(entry).await?;
        info!(gateway = gateway_id, ?outcome, "Webhook handled");

        result.map(|_| WebhookAck {
            status_code: outcome.status_code(),
            outcome,
            log_id,
        })
    }

    async fn process(
        &self,
        gateway_id: &str,
        headers: &BTreeMap<String, String>,
        body: &[u8],
        now: DateTime<Utc>,
        trace: &mut Trace,
    ) -> Result<(WebhookOutcome, Option<String>)> {
        let Some(adapter) = self.gateways.lookup(gateway_id) else {
            warn!(gateway = gateway_id, "Webhook for unknown gateway");
            return Ok((WebhookOutcome::UnknownGateway, None));
        };

        let signature = headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(adapter.signature_header()))
            .map(|(_, value)| value.as_str());
        trace.signature_valid = signature
            .is_some_and(|sig| verify_signature(&adapter.config().webhook_secret, body, sig));
        if !trace.signature_valid {
            warn!(gateway = gateway_id, "Webhook signature rejected");
            return Ok((
                WebhookOutcome::SignatureInvalid,
                Some(PaymentError::SignatureInvalid(gateway_id.to_string()).to_string()),
            ));
        }

        let notification = match adapter.parse_notification(body) {
            Ok(notification) => notification,
            Err(e) => return Ok((WebhookOutcome::Malformed, Some(e.to_string()))),
        };
        trace.event_type = Some(notification.event_type.clone());
        trace.provider_transaction_id = notification.provider_transaction_id.clone();
        trace.transaction_reference = notification.reference.clone();
        trace.reported_status = Some(notification.status);
        trace.dedup_key = notification.dedup_key();

        let Some(tx) = self.locate(&notification).await? else {
            return Ok((WebhookOutcome::Orphaned, None));
        };
        trace.transaction_reference = Some(tx.reference.clone());

        if let Some(key) = &trace.dedup_key
            && self.log.has_applied(gateway_id, key).await?
        {
            debug!(reference = %tx.reference, key, "Duplicate webhook");
            return Ok((WebhookOutcome::Duplicate, None));
        }

        self.apply(&adapter, &tx, &notification, now).await
    }

    async fn locate(&self, notification: &GatewayNotification) -> Result<Option<PaymentTransaction>> {
        let store = self.machine.store();
        if let Some(id) = &notification.provider_transaction_id
            && let Some(tx) = store.find_by_provider_id(id).await?
        {
            return Ok(Some(tx));
        }
        match &notification.reference {
            Some(reference) => store.find_by_reference(reference).await,
            None => Ok(None),
        }
    }

    async fn apply(
        &self,
        adapter: &GatewayAdapterRef,
        tx: &PaymentTransaction,
        notification: &GatewayNotification,
        now: DateTime<Utc>,
    ) -> Result<(WebhookOutcome, Option<String>)> {
        let actor = format!("webhook:{}", adapter.id());
        let transition = match (notification.kind, notification.status) {
            (_, GatewayStatus::Pending) => return Ok((WebhookOutcome::Ignored, None)),
            (NotificationKind::Payment, GatewayStatus::Succeeded)
                if tx.status == TransactionStatus::DeadLettered =>
            {
                return self.hold_for_operator(adapter, tx, notification).await;
            }
            (NotificationKind::Payment, GatewayStatus::Failed) => {
                let failure = Failure::Gateway {
                    gateway_id: Some(adapter.id().to_string()),
                    code: notification
                        .error_code
                        .clone()
                        .unwrap_or_else(|| "PROVIDER_FAILED".to_string()),
                    message: notification
                        .error_message
                        .clone()
                        .unwrap_or_else(|| notification.event_type.clone()),
                };
                let decision = self.retries.handle_failure(tx.id, failure, now).await?;
                return Ok(match decision {
                    RetryDecision::Skipped => (
                        WebhookOutcome::Rejected,
                        Some(format!("Transaction {} is not processing", tx.reference)),
                    ),
                    other => (WebhookOutcome::Applied, Some(format!("{:?}", other))),
                });
            }
            (NotificationKind::Payment, GatewayStatus::Succeeded) => {
                Transition::to(TransactionStatus::Completed, "webhook_confirmed", now)
                    .provider_transaction_id(notification.provider_transaction_id.clone())
            }
            (NotificationKind::Refund, GatewayStatus::Succeeded) => {
                Transition::to(TransactionStatus::Refunded, "webhook_refunded", now)
            }
            (NotificationKind::Refund, GatewayStatus::Failed) => {
                Transition::to(TransactionStatus::Completed, "refund_declined", now).error(
                    notification
                        .error_code
                        .clone()
                        .unwrap_or_else(|| "REFUND_DECLINED".to_string()),
                    notification
                        .error_message
                        .clone()
                        .unwrap_or_else(|| "Refund declined".to_string()),
                )
            }
        };

        let target = transition.target();
        match self
            .machine
            .apply_with_reload(tx.id, transition.by(actor).gateway(adapter.id()))
            .await
        {
            Ok(TransitionOutcome::Applied(updated)) => {
                if updated.status == TransactionStatus::Completed {
                    self.retries
                        .settle_dead_letters(updated.id, &format!("webhook:{}", adapter.id()), now)
                        .await?;
                }
                Ok((WebhookOutcome::Applied, None))
            }
            Ok(TransitionOutcome::Unchanged(_)) => Ok((
                WebhookOutcome::Duplicate,
                Some(format!("Transaction {} is already {}", tx.reference, target)),
            )),
            Err(PaymentError::InvalidTransition {
                from: TransactionStatus::DeadLettered,
                to: TransactionStatus::Completed,
            }) => self.hold_for_operator(adapter, tx, notification).await,
            Err(e @ PaymentError::InvalidTransition { .. }) => {
                Ok((WebhookOutcome::Rejected, Some(e.to_string())))
            }
            Err(e) => Err(e),
        }
    }

    /// A dead-lettered payment waits for an operator even when the provider
    /// confirms it; the confirmation is attached to its pending entry.
    async fn hold_for_operator(
        &self,
        adapter: &GatewayAdapterRef,
        tx: &PaymentTransaction,
        notification: &GatewayNotification,
    ) -> Result<(WebhookOutcome, Option<String>)> {
        let report = format!(
            "{} reported {} ({}) for provider transaction {}",
            adapter.id(),
            notification.status,
            notification.event_type,
            notification.provider_transaction_id.as_deref().unwrap_or("-")
        );
        let recorded = self.retries.record_provider_report(tx.id, report).await?;
        warn!(reference = %tx.reference, gateway = adapter.id(), recorded, "Confirmation for a dead-lettered payment held for review");
        Ok((
            WebhookOutcome::Rejected,
            Some(format!(
                "Transaction {} is dead-lettered; confirmation recorded for operator review",
                tx.reference
            )),
        ))
    }
}
