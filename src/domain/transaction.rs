use crate::domain::gateway::{GatewayRequest, GatewayType};
use crate::domain::money::{Currency, FeeBreakdown};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Error code stamped on transactions whose approval chain was rejected.
pub const APPROVAL_REJECTED: &str = "APPROVAL_REJECTED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Initiated,
    PendingApproval,
    Approved,
    Processing,
    Completed,
    Failed,
    Expired,
    Cancelled,
    RefundRequested,
    Refunded,
    DeadLettered,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Initiated => "initiated",
            TransactionStatus::PendingApproval => "pending_approval",
            TransactionStatus::Approved => "approved",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Expired => "expired",
            TransactionStatus::Cancelled => "cancelled",
            TransactionStatus::RefundRequested => "refund_requested",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::DeadLettered => "dead_lettered",
        }
    }

    /// No transition leaves these states.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Refunded | TransactionStatus::Cancelled | TransactionStatus::Expired
        )
    }

    /// States in which money has not been collected yet and a user may cancel.
    pub fn is_pre_completion(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Initiated
                | TransactionStatus::PendingApproval
                | TransactionStatus::Approved
                | TransactionStatus::Processing
                | TransactionStatus::Failed
        )
    }

    /// The transition table. Anything not listed here is rejected.
    pub fn can_transition_to(&self, to: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match self {
            Initiated => matches!(to, PendingApproval | Processing | Cancelled | Expired),
            PendingApproval => matches!(to, Approved | Failed | Cancelled | Expired),
            Approved => matches!(to, Processing | Cancelled | Expired),
            Processing => matches!(to, Completed | Failed | Expired | Cancelled),
            Failed => matches!(
                to,
                Processing | DeadLettered | Completed | Cancelled | Expired
            ),
            DeadLettered => matches!(to, Processing | Completed | Cancelled),
            Completed => matches!(to, RefundRequested),
            RefundRequested => matches!(to, Refunded | Completed),
            Refunded | Cancelled | Expired => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// A single tax payment collected through a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub reference: String,
    pub provider_transaction_id: Option<String>,
    pub gateway_type: GatewayType,
    pub gateway_id: Option<String>,

    pub amount: Decimal,
    pub fee: Decimal,
    pub net_amount: Decimal,
    pub currency: Currency,

    pub client_id: String,
    pub payer_phone: Option<String>,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    pub description: String,

    pub status: TransactionStatus,
    pub initiated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub is_reconciled: bool,
    pub cancel_requested: bool,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,

    pub risk_level: RiskLevel,
    pub risk_factors: Vec<String>,
    pub requires_manual_review: bool,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,

    /// Bumped on every persisted write; used for optimistic concurrency.
    pub version: u64,
}

impl PaymentTransaction {
    pub fn new(
        client_id: impl Into<String>,
        gateway_type: GatewayType,
        breakdown: FeeBreakdown,
        currency: Currency,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            reference: generate_reference(now),
            provider_transaction_id: None,
            gateway_type,
            gateway_id: None,
            amount: breakdown.amount(),
            fee: breakdown.fee(),
            net_amount: breakdown.net_amount(),
            currency,
            client_id: client_id.into(),
            payer_phone: None,
            payer_name: None,
            payer_email: None,
            description: String::new(),
            status: TransactionStatus::Initiated,
            initiated_at: now,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            expires_at,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
            is_reconciled: false,
            cancel_requested: false,
            last_error_code: None,
            last_error_message: None,
            risk_level: RiskLevel::Low,
            risk_factors: Vec::new(),
            requires_manual_review: false,
            reviewed_by: None,
            reviewed_at: None,
            version: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Waiting in `Failed` for the retry driver and the wait is over.
    pub fn is_retry_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TransactionStatus::Failed && self.next_retry_at.is_some_and(|at| at <= now)
    }

    pub fn is_approval_rejected(&self) -> bool {
        self.last_error_code.as_deref() == Some(APPROVAL_REJECTED)
    }

    /// Counts towards a client's daily/monthly gateway volume.
    pub fn counts_towards_limits(&self) -> bool {
        !matches!(
            self.status,
            TransactionStatus::Cancelled
                | TransactionStatus::Expired
                | TransactionStatus::Refunded
                | TransactionStatus::DeadLettered
        ) && !self.is_approval_rejected()
    }

    pub fn gateway_request(&self) -> GatewayRequest {
        GatewayRequest {
            reference: self.reference.clone(),
            amount: self.amount,
            currency: self.currency.to_string(),
            payer_phone: self.payer_phone.clone(),
            payer_name: self.payer_name.clone(),
            payer_email: self.payer_email.clone(),
            description: if self.description.is_empty() {
                format!("Tax payment {}", self.reference)
            } else {
                self.description.clone()
            },
        }
    }
}

/// `PAY-YYYYMMDD-XXXXXXXX`, unique per transaction.
pub fn generate_reference(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string()[..8].to_ascii_uppercase();
    format!("PAY-{}-{}", now.format("%Y%m%d"), suffix)
}

/// Append-only audit row written with every status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransactionLog {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub previous_status: Option<TransactionStatus>,
    pub new_status: TransactionStatus,
    pub action: String,
    pub details: Option<String>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub actor: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryAttemptStatus {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub attempt_number: u32,
    pub attempted_at: DateTime<Utc>,
    pub status: RetryAttemptStatus,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub next_retry_at: Option<DateTime<Utc>>,
}
