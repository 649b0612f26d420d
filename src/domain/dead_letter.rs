use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterStatus {
    Pending,
    Resolved,
    Discarded,
}

/// What an operator decided to do with a dead-lettered payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadLetterAction {
    /// Dispatch again with a fresh retry budget.
    Retry,
    /// Settled out of band; mark the payment completed.
    Resolve,
    /// Abandon the payment.
    Discard,
}

impl FromStr for DeadLetterAction {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(DeadLetterAction::Retry),
            "resolve" => Ok(DeadLetterAction::Resolve),
            "discard" => Ok(DeadLetterAction::Discard),
            other => Err(PaymentError::ValidationError(format!(
                "Unknown dead-letter action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub reference: String,
    pub reason: String,
    pub retry_attempts: u32,
    pub status: DeadLetterStatus,
    pub reviewed_by: Option<String>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub resolution_notes: Option<String>,
    /// Provider callbacks that arrived while the entry waited for an operator.
    #[serde(default)]
    pub provider_reports: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(
        transaction_id: Uuid,
        reference: impl Into<String>,
        reason: impl Into<String>,
        retry_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transaction_id,
            reference: reference.into(),
            reason: reason.into(),
            retry_attempts,
            status: DeadLetterStatus::Pending,
            reviewed_by: None,
            reviewed_at: None,
            resolution_notes: None,
            provider_reports: Vec::new(),
            created_at: now,
        }
    }

    /// Records what a provider reported for the payment. Returns false if
    /// the entry is closed or already holds the same report.
    pub fn add_provider_report(&mut self, report: String) -> bool {
        if self.status != DeadLetterStatus::Pending || self.provider_reports.contains(&report) {
            return false;
        }
        self.provider_reports.push(report);
        true
    }

    /// Closes the entry. Only pending entries can be processed, once.
    pub fn close(
        &mut self,
        action: DeadLetterAction,
        reviewer: &str,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != DeadLetterStatus::Pending {
            return Err(PaymentError::ValidationError(format!(
                "Dead-letter entry {} is already {:?}",
                self.id, self.status
            )));
        }
        self.status = match action {
            DeadLetterAction::Retry | DeadLetterAction::Resolve => DeadLetterStatus::Resolved,
            DeadLetterAction::Discard => DeadLetterStatus::Discarded,
        };
        self.reviewed_by = Some(reviewer.to_string());
        self.reviewed_at = Some(now);
        self.resolution_notes = notes;
        Ok(())
    }
}
