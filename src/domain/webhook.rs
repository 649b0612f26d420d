use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::gateway::GatewayStatus;

/// How an inbound callback was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebhookOutcome {
    /// A state transition was applied.
    Applied,
    /// Same event was already applied earlier.
    Duplicate,
    /// Valid but nothing to do (e.g. a pending notification).
    Ignored,
    /// No transaction matches the identifiers in the body.
    Orphaned,
    SignatureInvalid,
    Malformed,
    /// The transaction is in a state the event cannot move it from.
    Rejected,
    UnknownGateway,
}

impl WebhookOutcome {
    /// HTTP status the host server should answer the provider with.
    ///
    /// Internal outcomes are always acknowledged so providers stop
    /// redelivering; only authentication problems are refused.
    pub fn status_code(&self) -> u16 {
        match self {
            WebhookOutcome::SignatureInvalid => 401,
            WebhookOutcome::UnknownGateway => 404,
            _ => 200,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookLogEntry {
    pub id: Uuid,
    pub gateway_id: String,
    pub event_type: Option<String>,
    pub body: String,
    pub headers: BTreeMap<String, String>,
    pub signature_valid: bool,
    pub outcome: WebhookOutcome,
    pub transaction_reference: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub reported_status: Option<GatewayStatus>,
    /// Identifies redeliveries of the same event (see `GatewayNotification::dedup_key`).
    pub dedup_key: Option<String>,
    pub detail: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Acknowledgement returned to the host webhook endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookAck {
    pub status_code: u16,
    pub outcome: WebhookOutcome,
    pub log_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_auth_failures_are_refused() {
        assert_eq!(WebhookOutcome::SignatureInvalid.status_code(), 401);
        assert_eq!(WebhookOutcome::UnknownGateway.status_code(), 404);
        for outcome in [
            WebhookOutcome::Applied,
            WebhookOutcome::Duplicate,
            WebhookOutcome::Ignored,
            WebhookOutcome::Orphaned,
            WebhookOutcome::Malformed,
            WebhookOutcome::Rejected,
        ] {
            assert_eq!(outcome.status_code(), 200);
        }
    }
}
