use crate::config::GatewayConfig;
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// The logical payment rail a transaction is collected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    MobileMoney,
    Card,
    BankSwitch,
}

impl GatewayType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayType::MobileMoney => "mobile_money",
            GatewayType::Card => "card",
            GatewayType::BankSwitch => "bank_switch",
        }
    }
}

impl fmt::Display for GatewayType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GatewayType {
    type Err = crate::error::PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mobile_money" | "mobile-money" | "momo" => Ok(GatewayType::MobileMoney),
            "card" => Ok(GatewayType::Card),
            "bank_switch" | "bank-switch" | "bank" => Ok(GatewayType::BankSwitch),
            other => Err(crate::error::PaymentError::ValidationError(format!(
                "Unknown gateway type '{}'",
                other
            ))),
        }
    }
}

/// Normalized request handed to a provider adapter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayRequest {
    pub reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub payer_phone: Option<String>,
    pub payer_name: Option<String>,
    pub payer_email: Option<String>,
    pub description: String,
}

/// Provider outcome, translated into a common vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Succeeded,
    Pending,
    Failed,
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GatewayStatus::Succeeded => "succeeded",
            GatewayStatus::Pending => "pending",
            GatewayStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

pub const ERR_TIMEOUT: &str = "TIMEOUT";
pub const ERR_NETWORK: &str = "NETWORK_ERROR";
pub const ERR_UNSUPPORTED: &str = "UNSUPPORTED";
pub const ERR_BAD_RESPONSE: &str = "BAD_RESPONSE";

/// Result of a single adapter call.
///
/// Adapters never return `Err` for provider or transport failures; those are
/// reported here with `is_success == false` so callers can feed them to the
/// retry scheduler and circuit breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub is_success: bool,
    pub status: GatewayStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub provider_transaction_id: Option<String>,
    pub provider_reference: Option<String>,
    pub timed_out: bool,
}

impl GatewayResponse {
    pub fn succeeded(provider_transaction_id: impl Into<String>) -> Self {
        Self {
            is_success: true,
            status: GatewayStatus::Succeeded,
            error_code: None,
            error_message: None,
            provider_transaction_id: Some(provider_transaction_id.into()),
            provider_reference: None,
            timed_out: false,
        }
    }

    pub fn pending(provider_transaction_id: impl Into<String>) -> Self {
        Self {
            status: GatewayStatus::Pending,
            ..Self::succeeded(provider_transaction_id)
        }
    }

    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            is_success: false,
            status: GatewayStatus::Failed,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            provider_transaction_id: None,
            provider_reference: None,
            timed_out: false,
        }
    }

    pub fn timeout(seconds: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(
                ERR_TIMEOUT,
                format!("Gateway did not respond within {}s", seconds),
            )
        }
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::failed(
            ERR_UNSUPPORTED,
            format!("Operation '{}' is not supported by this gateway", operation),
        )
    }

    pub fn with_provider_reference(mut self, reference: Option<String>) -> Self {
        self.provider_reference = reference;
        self
    }

    pub fn error_code_or_default(&self) -> String {
        self.error_code
            .clone()
            .unwrap_or_else(|| "GATEWAY_ERROR".to_string())
    }

    pub fn error_message_or_default(&self) -> String {
        self.error_message
            .clone()
            .unwrap_or_else(|| "Gateway reported a failure".to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Payment,
    Refund,
}

/// An inbound provider callback after the adapter translated it.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayNotification {
    pub event_type: String,
    pub kind: NotificationKind,
    pub provider_transaction_id: Option<String>,
    pub reference: Option<String>,
    pub status: GatewayStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl GatewayNotification {
    /// Key used to recognize a redelivery of the same event.
    pub fn dedup_key(&self) -> Option<String> {
        self.provider_transaction_id
            .clone()
            .or_else(|| self.reference.clone())
            .map(|id| format!("{}:{:?}:{}", id, self.kind, self.status))
    }
}

/// Per-provider translator between normalized requests and provider HTTP calls.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    fn config(&self) -> &GatewayConfig;

    async fn authorize(&self, request: &GatewayRequest) -> GatewayResponse;

    async fn inquire(&self, provider_transaction_id: &str) -> GatewayResponse;

    async fn refund(&self, _provider_transaction_id: &str, _amount: Decimal) -> GatewayResponse {
        GatewayResponse::unsupported("refund")
    }

    async fn cancel(&self, _provider_transaction_id: &str) -> GatewayResponse {
        GatewayResponse::unsupported("cancel")
    }

    fn supports_cancellation(&self) -> bool {
        false
    }

    /// Header carrying the HMAC signature of webhook bodies.
    fn signature_header(&self) -> &'static str {
        "x-signature"
    }

    fn parse_notification(&self, body: &[u8]) -> Result<GatewayNotification>;

    fn id(&self) -> &str {
        &self.config().id
    }

    fn gateway_type(&self) -> GatewayType {
        self.config().gateway_type
    }
}

pub type GatewayAdapterRef = Arc<dyn GatewayAdapter>;
