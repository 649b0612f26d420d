use super::http::{ProviderClient, parse_json};
use crate::config::GatewayConfig;
use crate::domain::gateway::{
    GatewayAdapter, GatewayNotification, GatewayRequest, GatewayResponse, GatewayStatus,
    NotificationKind,
};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// National bank switch transfer API. Responses carry two-digit ISO 8583
/// style codes.
pub struct BankSwitchAdapter {
    client: ProviderClient,
}

const APPROVED: &str = "00";
const IN_PROGRESS: &str = "09";

#[derive(Serialize)]
struct TransferRequest<'a> {
    terminal_id: &'a str,
    rrn: &'a str,
    amount: Decimal,
    currency: &'a str,
    debtor_phone: Option<&'a str>,
    debtor_name: Option<&'a str>,
    narration: &'a str,
}

#[derive(Deserialize)]
struct TransferResponse {
    transfer_id: Option<String>,
    rrn: Option<String>,
    response_code: String,
    #[serde(default)]
    response_message: Option<String>,
}

#[derive(Deserialize)]
struct TransferAdvice {
    message_type: String,
    #[serde(flatten)]
    transfer: TransferResponse,
}

fn status_for(code: &str) -> GatewayStatus {
    match code {
        APPROVED => GatewayStatus::Succeeded,
        IN_PROGRESS => GatewayStatus::Pending,
        _ => GatewayStatus::Failed,
    }
}

fn translate(response: TransferResponse) -> GatewayResponse {
    let translated = match (status_for(&response.response_code), response.transfer_id) {
        (GatewayStatus::Succeeded, Some(id)) => GatewayResponse::succeeded(id),
        (GatewayStatus::Pending, Some(id)) => GatewayResponse::pending(id),
        (_, id) => GatewayResponse {
            provider_transaction_id: id,
            ..GatewayResponse::failed(
                format!("BANK_{}", response.response_code),
                response
                    .response_message
                    .unwrap_or_else(|| format!("Switch declined with {}", response.response_code)),
            )
        },
    };
    translated.with_provider_reference(response.rrn)
}

impl BankSwitchAdapter {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self {
            client: ProviderClient::new(config)?,
        })
    }
}

#[async_trait]
impl GatewayAdapter for BankSwitchAdapter {
    fn config(&self) -> &GatewayConfig {
        self.client.config()
    }

    async fn authorize(&self, request: &GatewayRequest) -> GatewayResponse {
        let body = TransferRequest {
            terminal_id: &self.config().merchant_id,
            rrn: &request.reference,
            amount: request.amount,
            currency: &request.currency,
            debtor_phone: request.payer_phone.as_deref(),
            debtor_name: request.payer_name.as_deref(),
            narration: &request.description,
        };
        match self.client.post::<_, TransferResponse>("/api/transfers", &body).await {
            Ok(response) => translate(response),
            Err(failure) => failure,
        }
    }

    async fn inquire(&self, provider_transaction_id: &str) -> GatewayResponse {
        let path = format!("/api/transfers/{}", provider_transaction_id);
        match self.client.get::<TransferResponse>(&path).await {
            Ok(response) => translate(response),
            Err(failure) => failure,
        }
    }

    /// Full reversal of a settled transfer.
    async fn refund(&self, provider_transaction_id: &str, amount: Decimal) -> GatewayResponse {
        let path = format!("/api/transfers/{}/reversal", provider_transaction_id);
        let body = serde_json::json!({ "amount": amount });
        match self.client.post::<_, TransferResponse>(&path, &body).await {
            Ok(response) => translate(response),
            Err(failure) => failure,
        }
    }

    fn signature_header(&self) -> &'static str {
        "x-switch-signature"
    }

    fn parse_notification(&self, body: &[u8]) -> Result<GatewayNotification> {
        let advice: TransferAdvice = parse_json(self.id(), body)?;
        let status = status_for(&advice.transfer.response_code);
        let kind = if advice.message_type.starts_with("reversal") {
            NotificationKind::Refund
        } else {
            NotificationKind::Payment
        };
        let error_code = (status == GatewayStatus::Failed)
            .then(|| format!("BANK_{}", advice.transfer.response_code));
        Ok(GatewayNotification {
            event_type: advice.message_type,
            kind,
            provider_transaction_id: advice.transfer.transfer_id,
            reference: advice.transfer.rrn,
            status,
            error_code,
            error_message: advice.transfer.response_message,
        })
    }
}
