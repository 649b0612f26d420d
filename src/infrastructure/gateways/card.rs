use super::http::{ProviderClient, parse_json};
use crate::config::GatewayConfig;
use crate::domain::gateway::{
    ERR_BAD_RESPONSE, GatewayAdapter, GatewayNotification, GatewayRequest, GatewayResponse,
    GatewayStatus, NotificationKind,
};
use crate::error::{PaymentError, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Card acquirer (Visa/Mastercard) authorization API.
pub struct CardAdapter {
    client: ProviderClient,
}

#[derive(Serialize)]
struct AuthorizationRequest<'a> {
    merchant_id: &'a str,
    order_reference: &'a str,
    amount: Decimal,
    currency: &'a str,
    cardholder_name: Option<&'a str>,
    email: Option<&'a str>,
    description: &'a str,
    capture: bool,
}

#[derive(Deserialize)]
struct AuthorizationResponse {
    id: Option<String>,
    order_reference: Option<String>,
    status: String,
    #[serde(default)]
    decline_code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Deserialize)]
struct CardEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: AuthorizationResponse,
}

fn map_status(status: &str) -> Option<GatewayStatus> {
    match status.to_ascii_lowercase().as_str() {
        "approved" | "captured" | "refunded" => Some(GatewayStatus::Succeeded),
        "pending" | "processing" => Some(GatewayStatus::Pending),
        "declined" | "failed" | "voided" => Some(GatewayStatus::Failed),
        _ => None,
    }
}

fn translate(response: AuthorizationResponse) -> GatewayResponse {
    let reference = response.order_reference.clone();
    let translated = match (map_status(&response.status), response.id) {
        (Some(GatewayStatus::Succeeded), Some(id)) => GatewayResponse::succeeded(id),
        (Some(GatewayStatus::Pending), Some(id)) => GatewayResponse::pending(id),
        (Some(GatewayStatus::Failed), id) => GatewayResponse {
            provider_transaction_id: id,
            ..GatewayResponse::failed(
                response
                    .decline_code
                    .unwrap_or_else(|| "CARD_DECLINED".to_string()),
                response
                    .message
                    .unwrap_or_else(|| "Card authorization declined".to_string()),
            )
        },
        (Some(_), None) => GatewayResponse::failed(
            ERR_BAD_RESPONSE,
            "Authorization accepted without an id",
        ),
        (None, _) => GatewayResponse::failed(
            ERR_BAD_RESPONSE,
            format!("Unknown authorization status '{}'", response.status),
        ),
    };
    translated.with_provider_reference(reference)
}

impl CardAdapter {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self {
            client: ProviderClient::new(config)?,
        })
    }
}

#[async_trait]
impl GatewayAdapter for CardAdapter {
    fn config(&self) -> &GatewayConfig {
        self.client.config()
    }

    async fn authorize(&self, request: &GatewayRequest) -> GatewayResponse {
        let body = AuthorizationRequest {
            merchant_id: &self.config().merchant_id,
            order_reference: &request.reference,
            amount: request.amount,
            currency: &request.currency,
            cardholder_name: request.payer_name.as_deref(),
            email: request.payer_email.as_deref(),
            description: &request.description,
            capture: true,
        };
        match self
            .client
            .post::<_, AuthorizationResponse>("/v2/authorizations", &body)
            .await
        {
            Ok(response) => translate(response),
            Err(failure) => failure,
        }
    }

    async fn inquire(&self, provider_transaction_id: &str) -> GatewayResponse {
        let path = format!("/v2/authorizations/{}", provider_transaction_id);
        match self.client.get::<AuthorizationResponse>(&path).await {
            Ok(response) => translate(response),
            Err(failure) => failure,
        }
    }

    async fn refund(&self, provider_transaction_id: &str, amount: Decimal) -> GatewayResponse {
        let path = format!("/v2/authorizations/{}/refunds", provider_transaction_id);
        let body = serde_json::json!({ "amount": amount });
        match self.client.post::<_, AuthorizationResponse>(&path, &body).await {
            Ok(response) => translate(response),
            Err(failure) => failure,
        }
    }

    fn signature_header(&self) -> &'static str {
        "x-card-signature"
    }

    fn parse_notification(&self, body: &[u8]) -> Result<GatewayNotification> {
        let event: CardEvent = parse_json(self.id(), body)?;
        let status = map_status(&event.data.status).ok_or_else(|| {
            PaymentError::ValidationError(format!(
                "Unknown authorization status '{}'",
                event.data.status
            ))
        })?;
        let kind = if event.event_type.starts_with("refund.") {
            NotificationKind::Refund
        } else {
            NotificationKind::Payment
        };
        Ok(GatewayNotification {
            event_type: event.event_type,
            kind,
            provider_transaction_id: event.data.id,
            reference: event.data.order_reference,
            status,
            error_code: event.data.decline_code,
            error_message: event.data.message,
        })
    }
}
