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

/// Mobile money collection API (Orange Money, Afrimoney).
///
/// Collections are pushed to the payer's handset and usually come back
/// `PENDING`; the final outcome arrives by callback.
pub struct MobileMoneyAdapter {
    client: ProviderClient,
}

#[derive(Serialize)]
struct CollectionRequest<'a> {
    merchant_id: &'a str,
    external_reference: &'a str,
    msisdn: &'a str,
    amount: Decimal,
    currency: &'a str,
    payer_name: Option<&'a str>,
    description: &'a str,
}

#[derive(Deserialize)]
struct CollectionResponse {
    transaction_id: Option<String>,
    external_reference: Option<String>,
    status: String,
    #[serde(default)]
    reason_code: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct CollectionCallback {
    event: String,
    transaction_id: Option<String>,
    external_reference: Option<String>,
    status: String,
    #[serde(default)]
    reason_code: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

fn map_status(status: &str) -> Option<GatewayStatus> {
    match status.to_ascii_uppercase().as_str() {
        "SUCCESSFUL" | "SUCCESS" => Some(GatewayStatus::Succeeded),
        "PENDING" | "CREATED" => Some(GatewayStatus::Pending),
        "FAILED" | "REJECTED" | "EXPIRED" | "CANCELLED" => Some(GatewayStatus::Failed),
        _ => None,
    }
}

impl MobileMoneyAdapter {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self {
            client: ProviderClient::new(config)?,
        })
    }

    fn translate(&self, response: CollectionResponse) -> GatewayResponse {
        let provider_id = response.transaction_id.unwrap_or_default();
        let translated = match map_status(&response.status) {
            Some(GatewayStatus::Succeeded) => GatewayResponse::succeeded(provider_id),
            Some(GatewayStatus::Pending) => GatewayResponse::pending(provider_id),
            Some(GatewayStatus::Failed) => GatewayResponse {
                provider_transaction_id: Some(provider_id).filter(|id| !id.is_empty()),
                ..GatewayResponse::failed(
                    response.reason_code.unwrap_or_else(|| "MOMO_FAILED".to_string()),
                    response
                        .reason
                        .unwrap_or_else(|| "Collection failed".to_string()),
                )
            },
            None => GatewayResponse::failed(
                crate::domain::gateway::ERR_BAD_RESPONSE,
                format!("Unknown collection status '{}'", response.status),
            ),
        };
        translated.with_provider_reference(response.external_reference)
    }
}

#[async_trait]
impl GatewayAdapter for MobileMoneyAdapter {
    fn config(&self) -> &GatewayConfig {
        self.client.config()
    }

    async fn authorize(&self, request: &GatewayRequest) -> GatewayResponse {
        let Some(msisdn) = request.payer_phone.as_deref() else {
            return GatewayResponse::failed("INVALID_PAYER", "A payer phone number is required");
        };
        let body = CollectionRequest {
            merchant_id: &self.config().merchant_id,
            external_reference: &request.reference,
            msisdn,
            amount: request.amount,
            currency: &request.currency,
            payer_name: request.payer_name.as_deref(),
            description: &request.description,
        };
        match self.client.post::<_, CollectionResponse>("/v1/collections", &body).await {
            Ok(response) => self.translate(response),
            Err(failure) => failure,
        }
    }

    async fn inquire(&self, provider_transaction_id: &str) -> GatewayResponse {
        let path = format!("/v1/collections/{}", provider_transaction_id);
        match self.client.get::<CollectionResponse>(&path).await {
            Ok(response) => self.translate(response),
            Err(failure) => failure,
        }
    }

    async fn cancel(&self, provider_transaction_id: &str) -> GatewayResponse {
        let path = format!("/v1/collections/{}/cancel", provider_transaction_id);
        let body = serde_json::json!({ "merchant_id": self.config().merchant_id });
        match self.client.post::<_, CollectionResponse>(&path, &body).await {
            Ok(response) if response.status.eq_ignore_ascii_case("CANCELLED") => {
                GatewayResponse::succeeded(provider_transaction_id)
            }
            Ok(response) => GatewayResponse::failed(
                "CANCEL_REFUSED",
                format!("Collection is {}", response.status),
            ),
            Err(failure) => failure,
        }
    }

    fn supports_cancellation(&self) -> bool {
        true
    }

    fn signature_header(&self) -> &'static str {
        "x-momo-signature"
    }

    fn parse_notification(&self, body: &[u8]) -> Result<GatewayNotification> {
        let callback: CollectionCallback = parse_json(self.id(), body)?;
        let status = map_status(&callback.status).ok_or_else(|| {
            crate::error::PaymentError::ValidationError(format!(
                "Unknown collection status '{}'",
                callback.status
            ))
        })?;
        Ok(GatewayNotification {
            event_type: callback.event,
            kind: NotificationKind::Payment,
            provider_transaction_id: callback.transaction_id,
            reference: callback.external_reference,
            status,
            error_code: callback.reason_code,
            error_message: callback.reason,
        })
    }
}
