//! Shared HTTP plumbing for provider adapters.

use crate::config::GatewayConfig;
use crate::domain::gateway::{ERR_BAD_RESPONSE, ERR_NETWORK, GatewayResponse};
use crate::error::{PaymentError, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Either the decoded provider body or a ready-made failure response.
pub type CallResult<T> = std::result::Result<T, GatewayResponse>;

/// A `reqwest` client bound to one gateway's endpoint, credentials and timeout.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl ProviderClient {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(config.timeout()))
            .timeout(config.timeout())
            .pool_max_idle_per_host(16)
            .build()
            .map_err(|e| {
                PaymentError::ConfigError(format!(
                    "Cannot build HTTP client for gateway {}: {}",
                    config.id, e
                ))
            })?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("X-Merchant-Id", &self.config.merchant_id);
        if self.config.api_key.is_empty() {
            builder
        } else {
            builder.bearer_auth(&self.config.api_key)
        }
    }

    pub async fn post<B, R>(&self, path: &str, body: &B) -> CallResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = self.authorized(self.client.post(self.url(path))).json(body);
        self.send(path, request).await
    }

    pub async fn get<R>(&self, path: &str) -> CallResult<R>
    where
        R: DeserializeOwned,
    {
        let request = self.authorized(self.client.get(self.url(path)));
        self.send(path, request).await
    }

    async fn send<R>(&self, path: &str, request: reqwest::RequestBuilder) -> CallResult<R>
    where
        R: DeserializeOwned,
    {
        debug!(gateway = %self.config.id, path, "Calling provider");
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(gateway = %self.config.id, path, status = status.as_u16(), "Provider returned an error status");
            return Err(GatewayResponse::failed(
                format!("HTTP_{}", status.as_u16()),
                if body.is_empty() {
                    status.to_string()
                } else {
                    body
                },
            ));
        }

        response.json::<R>().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                GatewayResponse::failed(
                    ERR_BAD_RESPONSE,
                    format!("Unreadable response from {}: {}", self.config.id, e),
                )
            }
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> GatewayResponse {
        if error.is_timeout() {
            warn!(gateway = %self.config.id, "Provider call timed out");
            GatewayResponse::timeout(self.config.timeout_seconds)
        } else {
            warn!(gateway = %self.config.id, %error, "Provider call failed");
            GatewayResponse::failed(ERR_NETWORK, error.to_string())
        }
    }
}

/// Parses a provider callback body, mapping JSON errors to `ValidationError`.
pub fn parse_json<T: DeserializeOwned>(gateway_id: &str, body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        PaymentError::ValidationError(format!(
            "Malformed notification for gateway {}: {}",
            gateway_id, e
        ))
    })
}
