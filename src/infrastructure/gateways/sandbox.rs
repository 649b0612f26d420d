use super::http::parse_json;
use crate::config::GatewayConfig;
use crate::domain::gateway::{
    GatewayAdapter, GatewayNotification, GatewayRequest, GatewayResponse, GatewayStatus,
    NotificationKind,
};
use crate::error::Result;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Payer phone suffix the sandbox always declines.
pub const DECLINED_PHONE_SUFFIX: &str = "0000";

struct Scripted {
    response: GatewayResponse,
    delay: Option<Duration>,
}

/// In-process gateway used for test-mode configurations.
///
/// Without a script it approves everything except payers whose phone ends in
/// `0000`. Queued responses (optionally delayed) take precedence, one per
/// `authorize` call.
pub struct SandboxAdapter {
    config: GatewayConfig,
    script: Mutex<VecDeque<Scripted>>,
    inquiries: Mutex<VecDeque<GatewayResponse>>,
    cancellable: bool,
    authorize_calls: AtomicUsize,
    inquiry_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

#[derive(Deserialize)]
struct SandboxCallback {
    event_type: String,
    #[serde(default = "default_kind")]
    kind: NotificationKind,
    provider_transaction_id: Option<String>,
    reference: Option<String>,
    status: GatewayStatus,
    #[serde(default)]
    error_code: Option<String>,
    #[serde(default)]
    error_message: Option<String>,
}

fn default_kind() -> NotificationKind {
    NotificationKind::Payment
}

impl SandboxAdapter {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            script: Mutex::new(VecDeque::new()),
            inquiries: Mutex::new(VecDeque::new()),
            cancellable: false,
            authorize_calls: AtomicUsize::new(0),
            inquiry_calls: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
        }
    }

    /// Lets `cancel` succeed, like a provider with a void endpoint.
    pub fn with_cancellation(mut self) -> Self {
        self.cancellable = true;
        self
    }

    pub fn push_response(&self, response: GatewayResponse) {
        self.push_delayed(response, None);
    }

    pub fn push_delayed(&self, response: GatewayResponse, delay: Option<Duration>) {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.push_back(Scripted { response, delay });
    }

    pub fn push_inquiry(&self, response: GatewayResponse) {
        let mut inquiries = self.inquiries.lock().unwrap_or_else(|e| e.into_inner());
        inquiries.push_back(response);
    }

    /// Number of `authorize` calls that reached this adapter.
    pub fn authorize_calls(&self) -> usize {
        self.authorize_calls.load(Ordering::SeqCst)
    }

    pub fn inquiry_calls(&self) -> usize {
        self.inquiry_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    fn next_scripted(&self) -> Option<Scripted> {
        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        script.pop_front()
    }
}

#[async_trait]
impl GatewayAdapter for SandboxAdapter {
    fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn authorize(&self, request: &GatewayRequest) -> GatewayResponse {
        self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(scripted) = self.next_scripted() {
            if let Some(delay) = scripted.delay {
                tokio::time::sleep(delay).await;
            }
            return scripted.response;
        }

        if request
            .payer_phone
            .as_deref()
            .is_some_and(|phone| phone.ends_with(DECLINED_PHONE_SUFFIX))
        {
            return GatewayResponse::failed("DECLINED", "Sandbox payer declined the payment");
        }
        GatewayResponse::succeeded(format!("SBX-{}", request.reference))
            .with_provider_reference(Some(request.reference.clone()))
    }

    async fn inquire(&self, provider_transaction_id: &str) -> GatewayResponse {
        self.inquiry_calls.fetch_add(1, Ordering::SeqCst);
        let scripted = {
            let mut inquiries = self.inquiries.lock().unwrap_or_else(|e| e.into_inner());
            inquiries.pop_front()
        };
        scripted.unwrap_or_else(|| GatewayResponse::succeeded(provider_transaction_id))
    }

    async fn refund(&self, provider_transaction_id: &str, _amount: Decimal) -> GatewayResponse {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        GatewayResponse::succeeded(format!("SBXR-{}", provider_transaction_id))
    }

    async fn cancel(&self, provider_transaction_id: &str) -> GatewayResponse {
        if self.cancellable {
            GatewayResponse::succeeded(provider_transaction_id)
        } else {
            GatewayResponse::unsupported("cancel")
        }
    }

    fn supports_cancellation(&self) -> bool {
        self.cancellable
    }

    fn parse_notification(&self, body: &[u8]) -> Result<GatewayNotification> {
        let callback: SandboxCallback = parse_json(self.id(), body)?;
        Ok(GatewayNotification {
            event_type: callback.event_type,
            kind: callback.kind,
            provider_transaction_id: callback.provider_transaction_id,
            reference: callback.reference,
            status: callback.status,
            error_code: callback.error_code,
            error_message: callback.error_message,
        })
    }
}
