use super::circuit_breaker::{CircuitBreakerRegistry, Permit};
use crate::config::GatewayConfig;
use crate::domain::gateway::{GatewayAdapterRef, GatewayType};
use crate::error::{PaymentError, Result};
use crate::infrastructure::gateways::build_adapter;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

/// Adapters by gateway id, kept in registration order so the first
/// registered gateway of a rail is the primary and later ones are fallbacks.
#[derive(Default, Clone)]
pub struct GatewayRegistry {
    order: Vec<String>,
    adapters: HashMap<String, GatewayAdapterRef>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(gateways: &[GatewayConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for config in gateways {
            registry.register(build_adapter(config)?);
        }
        Ok(registry)
    }

    /// Adds an adapter, replacing one with the same id.
    pub fn register(&mut self, adapter: GatewayAdapterRef) {
        let id = adapter.id().to_string();
        if self.adapters.insert(id.clone(), adapter).is_none() {
            self.order.push(id);
        }
    }

    pub fn lookup(&self, gateway_id: &str) -> Option<GatewayAdapterRef> {
        self.adapters.get(gateway_id).cloned()
    }

    /// Active adapters for a rail, primary first.
    pub fn candidates(&self, gateway_type: GatewayType) -> Vec<GatewayAdapterRef> {
        self.order
            .iter()
            .filter_map(|id| self.adapters.get(id))
            .filter(|a| a.gateway_type() == gateway_type && a.config().is_active)
            .cloned()
            .collect()
    }

    /// First active adapter of `gateway_type` whose breaker admits a call.
    ///
    /// When every candidate is open the error carries the earliest time one
    /// of them will accept a probe.
    pub fn select(
        &self,
        gateway_type: GatewayType,
        breakers: &CircuitBreakerRegistry,
        now: DateTime<Utc>,
    ) -> Result<(GatewayAdapterRef, Permit)> {
        let mut earliest: Option<DateTime<Utc>> = None;
        for adapter in self.candidates(gateway_type) {
            match breakers.try_acquire(adapter.id(), now) {
                Ok(permit) => return Ok((adapter, permit)),
                Err(PaymentError::CircuitOpen { gateway, retry_at }) => {
                    debug!(%gateway, %retry_at, "Skipping gateway with open circuit");
                    earliest = Some(earliest.map_or(retry_at, |e| e.min(retry_at)));
                }
                Err(e) => return Err(e),
            }
        }
        Err(PaymentError::NoGatewayAvailable {
            gateway_type: gateway_type.to_string(),
            retry_at: earliest,
        })
    }
}
