//! Processor and gateway configuration.
//!
//! Configuration is read from a JSON document. Monetary values may be written
//! as strings (`"500000"`) or numbers; they are always held as `Decimal`.

use crate::domain::gateway::GatewayType;
use crate::error::{PaymentError, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Circuit breaker policy for one gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// Failures further apart than this do not count as consecutive.
    pub failure_window_seconds: u64,
    /// Cooldown after the first trip.
    pub open_seconds: u64,
    /// Upper bound for the cooldown after repeated failed probes.
    pub max_open_seconds: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_seconds: 60,
            open_seconds: 30,
            max_open_seconds: 600,
        }
    }
}

const MAX_BACKOFF_SECONDS: u64 = 365 * 24 * 3600;

fn default_timeout_seconds() -> u64 {
    30
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    60
}

fn default_max_retry_delay_seconds() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// Settings for a single provider integration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub id: String,
    pub name: String,
    pub gateway_type: GatewayType,
    pub endpoint: String,
    #[serde(default)]
    pub merchant_id: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub webhook_secret: String,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    #[serde(default)]
    pub daily_limit: Option<Decimal>,
    #[serde(default)]
    pub monthly_limit: Option<Decimal>,
    #[serde(default)]
    pub fee_percentage: Decimal,
    #[serde(default)]
    pub fee_fixed: Decimal,
    #[serde(default)]
    pub fee_min: Option<Decimal>,
    #[serde(default)]
    pub fee_max: Option<Decimal>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_max_retry_delay_seconds")]
    pub max_retry_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl GatewayConfig {
    /// A test-mode gateway with permissive limits.
    pub fn sandbox(id: &str, gateway_type: GatewayType) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            gateway_type,
            endpoint: format!("https://sandbox.invalid/{}", id),
            merchant_id: "SANDBOX".to_string(),
            api_key: String::new(),
            webhook_secret: format!("{}-secret", id),
            min_amount: dec!(1),
            max_amount: dec!(100000000),
            daily_limit: None,
            monthly_limit: None,
            fee_percentage: dec!(1.5),
            fee_fixed: Decimal::ZERO,
            fee_min: Some(dec!(1)),
            fee_max: Some(dec!(5000)),
            timeout_seconds: default_timeout_seconds(),
            retry_attempts: default_retry_attempts(),
            retry_delay_seconds: default_retry_delay_seconds(),
            max_retry_delay_seconds: default_max_retry_delay_seconds(),
            is_active: true,
            test_mode: true,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// `fee_fixed + amount * fee_percentage / 100`, clamped to the configured
    /// bounds and rounded to two decimal places.
    pub fn calculate_fee(&self, amount: Decimal) -> Decimal {
        let mut fee = self.fee_fixed + amount * self.fee_percentage / dec!(100);
        if let Some(min) = self.fee_min {
            fee = fee.max(min);
        }
        if let Some(max) = self.fee_max {
            fee = fee.min(max);
        }
        fee.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> chrono::Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let seconds = self
            .retry_delay_seconds
            .saturating_mul(factor)
            .min(self.max_retry_delay_seconds)
            .min(MAX_BACKOFF_SECONDS);
        chrono::Duration::seconds(seconds as i64)
    }

    pub fn check_amount(&self, amount: Decimal) -> Result<()> {
        if amount < self.min_amount {
            return Err(PaymentError::ValidationError(format!(
                "Amount {} is below the minimum {} for gateway {}",
                amount, self.min_amount, self.id
            )));
        }
        if amount > self.max_amount {
            return Err(PaymentError::ValidationError(format!(
                "Amount {} exceeds the maximum {} for gateway {}",
                amount, self.max_amount, self.id
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(PaymentError::ConfigError("Gateway id is empty".to_string()));
        }
        if self.min_amount <= Decimal::ZERO || self.min_amount > self.max_amount {
            return Err(PaymentError::ConfigError(format!(
                "Gateway {} has an invalid amount range {}..{}",
                self.id, self.min_amount, self.max_amount
            )));
        }
        if self.fee_percentage < Decimal::ZERO || self.fee_fixed < Decimal::ZERO {
            return Err(PaymentError::ConfigError(format!(
                "Gateway {} has a negative fee setting",
                self.id
            )));
        }
        if let (Some(min), Some(max)) = (self.fee_min, self.fee_max)
            && min > max
        {
            return Err(PaymentError::ConfigError(format!(
                "Gateway {} has fee_min greater than fee_max",
                self.id
            )));
        }
        if self.timeout_seconds == 0 {
            return Err(PaymentError::ConfigError(format!(
                "Gateway {} needs a non-zero timeout",
                self.id
            )));
        }
        if self.retry_attempts == 0 {
            return Err(PaymentError::ConfigError(format!(
                "Gateway {} needs at least one attempt",
                self.id
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(PaymentError::ConfigError(format!(
                "Gateway {} needs a non-zero circuit breaker threshold",
                self.id
            )));
        }
        Ok(())
    }
}

/// Approver roles required for amounts at or above `min_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalBand {
    pub min_amount: Decimal,
    pub roles: Vec<String>,
}

fn default_ttl_minutes() -> i64 {
    24 * 60
}

fn default_currency() -> String {
    "SLE".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub approval_threshold: Decimal,
    #[serde(default)]
    pub approval_bands: Vec<ApprovalBand>,
    #[serde(default = "default_ttl_minutes")]
    pub transaction_ttl_minutes: i64,
    #[serde(default)]
    pub high_risk_amount: Option<Decimal>,
    #[serde(default = "default_currency")]
    pub default_currency: String,
    pub gateways: Vec<GatewayConfig>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::sandbox()
    }
}

impl ProcessorConfig {
    /// Built-in configuration with one test-mode gateway per rail.
    pub fn sandbox() -> Self {
        Self {
            approval_threshold: dec!(500000),
            approval_bands: vec![
                ApprovalBand {
                    min_amount: dec!(500000),
                    roles: vec!["supervisor".to_string()],
                },
                ApprovalBand {
                    min_amount: dec!(1000000),
                    roles: vec!["supervisor".to_string(), "finance_manager".to_string()],
                },
            ],
            transaction_ttl_minutes: default_ttl_minutes(),
            high_risk_amount: Some(dec!(2000000)),
            default_currency: default_currency(),
            gateways: vec![
                GatewayConfig::sandbox("orange-money", GatewayType::MobileMoney),
                GatewayConfig::sandbox("afrimoney", GatewayType::MobileMoney),
                GatewayConfig::sandbox("visa-card", GatewayType::Card),
                GatewayConfig::sandbox("bank-switch", GatewayType::BankSwitch),
            ],
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.approval_threshold <= Decimal::ZERO {
            return Err(PaymentError::ConfigError(
                "approval_threshold must be positive".to_string(),
            ));
        }
        if self.approval_bands.is_empty() {
            return Err(PaymentError::ConfigError(
                "At least one approval band is required".to_string(),
            ));
        }
        for pair in self.approval_bands.windows(2) {
            if pair[0].min_amount >= pair[1].min_amount {
                return Err(PaymentError::ConfigError(
                    "approval_bands must be sorted by ascending min_amount".to_string(),
                ));
            }
        }
        if self.approval_bands[0].min_amount > self.approval_threshold {
            return Err(PaymentError::ConfigError(
                "The first approval band must start at or below approval_threshold".to_string(),
            ));
        }
        if self.approval_bands.iter().any(|band| band.roles.is_empty()) {
            return Err(PaymentError::ConfigError(
                "Every approval band needs at least one role".to_string(),
            ));
        }
        if self.transaction_ttl_minutes <= 0 {
            return Err(PaymentError::ConfigError(
                "transaction_ttl_minutes must be positive".to_string(),
            ));
        }
        let mut ids = std::collections::HashSet::new();
        for gateway in &self.gateways {
            gateway.validate()?;
            if !ids.insert(gateway.id.as_str()) {
                return Err(PaymentError::ConfigError(format!(
                    "Duplicate gateway id {}",
                    gateway.id
                )));
            }
        }
        Ok(())
    }

    pub fn requires_approval(&self, amount: Decimal) -> bool {
        amount >= self.approval_threshold
    }

    /// Ordered roles that must sign off an amount.
    pub fn approval_chain(&self, amount: Decimal) -> Vec<String> {
        self.approval_bands
            .iter()
            .rev()
            .find(|band| band.min_amount <= amount)
            .or_else(|| self.approval_bands.first())
            .map(|band| band.roles.clone())
            .unwrap_or_default()
    }

    pub fn gateway(&self, id: &str) -> Option<&GatewayConfig> {
        self.gateways.iter().find(|g| g.id == id)
    }

    /// First active gateway configured for a rail.
    pub fn primary_gateway(&self, gateway_type: GatewayType) -> Option<&GatewayConfig> {
        self.gateways
            .iter()
            .find(|g| g.gateway_type == gateway_type && g.is_active)
    }
}
