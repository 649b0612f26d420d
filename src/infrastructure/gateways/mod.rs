//! Provider adapters.

pub mod bank_switch;
pub mod card;
pub mod http;
pub mod mobile_money;
pub mod sandbox;

pub use bank_switch::BankSwitchAdapter;
pub use card::CardAdapter;
pub use mobile_money::MobileMoneyAdapter;
pub use sandbox::SandboxAdapter;

use crate::config::GatewayConfig;
use crate::domain::gateway::{GatewayAdapterRef, GatewayType};
use crate::error::Result;
use std::sync::Arc;

/// Builds the adapter for one configured gateway. Test-mode gateways get the
/// sandbox regardless of their rail.
pub fn build_adapter(config: &GatewayConfig) -> Result<GatewayAdapterRef> {
    if config.test_mode {
        return Ok(Arc::new(SandboxAdapter::new(config.clone())));
    }
    let adapter: GatewayAdapterRef = match config.gateway_type {
        GatewayType::MobileMoney => Arc::new(MobileMoneyAdapter::new(config.clone())?),
        GatewayType::Card => Arc::new(CardAdapter::new(config.clone())?),
        GatewayType::BankSwitch => Arc::new(BankSwitchAdapter::new(config.clone())?),
    };
    Ok(adapter)
}
