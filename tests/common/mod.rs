#![allow(dead_code)]

use rand::Rng;
use revpay::application::processor::{NewPayment, PaymentProcessor};
use revpay::application::registry::GatewayRegistry;
use revpay::application::webhook::sign;
use revpay::config::ProcessorConfig;
use revpay::domain::gateway::GatewayType;
use revpay::domain::ports::Stores;
use revpay::infrastructure::gateways::SandboxAdapter;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Error;
use std::path::Path;
use std::sync::Arc;

pub struct Harness {
    pub processor: PaymentProcessor,
    pub adapters: HashMap<String, Arc<SandboxAdapter>>,
}

impl Harness {
    pub fn adapter(&self, id: &str) -> &Arc<SandboxAdapter> {
        &self.adapters[id]
    }
}

/// A processor over in-memory stores whose gateways are scriptable sandboxes.
pub fn harness_with(config: ProcessorConfig) -> Harness {
    let mut registry = GatewayRegistry::new();
    let mut adapters = HashMap::new();
    for gateway in &config.gateways {
        let adapter = Arc::new(SandboxAdapter::new(gateway.clone()));
        registry.register(adapter.clone());
        adapters.insert(gateway.id.clone(), adapter);
    }
    let processor = PaymentProcessor::with_gateways(config, Stores::in_memory(), registry)
        .expect("valid sandbox config");
    Harness {
        processor,
        adapters,
    }
}

pub fn harness() -> Harness {
    harness_with(ProcessorConfig::sandbox())
}

/// Sandbox config with a single mobile money gateway, so there is no fallback.
pub fn single_gateway_config() -> ProcessorConfig {
    let mut config = ProcessorConfig::sandbox();
    config.gateways.retain(|g| g.id == "orange-money");
    config
}

pub fn momo(client: &str, amount: Decimal) -> NewPayment {
    NewPayment::new(client, GatewayType::MobileMoney, amount)
        .payer_phone("+23276123456")
        .requested_by("cashier-1")
}

/// Body and headers of a sandbox callback signed with the gateway's secret.
pub fn signed_callback(
    gateway_id: &str,
    body: serde_json::Value,
) -> (BTreeMap<String, String>, Vec<u8>) {
    let body = serde_json::to_vec(&body).expect("json body");
    let signature = sign(&format!("{}-secret", gateway_id), &body).expect("signature");
    let mut headers = BTreeMap::new();
    headers.insert("X-Signature".to_string(), signature);
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    (headers, body)
}

pub fn generate_requests_csv(path: &Path, rows: usize) -> Result<(), Error> {
    let file = File::create(path)?;
    let mut wtr = csv::WriterBuilder::new().from_writer(file);
    wtr.write_record([
        "client",
        "gateway",
        "amount",
        "currency",
        "payer_phone",
        "payer_name",
        "payer_email",
    ])?;

    let mut rng = rand::thread_rng();
    for _ in 0..rows {
        let client = format!("TIN-{}", rng.gen_range(1..=50));
        let (gateway, phone, email) = match rng.gen_range(0..3) {
            0 => (
                "mobile_money",
                format!("+2327{:07}", rng.gen_range(1..9_999_999)),
                String::new(),
            ),
            1 => ("card", String::new(), format!("{}@example.com", client.to_lowercase())),
            _ => ("bank_switch", String::new(), String::new()),
        };
        let amount = Decimal::new(rng.gen_range(100..10_000_000), 2);
        wtr.write_record([
            client.as_str(),
            gateway,
            &amount.to_string(),
            "SLE",
            &phone,
            "",
            &email,
        ])?;
    }

    wtr.flush()?;
    Ok(())
}
