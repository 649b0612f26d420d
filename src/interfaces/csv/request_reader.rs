use crate::application::processor::NewPayment;
use crate::domain::gateway::GatewayType;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

/// One row of a payment request batch.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PaymentRequestRecord {
    pub client: String,
    pub gateway: String,
    pub amount: Decimal,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payer_phone: Option<String>,
    #[serde(default)]
    pub payer_name: Option<String>,
    #[serde(default)]
    pub payer_email: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

impl TryFrom<PaymentRequestRecord> for NewPayment {
    type Error = PaymentError;

    fn try_from(record: PaymentRequestRecord) -> Result<Self> {
        let gateway_type: GatewayType = record.gateway.parse()?;
        Ok(NewPayment {
            currency: non_empty(record.currency),
            payer_phone: non_empty(record.payer_phone),
            payer_name: non_empty(record.payer_name),
            payer_email: non_empty(record.payer_email),
            ..NewPayment::new(record.client, gateway_type, record.amount).requested_by("batch")
        })
    }
}

/// Reads payment requests from a CSV source.
///
/// Whitespace is trimmed and trailing optional columns may be omitted.
pub struct RequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> RequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads and converts rows; a bad row yields an `Err` and the
    /// iterator moves on.
    pub fn requests(self) -> impl Iterator<Item = Result<NewPayment>> {
        self.reader.into_deserialize().map(|result| {
            let record: PaymentRequestRecord = result.map_err(PaymentError::from)?;
            NewPayment::try_from(record)
        })
    }
}
