use crate::domain::transaction::PaymentTransaction;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct TransactionRecord<'a> {
    reference: &'a str,
    client: &'a str,
    gateway: &'a str,
    status: &'a str,
    amount: Decimal,
    fee: Decimal,
    net_amount: Decimal,
    currency: &'a str,
    retry_count: u32,
}

impl<'a> From<&'a PaymentTransaction> for TransactionRecord<'a> {
    fn from(tx: &'a PaymentTransaction) -> Self {
        Self {
            reference: &tx.reference,
            client: &tx.client_id,
            gateway: tx.gateway_id.as_deref().unwrap_or(tx.gateway_type.as_str()),
            status: tx.status.as_str(),
            amount: tx.amount,
            fee: tx.fee,
            net_amount: tx.net_amount,
            currency: tx.currency.as_str(),
            retry_count: tx.retry_count,
        }
    }
}

/// Writes the final transaction table as CSV.
pub struct TransactionWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> TransactionWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_transactions<'a, I>(&mut self, transactions: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a PaymentTransaction>,
    {
        for tx in transactions {
            self.writer.serialize(TransactionRecord::from(tx))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
