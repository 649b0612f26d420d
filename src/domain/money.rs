use crate::error::PaymentError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a positive monetary amount for a payment.
///
/// Wraps `rust_decimal::Decimal` so payment amounts are never floats and never
/// zero or negative.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub fn new(value: Decimal) -> Result<Self, PaymentError> {
        if value > Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(PaymentError::ValidationError(
                "Amount must be positive".to_string(),
            ))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = PaymentError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

/// Three-letter currency code, upper case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency(String);

impl Currency {
    pub fn new(code: &str) -> Result<Self, PaymentError> {
        let code = code.trim().to_ascii_uppercase();
        if code.len() == 3 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code))
        } else {
            Err(PaymentError::ValidationError(format!(
                "Invalid currency code '{}'",
                code
            )))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Currency {
    type Error = PaymentError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(currency: Currency) -> Self {
        currency.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Gross amount, gateway fee and what is left for the revenue authority.
///
/// Construction is the only way to obtain one, so `net_amount == amount - fee`
/// holds for every value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeeBreakdown {
    amount: Decimal,
    fee: Decimal,
    net_amount: Decimal,
}

impl FeeBreakdown {
    pub fn new(amount: Amount, fee: Decimal) -> Result<Self, PaymentError> {
        if fee < Decimal::ZERO {
            return Err(PaymentError::ValidationError(
                "Fee cannot be negative".to_string(),
            ));
        }
        if fee >= amount.value() {
            return Err(PaymentError::ValidationError(format!(
                "Fee {} consumes the whole amount {}",
                fee,
                amount.value()
            )));
        }
        Ok(Self {
            amount: amount.value(),
            fee,
            net_amount: amount.value() - fee,
        })
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn fee(&self) -> Decimal {
        self.fee
    }

    pub fn net_amount(&self) -> Decimal {
        self.net_amount
    }
}
