use crate::application::engine::NewPayment;
use crate::config::RetrySettings;
use crate::domain::retry_policy::RetryStrategy;
use crate::domain::transaction::Amount;
use crate::error::{PaymentError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;

/// One row of a payment request file.
///
/// The retry columns are optional; a row without them uses the configured
/// defaults when `allow_retry` is true.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct PaymentRequest {
    pub owner: String,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default)]
    pub allow_retry: bool,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub base_interval_secs: Option<u64>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl TryFrom<PaymentRequest> for NewPayment {
    type Error = PaymentError;

    fn try_from(request: PaymentRequest) -> Result<Self> {
        let retry = if request.allow_retry {
            Some(RetrySettings {
                max_attempts: request.max_attempts,
                base_interval: request.base_interval_secs.map(Duration::from_secs),
                strategy: request
                    .strategy
                    .as_deref()
                    .filter(|s| !s.is_empty())
                    .map(str::parse::<RetryStrategy>)
                    .transpose()?,
            })
        } else {
            None
        };

        Ok(NewPayment {
            owner: request.owner,
            amount: Amount::new(request.amount)?,
            currency: request.currency,
            gateway: request.gateway.filter(|g| !g.is_empty()),
            retry,
        })
    }
}

/// Reads payment requests from a CSV source.
///
/// This reader wraps `csv::Reader` and yields one `Result<NewPayment>` per row.
/// It handles whitespace trimming and flexible record lengths automatically.
pub struct PaymentRequestReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> PaymentRequestReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily reads, deserializes and validates requests.
    pub fn requests(self) -> impl Iterator<Item = Result<NewPayment>> {
        self.reader.into_deserialize().map(|result| {
            result
                .map_err(PaymentError::from)
                .and_then(|request: PaymentRequest| NewPayment::try_from(request))
        })
    }
}
