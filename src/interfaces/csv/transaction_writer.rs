use crate::application::engine::TransactionSummary;
use crate::domain::transaction::TransactionStatus;
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;

#[derive(Debug, Serialize)]
struct TransactionRow<'a> {
    owner: &'a str,
    amount: Decimal,
    currency: &'a str,
    status: TransactionStatus,
    attempts: u32,
    errors: usize,
    last_error: Option<&'a str>,
}

impl<'a> From<&'a TransactionSummary> for TransactionRow<'a> {
    fn from(summary: &'a TransactionSummary) -> Self {
        let tx = &summary.transaction;
        Self {
            owner: &tx.owner,
            amount: tx.amount.value(),
            currency: &tx.currency,
            status: tx.status,
            attempts: summary.attempts,
            errors: summary.errors,
            last_error: summary.last_error_code.as_deref(),
        }
    }
}

/// Writes one CSV row per transaction: owner, amount, currency, final status,
/// retry attempts used, number of recorded errors and the last error code.
pub struct TransactionWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> TransactionWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_summaries<'a>(
        &mut self,
        summaries: impl IntoIterator<Item = &'a TransactionSummary>,
    ) -> Result<()> {
        for summary in summaries {
            self.writer.serialize(TransactionRow::from(summary))?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
