use super::transaction::TransactionId;
use crate::error::{ConflictReason, PaymentError, Result};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Upper bound for any computed backoff delay, whether or not a cap is configured.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    Fixed,
    #[default]
    Exponential,
}

impl FromStr for RetryStrategy {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(RetryStrategy::Fixed),
            "exponential" => Ok(RetryStrategy::Exponential),
            other => Err(PaymentError::ValidationError(format!(
                "Unknown retry strategy '{}'",
                other
            ))),
        }
    }
}

/// Retry budget and backoff state bound to a single transaction.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct RetryPolicy {
    pub transaction_id: TransactionId,
    pub max_attempts: u32,
    pub base_interval: Duration,
    pub max_interval: Option<Duration>,
    pub strategy: RetryStrategy,
    pub current_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RetryPolicy {
    pub fn new(
        transaction_id: TransactionId,
        max_attempts: u32,
        base_interval: Duration,
        strategy: RetryStrategy,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(PaymentError::ValidationError(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if base_interval.is_zero() {
            return Err(PaymentError::ValidationError(
                "base_interval must be positive".to_string(),
            ));
        }

        Ok(Self {
            transaction_id,
            max_attempts,
            base_interval,
            max_interval: None,
            strategy,
            current_attempts: 0,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn with_max_interval(mut self, cap: Option<Duration>) -> Self {
        self.max_interval = cap;
        self
    }

    pub fn is_exhausted(&self) -> bool {
        self.current_attempts >= self.max_attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.current_attempts)
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_exhausted() && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Delay before retry number `attempt_number` (1-based).
    pub fn backoff_delay(&self, attempt_number: u32) -> Duration {
        let delay = match self.strategy {
            RetryStrategy::Fixed => self.base_interval,
            RetryStrategy::Exponential => 2u32
                .checked_pow(attempt_number.saturating_sub(1))
                .and_then(|factor| self.base_interval.checked_mul(factor))
                .unwrap_or(BACKOFF_CEILING),
        };

        let capped = match self.max_interval {
            Some(cap) => delay.min(cap),
            None => delay,
        };
        capped.min(BACKOFF_CEILING)
    }

    pub fn compute_next_retry_time(
        &self,
        attempt_number: u32,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.backoff_delay(attempt_number))
            .unwrap_or_else(|_| TimeDelta::seconds(BACKOFF_CEILING.as_secs() as i64));
        now + delay
    }

    /// Debits one attempt from the budget. Called once per dispatch.
    pub fn record_attempt_start(&mut self, now: DateTime<Utc>) -> Result<u32> {
        if self.is_exhausted() {
            return Err(ConflictReason::RetriesExhausted {
                attempts: self.current_attempts,
                max_attempts: self.max_attempts,
            }
            .into());
        }
        self.current_attempts += 1;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(self.current_attempts)
    }

    pub fn arm(&mut self, next_retry_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.next_retry_at = Some(next_retry_at);
        self.updated_at = now;
    }

    pub fn disarm(&mut self, now: DateTime<Utc>) {
        self.next_retry_at = None;
        self.updated_at = now;
    }
}
