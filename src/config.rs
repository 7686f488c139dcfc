//! Runtime configuration for retry defaults and the scheduler.

use crate::domain::retry_policy::{RetryPolicy, RetryStrategy};
use crate::domain::transaction::TransactionId;
use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Per-transaction overrides of the retry defaults. Unset fields fall back
/// to [`RetryConfig`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrySettings {
    pub max_attempts: Option<u32>,
    pub base_interval: Option<Duration>,
    pub strategy: Option<RetryStrategy>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub default_max_attempts: u32,
    pub default_base_interval: Duration,
    /// Smallest base interval a policy may be given.
    pub min_interval: Duration,
    /// Cap applied to every computed backoff delay.
    pub max_interval: Option<Duration>,
    pub default_strategy: RetryStrategy,
    pub poll_period: Duration,
    /// How long an attempt may wait for its callback before the scheduler
    /// treats it as a gateway timeout. `None` disables the sweep.
    pub stale_after: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_base_interval: Duration::from_secs(60),
            min_interval: Duration::from_secs(30),
            max_interval: Some(Duration::from_secs(60 * 60)),
            default_strategy: RetryStrategy::Exponential,
            poll_period: Duration::from_secs(60),
            stale_after: Some(Duration::from_secs(15 * 60)),
        }
    }
}

impl RetryConfig {
    /// Reads `PAYRETRY_*` variables, falling back to defaults for unset ones.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup.
    ///
    /// Recognised keys: `PAYRETRY_MAX_ATTEMPTS`, `PAYRETRY_BASE_INTERVAL_SECS`,
    /// `PAYRETRY_MIN_INTERVAL_SECS`, `PAYRETRY_MAX_INTERVAL_SECS` (0 disables
    /// the cap), `PAYRETRY_STRATEGY`, `PAYRETRY_POLL_INTERVAL_SECS` and
    /// `PAYRETRY_STALE_AFTER_SECS` (0 disables the sweep).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            default_max_attempts: parse(&lookup, "PAYRETRY_MAX_ATTEMPTS")?
                .unwrap_or(defaults.default_max_attempts),
            default_base_interval: secs(&lookup, "PAYRETRY_BASE_INTERVAL_SECS")?
                .unwrap_or(defaults.default_base_interval),
            min_interval: secs(&lookup, "PAYRETRY_MIN_INTERVAL_SECS")?
                .unwrap_or(defaults.min_interval),
            max_interval: optional_secs(&lookup, "PAYRETRY_MAX_INTERVAL_SECS")?
                .unwrap_or(defaults.max_interval),
            default_strategy: match lookup("PAYRETRY_STRATEGY") {
                Some(value) => value.parse()?,
                None => defaults.default_strategy,
            },
            poll_period: secs(&lookup, "PAYRETRY_POLL_INTERVAL_SECS")?
                .unwrap_or(defaults.poll_period),
            stale_after: optional_secs(&lookup, "PAYRETRY_STALE_AFTER_SECS")?
                .unwrap_or(defaults.stale_after),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_max_attempts == 0 {
            return Err(invalid("max attempts must be at least 1"));
        }
        if self.poll_period.is_zero() {
            return Err(invalid("poll interval must be positive"));
        }
        if self.min_interval.is_zero() {
            return Err(invalid("minimum retry interval must be positive"));
        }
        if self.default_base_interval < self.min_interval {
            return Err(invalid("default base interval is below the minimum interval"));
        }
        if self.max_interval.is_some_and(|cap| cap < self.min_interval) {
            return Err(invalid("maximum retry interval is below the minimum interval"));
        }
        Ok(())
    }

    /// Resolves `settings` against the defaults and builds a fresh policy.
    pub fn build_policy(
        &self,
        transaction_id: TransactionId,
        settings: &RetrySettings,
        now: DateTime<Utc>,
    ) -> Result<RetryPolicy> {
        let base_interval = settings.base_interval.unwrap_or(self.default_base_interval);
        self.check_base_interval(base_interval)?;

        let policy = RetryPolicy::new(
            transaction_id,
            settings.max_attempts.unwrap_or(self.default_max_attempts),
            base_interval,
            settings.strategy.unwrap_or(self.default_strategy),
            now,
        )?;
        Ok(policy.with_max_interval(self.max_interval))
    }

    pub(crate) fn check_base_interval(&self, base_interval: Duration) -> Result<()> {
        if base_interval < self.min_interval {
            return Err(PaymentError::ValidationError(format!(
                "base interval {}s is below the minimum of {}s",
                base_interval.as_secs(),
                self.min_interval.as_secs()
            )));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> PaymentError {
    PaymentError::ValidationError(format!("Invalid retry configuration: {}", message))
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                PaymentError::ValidationError(format!("{} has invalid value '{}': {}", key, raw, e))
            })
        })
        .transpose()
}

fn secs<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<F, u64>(lookup, key)?.map(Duration::from_secs))
}

/// Like [`secs`], but `0` means "disabled".
fn optional_secs<F>(lookup: &F, key: &str) -> Result<Option<Option<Duration>>>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(secs(lookup, key)?.map(|d| (!d.is_zero()).then_some(d)))
}
