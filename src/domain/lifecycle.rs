//! Status transitions driven by the outcome of a payment attempt.

use super::classifier::ASYNC_EXECUTION_ERROR;
use super::error_entry::ErrorEntry;
use super::retry_policy::RetryPolicy;
use super::transaction::{Transaction, TransactionStatus};
use crate::error::{ConflictReason, Result};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The gateway confirmed the payment at `completed_at`.
    Succeeded { completed_at: DateTime<Utc> },
    /// The gateway reported a failure with a classifiable code.
    Declined {
        error_code: String,
        error_message: Option<String>,
    },
    /// The attempt broke before a gateway outcome could be produced.
    ExecutionFault { message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Ineligible,
    Exhausted,
    NoRetryPolicy,
    ExecutionFault,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Succeeded,
    RetryScheduled { next_retry_at: DateTime<Utc> },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub resolution: Resolution,
    pub error_entry: Option<ErrorEntry>,
}

/// Applies an attempt outcome to a transaction and its optional policy.
///
/// A SUCCESS transaction is never touched; the call reports
/// [`ConflictReason::AlreadySucceeded`] so redeliveries can be discarded.
/// A success is accepted from every other status, FAILED included, even when
/// that failure came from a terminal code: a late gateway success still
/// settles the payment and disarms any pending retry.
/// Declines are only accepted while an attempt is in flight. Execution
/// faults are accepted from any non-terminal status and always end in FAILED.
/// The attempt counter is never incremented here.
pub fn apply_outcome(
    tx: &mut Transaction,
    policy: &mut Option<RetryPolicy>,
    outcome: AttemptOutcome,
    now: DateTime<Utc>,
) -> Result<Applied> {
    if tx.status == TransactionStatus::Success {
        return Err(ConflictReason::AlreadySucceeded.into());
    }

    let attempt = policy.as_ref().map_or(0, |p| p.current_attempts);

    match outcome {
        AttemptOutcome::Succeeded { completed_at } => {
            tx.complete(completed_at, now);
            if let Some(p) = policy.as_mut() {
                p.disarm(now);
            }
            Ok(Applied {
                resolution: Resolution::Succeeded,
                error_entry: None,
            })
        }
        AttemptOutcome::Declined {
            error_code,
            error_message,
        } => {
            if !tx.has_attempt_in_flight() {
                return Err(ConflictReason::NoAttemptInFlight(tx.status).into());
            }

            let entry = ErrorEntry::new(tx.id, error_code, error_message, attempt, now);
            let refusal = if !entry.retry_eligible {
                Some(FailureReason::Ineligible)
            } else {
                match policy.as_ref() {
                    None => Some(FailureReason::NoRetryPolicy),
                    Some(p) if p.is_exhausted() => Some(FailureReason::Exhausted),
                    Some(_) => None,
                }
            };

            let resolution = match (refusal, policy.as_mut()) {
                (None, Some(p)) => {
                    let next_retry_at = p.compute_next_retry_time(p.current_attempts + 1, now);
                    p.arm(next_retry_at, now);
                    tx.schedule_retry(now);
                    Resolution::RetryScheduled { next_retry_at }
                }
                (reason, p) => fail(tx, p, reason.unwrap_or(FailureReason::NoRetryPolicy), now),
            };

            Ok(Applied {
                resolution,
                error_entry: Some(entry),
            })
        }
        AttemptOutcome::ExecutionFault { message } => {
            let entry = ErrorEntry::new(tx.id, ASYNC_EXECUTION_ERROR, Some(message), attempt, now);
            let resolution = fail(tx, policy.as_mut(), FailureReason::ExecutionFault, now);
            Ok(Applied {
                resolution,
                error_entry: Some(entry),
            })
        }
    }
}

fn fail(
    tx: &mut Transaction,
    policy: Option<&mut RetryPolicy>,
    reason: FailureReason,
    now: DateTime<Utc>,
) -> Resolution {
    tx.fail(now);
    if let Some(p) = policy {
        p.disarm(now);
    }
    Resolution::Failed { reason }
}
