//! Retry eligibility of gateway failure codes.
//!
//! Every failure path (gateway callbacks, executor faults, stale-attempt
//! reconciliation) consults this module and nothing else.

/// Synthetic code recorded when an attempt fails before reaching the gateway.
pub const ASYNC_EXECUTION_ERROR: &str = "ASYNC_EXECUTION_ERROR";
/// Code recorded when a failure callback does not carry one.
pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
pub const GATEWAY_TIMEOUT: &str = "GATEWAY_TIMEOUT";
pub const TEMPORARY_FAILURE: &str = "TEMPORARY_FAILURE";

const NETWORK_PREFIX: &str = "NETWORK_";

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum FailureClass {
    Transient,
    Terminal,
}

pub fn classify(error_code: &str) -> FailureClass {
    if error_code.starts_with(NETWORK_PREFIX)
        || error_code == GATEWAY_TIMEOUT
        || error_code == TEMPORARY_FAILURE
    {
        FailureClass::Transient
    } else {
        FailureClass::Terminal
    }
}

/// Unknown codes are terminal.
pub fn is_retry_eligible(error_code: &str) -> bool {
    classify(error_code) == FailureClass::Transient
}
