//! Entities, transition rules and the ports the application layer talks through.

pub mod classifier;
pub mod error_entry;
pub mod lifecycle;
pub mod ports;
pub mod retry_policy;
pub mod transaction;
