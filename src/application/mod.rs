//! Application layer orchestrating payment attempts and retries.
//!
//! `PaymentRetryEngine` is the entry point. It owns the attempt executor, the
//! callback processor and the retry scheduler, which share one store, gateway
//! and clock through the domain ports and run their work on `tokio` tasks.

pub mod callback;
pub mod engine;
pub mod executor;
pub mod in_flight;
mod outcome;
pub mod scheduler;
pub mod simulation;
