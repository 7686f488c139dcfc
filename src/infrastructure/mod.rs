//! Adapters for the domain ports: stores, clocks, notifications and the
//! simulated gateway.

pub mod clock;
pub mod in_memory;
pub mod notifier;
#[cfg(feature = "storage-rocksdb")]
pub mod rocksdb;
pub mod simulated_gateway;
