//! CSV input of payment requests and CSV output of transaction outcomes.

pub mod request_reader;
pub mod transaction_writer;
