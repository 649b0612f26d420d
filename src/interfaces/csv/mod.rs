//! Batch file formats used by the command-line driver.

pub mod request_reader;
pub mod transaction_writer;
