//! Command-line front end of the sink

pub mod commands;
pub mod error;

pub use error::CliError;
